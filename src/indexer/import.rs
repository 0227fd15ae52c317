//! Ordered block import.
//!
//! Consumes a stream of blocks in strictly increasing height order and runs
//! each through the pipeline inside one database transaction: block data,
//! link events, and the checkpoint commit together or not at all. A failed
//! commit retries the whole block with backoff; cancellation between or
//! during blocks abandons uncommitted work with no observable side effects.

use std::time::Duration;

use futures::{Stream, StreamExt};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::config::ImportConfig;
use crate::db::accounts::AccountLookup;
use crate::db::repository;
use crate::indexer::source::BlockData;
use crate::modules::resolver::DurableLinks;
use crate::pipeline::{BlockCounts, BlockPipeline};

/// Drive the import until the source ends, shutdown is requested, or an
/// unrecoverable error occurs.
pub async fn run_import<S, D, L>(
    mut blocks: S,
    pool: PgPool,
    mut pipeline: BlockPipeline<D, L>,
    shutdown: CancellationToken,
    config: &ImportConfig,
) -> eyre::Result<()>
where
    S: Stream<Item = eyre::Result<BlockData>> + Unpin,
    D: DurableLinks,
    L: AccountLookup,
{
    let mut last_height = repository::last_imported_height(&pool).await?;
    if let Some(height) = last_height {
        tracing::info!(height, "Resuming import after checkpoint");
    }

    loop {
        let block = tokio::select! {
            maybe = blocks.next() => match maybe {
                Some(Ok(block)) => block,
                Some(Err(err)) => return Err(err.wrap_err("block source failed")),
                None => {
                    tracing::info!("Block source ended, stopping import");
                    break;
                }
            },
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown received, stopping import");
                break;
            }
        };

        // The resolver's pending-write visibility assumes heights only move
        // forward; a stale or duplicate block means the scheduler is broken.
        if let Some(height) = last_height {
            if block.height <= height {
                eyre::bail!(
                    "block {} arrived at or below already-imported height {}",
                    block.height,
                    height
                );
            }
        }

        let outcome = tokio::select! {
            result = import_block(&pool, &mut pipeline, &block, config) => Some(result),
            _ = shutdown.cancelled() => None,
        };

        match outcome {
            Some(result) => {
                let counts = result?;
                last_height = Some(block.height);
                log_imported(block.height, &counts);
            }
            None => {
                // The in-flight transaction was dropped without committing.
                pipeline.finish_block();
                tracing::info!(
                    height = block.height,
                    "Shutdown received mid-block, discarding uncommitted work"
                );
                break;
            }
        }
    }

    Ok(())
}

/// Import one block, retrying the whole unit of work on failure.
async fn import_block<D: DurableLinks, L: AccountLookup>(
    pool: &PgPool,
    pipeline: &mut BlockPipeline<D, L>,
    block: &BlockData,
    config: &ImportConfig,
) -> eyre::Result<BlockCounts> {
    let mut delay = Duration::from_millis(config.retry_delay_ms);
    let mut attempt = 1u32;

    loop {
        match try_import_block(pool, pipeline, block).await {
            Ok(counts) => return Ok(counts),
            Err(err) if attempt < config.max_commit_attempts => {
                tracing::warn!(
                    height = block.height,
                    attempt,
                    max_attempts = config.max_commit_attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Block import failed, retrying whole block"
                );
                // Nothing was committed; regenerate everything on retry.
                pipeline.finish_block();
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                attempt += 1;
            }
            Err(err) => {
                pipeline.finish_block();
                return Err(err.wrap_err(format!(
                    "importing block {} failed after {} attempts",
                    block.height, attempt
                )));
            }
        }
    }
}

async fn try_import_block<D: DurableLinks, L: AccountLookup>(
    pool: &PgPool,
    pipeline: &mut BlockPipeline<D, L>,
    block: &BlockData,
) -> eyre::Result<BlockCounts> {
    let mut tx = pool.begin().await?;
    let counts = pipeline.process_block(&mut tx, block).await?;
    repository::set_imported_height(&mut tx, block.height).await?;
    tx.commit().await?;
    pipeline.finish_block();
    Ok(counts)
}

fn log_imported(height: u64, counts: &BlockCounts) {
    tracing::info!(
        height,
        decoded = counts.events_decoded,
        skipped = counts.events_skipped,
        malformed = counts.events_malformed,
        replayed = counts.events_replayed,
        token_rows = counts.token_rows,
        balance_rows = counts.balance_rows,
        link_rows = counts.link_rows,
        balances_dropped = counts.balances_dropped,
        "Imported block"
    );
}
