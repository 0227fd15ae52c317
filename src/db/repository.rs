//! Batch writes for one import unit of work.
//!
//! Every function here takes the import transaction's connection, so all
//! writes for a block commit or roll back together. Supply and balance rows
//! are accumulate-upserts built by one shared statement builder; rows are
//! pre-aggregated per natural key first because Postgres rejects an
//! `ON CONFLICT DO UPDATE` that touches the same row twice in a statement.

use std::collections::{BTreeMap, HashSet};

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::query_builder::Separated;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};

use crate::indexer::types::{
    ChainPosition, ContractAddress, ModuleLinkEvent, TokenId, TokenUpdate, TokenUpdateKind,
};

/// Multi-row statements are chunked to stay within PostgreSQL parameter
/// limits.
const BATCH_CHUNK: usize = 1000;

/// One row for the append-only `token_events` ledger.
#[derive(Debug, Clone)]
pub struct TokenEventRow {
    pub position: ChainPosition,
    pub contract: ContractAddress,
    pub token_id: Option<String>,
    pub event_type: &'static str,
    pub payload: serde_json::Value,
    pub block_time: DateTime<Utc>,
}

/// A balance update whose account address survived id resolution.
#[derive(Debug, Clone)]
pub struct ResolvedBalanceUpdate {
    pub contract: ContractAddress,
    pub token_id: TokenId,
    pub account_id: i64,
    pub delta: BigDecimal,
}

/// Insert ledger rows, returning the positions that were actually new.
///
/// The position is the primary key, so a conflicting insert means the event
/// was imported by an earlier committed batch; callers must skip the deltas
/// derived from such events to keep re-imports exactly-once.
pub async fn record_token_events(
    conn: &mut PgConnection,
    rows: &[TokenEventRow],
) -> eyre::Result<HashSet<ChainPosition>> {
    let mut fresh = HashSet::with_capacity(rows.len());
    for chunk in rows.chunks(BATCH_CHUNK) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO token_events (block_height, transaction_index, event_index, \
             contract_index, contract_subindex, token_id, event_type, event, block_time) ",
        );
        builder.push_values(chunk, |mut b, row| {
            b.push_bind(row.position.block_height as i64)
                .push_bind(row.position.transaction_index as i64)
                .push_bind(row.position.event_index as i64)
                .push_bind(row.contract.index as i64)
                .push_bind(row.contract.subindex as i64)
                .push_bind(row.token_id.as_deref())
                .push_bind(row.event_type)
                .push_bind(&row.payload)
                .push_bind(row.block_time);
        });
        builder.push(
            " ON CONFLICT (block_height, transaction_index, event_index) DO NOTHING \
             RETURNING block_height, transaction_index, event_index",
        );

        let inserted: Vec<(i64, i64, i64)> =
            builder.build_query_as().fetch_all(&mut *conn).await?;
        fresh.extend(inserted.into_iter().map(|(height, tx_index, ev_index)| {
            ChainPosition::new(height as u64, tx_index as u64, ev_index as u32)
        }));
    }
    Ok(fresh)
}

/// Apply token-level updates: supply deltas accumulate, metadata replaces.
pub async fn apply_token_updates(
    conn: &mut PgConnection,
    updates: &[TokenUpdate],
) -> eyre::Result<u64> {
    let (supply_rows, metadata_rows) = split_token_updates(updates);
    let mut affected = 0;

    affected += accumulate_batch(
        conn,
        "INSERT INTO tokens (contract_index, contract_subindex, token_id, supply) ",
        &accumulate_conflict_clause(
            "tokens",
            &["contract_index", "contract_subindex", "token_id"],
            &["supply"],
        ),
        &supply_rows,
        |mut b, row| {
            b.push_bind(row.contract.index as i64)
                .push_bind(row.contract.subindex as i64)
                .push_bind(&row.token_id)
                .push_bind(&row.delta);
        },
    )
    .await?;

    for chunk in metadata_rows.chunks(BATCH_CHUNK) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO tokens (contract_index, contract_subindex, token_id, \
             metadata_url, metadata_hash) ",
        );
        builder.push_values(chunk, |mut b, row| {
            b.push_bind(row.contract.index as i64)
                .push_bind(row.contract.subindex as i64)
                .push_bind(&row.token_id)
                .push_bind(&row.url)
                .push_bind(row.hash.as_deref());
        });
        builder.push(
            " ON CONFLICT (contract_index, contract_subindex, token_id) DO UPDATE \
             SET metadata_url = EXCLUDED.metadata_url, \
                 metadata_hash = EXCLUDED.metadata_hash",
        );
        affected += builder.build().execute(&mut *conn).await?.rows_affected();
    }

    Ok(affected)
}

/// Upsert-and-accumulate account balances.
pub async fn apply_balance_updates(
    conn: &mut PgConnection,
    updates: &[ResolvedBalanceUpdate],
) -> eyre::Result<u64> {
    let rows = aggregate_balance_updates(updates);
    accumulate_batch(
        conn,
        "INSERT INTO account_token_balances (contract_index, contract_subindex, \
         token_id, account_id, balance) ",
        &accumulate_conflict_clause(
            "account_token_balances",
            &["contract_index", "contract_subindex", "token_id", "account_id"],
            &["balance"],
        ),
        &rows,
        |mut b, row| {
            b.push_bind(row.contract.index as i64)
                .push_bind(row.contract.subindex as i64)
                .push_bind(&row.token_id)
                .push_bind(row.account_id)
                .push_bind(&row.delta);
        },
    )
    .await
}

/// Append module link events. The key covers position, contract, and action,
/// so re-inserting an already-durable event is a no-op.
pub async fn insert_link_events(
    conn: &mut PgConnection,
    events: &[ModuleLinkEvent],
) -> eyre::Result<u64> {
    let mut affected = 0;
    for chunk in events.chunks(BATCH_CHUNK) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO module_link_events (block_height, transaction_index, event_index, \
             contract_index, contract_subindex, module_ref, link_action) ",
        );
        builder.push_values(chunk, |mut b, event| {
            b.push_bind(event.position.block_height as i64)
                .push_bind(event.position.transaction_index as i64)
                .push_bind(event.position.event_index as i64)
                .push_bind(event.contract.index as i64)
                .push_bind(event.contract.subindex as i64)
                .push_bind(event.module_ref.as_bytes())
                .push_bind(event.action.as_str());
        });
        builder.push(" ON CONFLICT DO NOTHING");
        affected += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

/// Last committed block height, or None on a fresh database.
pub async fn last_imported_height(pool: &PgPool) -> eyre::Result<Option<u64>> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT last_block_height FROM import_state")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(height,)| height as u64))
}

/// Write the import checkpoint inside the block's transaction.
pub async fn set_imported_height(conn: &mut PgConnection, height: u64) -> eyre::Result<()> {
    sqlx::query(
        "INSERT INTO import_state (id, last_block_height) VALUES (TRUE, $1)
         ON CONFLICT (id) DO UPDATE
         SET last_block_height = $1, updated_at = NOW()",
    )
    .bind(height as i64)
    .execute(conn)
    .await?;
    Ok(())
}

#[derive(Debug, PartialEq)]
pub(crate) struct SupplyRow {
    pub contract: ContractAddress,
    pub token_id: String,
    pub delta: BigDecimal,
}

#[derive(Debug, PartialEq)]
pub(crate) struct MetadataRow {
    pub contract: ContractAddress,
    pub token_id: String,
    pub url: String,
    pub hash: Option<String>,
}

/// Aggregate supply deltas per (contract, token) and reduce metadata updates
/// to the last one per key, preserving chain order semantics.
pub(crate) fn split_token_updates(updates: &[TokenUpdate]) -> (Vec<SupplyRow>, Vec<MetadataRow>) {
    let mut supply: BTreeMap<(ContractAddress, String), BigDecimal> = BTreeMap::new();
    let mut metadata: BTreeMap<(ContractAddress, String), (String, Option<String>)> =
        BTreeMap::new();

    for update in updates {
        let key = (update.contract, update.token_id.to_string());
        match &update.kind {
            TokenUpdateKind::SupplyDelta(delta) => {
                *supply.entry(key).or_default() += delta;
            }
            TokenUpdateKind::Metadata { url, hash } => {
                metadata.insert(key, (url.clone(), hash.clone()));
            }
        }
    }

    let supply_rows = supply
        .into_iter()
        .map(|((contract, token_id), delta)| SupplyRow {
            contract,
            token_id,
            delta,
        })
        .collect();
    let metadata_rows = metadata
        .into_iter()
        .map(|((contract, token_id), (url, hash))| MetadataRow {
            contract,
            token_id,
            url,
            hash,
        })
        .collect();
    (supply_rows, metadata_rows)
}

#[derive(Debug, PartialEq)]
pub(crate) struct BalanceRow {
    pub contract: ContractAddress,
    pub token_id: String,
    pub account_id: i64,
    pub delta: BigDecimal,
}

pub(crate) fn aggregate_balance_updates(updates: &[ResolvedBalanceUpdate]) -> Vec<BalanceRow> {
    let mut totals: BTreeMap<(ContractAddress, String, i64), BigDecimal> = BTreeMap::new();
    for update in updates {
        *totals
            .entry((update.contract, update.token_id.to_string(), update.account_id))
            .or_default() += &update.delta;
    }
    totals
        .into_iter()
        .map(|((contract, token_id, account_id), delta)| BalanceRow {
            contract,
            token_id,
            account_id,
            delta,
        })
        .collect()
}

/// Build the `ON CONFLICT` tail of an accumulate-upsert: conflict on the
/// natural key, add each delta column to the stored value.
pub(crate) fn accumulate_conflict_clause(
    table: &str,
    key: &[&str],
    accumulate: &[&str],
) -> String {
    let updates = accumulate
        .iter()
        .map(|column| format!("{column} = {table}.{column} + EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(" ON CONFLICT ({}) DO UPDATE SET {}", key.join(", "), updates)
}

/// Chunked multi-row insert with an accumulate conflict clause. Shared by
/// token-supply and account-balance writes.
async fn accumulate_batch<'a, T>(
    conn: &mut PgConnection,
    insert: &str,
    conflict: &str,
    rows: &'a [T],
    bind: impl Fn(Separated<'_, 'a, Postgres, &'static str>, &'a T) + Copy,
) -> eyre::Result<u64> {
    let mut affected = 0;
    for chunk in rows.chunks(BATCH_CHUNK) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(insert);
        builder.push_values(chunk, bind);
        builder.push(conflict);
        affected += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}
