//! Point-in-time module resolution.
//!
//! Answers "which module backed this contract at or before chain position P"
//! by replaying the module linkage log up to P. Two sources hold link events:
//! the durable store (committed rows) and the pending buffer of the import
//! transaction currently in flight. Both are scanned for the latest `Added`
//! at or before P and merged by [`merge_candidates`]; getting that comparison
//! or its tie-break wrong silently attributes events to the wrong code
//! version, so the rule is a pure function with its own tests.

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use crate::indexer::types::{
    ChainPosition, ContractAddress, LinkAction, ModuleLinkEvent, ModuleReference,
};

/// A candidate answer from one source: an `Added` link and where it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCandidate {
    pub module_ref: ModuleReference,
    pub position: ChainPosition,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// No link event exists at or before the requested position. Every
    /// contract is initialized with a module before any event can reference
    /// it, so this means broken lifecycle projection or a gap in imported
    /// history.
    #[error("no module linked to contract {contract} at or before position {position}")]
    NoModuleLinked {
        contract: ContractAddress,
        position: ChainPosition,
    },
    #[error("module link lookup failed: {0}")]
    Storage(eyre::Report),
}

/// Committed side of the linkage log.
#[async_trait]
pub trait DurableLinks: Send + Sync {
    /// Latest `Added` link for `contract` at or before `at_or_before`.
    async fn latest_added(
        &self,
        contract: ContractAddress,
        at_or_before: ChainPosition,
    ) -> eyre::Result<Option<LinkCandidate>>;
}

/// Durable link store reading committed rows from Postgres. Queries go
/// through the pool, never the import transaction, so uncommitted rows stay
/// invisible here and are seen only via [`PendingLinks`].
pub struct PgLinkStore {
    pool: PgPool,
}

impl PgLinkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DurableLinks for PgLinkStore {
    async fn latest_added(
        &self,
        contract: ContractAddress,
        at_or_before: ChainPosition,
    ) -> eyre::Result<Option<LinkCandidate>> {
        let row: Option<(Vec<u8>, i64, i64, i64)> = sqlx::query_as(
            "SELECT module_ref, block_height, transaction_index, event_index
             FROM module_link_events
             WHERE contract_index = $1 AND contract_subindex = $2
               AND link_action = 'added'
               AND (block_height, transaction_index, event_index) <= ($3, $4, $5)
             ORDER BY block_height DESC, transaction_index DESC, event_index DESC
             LIMIT 1",
        )
        .bind(contract.index as i64)
        .bind(contract.subindex as i64)
        .bind(at_or_before.block_height as i64)
        .bind(at_or_before.transaction_index as i64)
        .bind(at_or_before.event_index as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(raw, height, tx_index, ev_index)| {
            Ok(LinkCandidate {
                module_ref: ModuleReference::from_slice(&raw)?,
                position: ChainPosition::new(height as u64, tx_index as u64, ev_index as u32),
            })
        })
        .transpose()
    }
}

/// In-memory durable store backed by a vector. Used by tests and by
/// embeddings that replay a known log without a database.
#[derive(Debug, Default)]
pub struct InMemoryLinks {
    events: Vec<ModuleLinkEvent>,
}

impl InMemoryLinks {
    pub fn new(events: Vec<ModuleLinkEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl DurableLinks for InMemoryLinks {
    async fn latest_added(
        &self,
        contract: ContractAddress,
        at_or_before: ChainPosition,
    ) -> eyre::Result<Option<LinkCandidate>> {
        Ok(latest_added_in(&self.events, contract, at_or_before))
    }
}

/// Pending, not-yet-committed link events of the import batch in progress.
/// Append-only; cleared when the batch commits or is abandoned.
#[derive(Debug, Default)]
pub struct PendingLinks {
    events: Vec<ModuleLinkEvent>,
}

impl PendingLinks {
    pub fn record(&mut self, event: ModuleLinkEvent) {
        self.events.push(event);
    }

    pub fn latest_added(
        &self,
        contract: ContractAddress,
        at_or_before: ChainPosition,
    ) -> Option<LinkCandidate> {
        latest_added_in(&self.events, contract, at_or_before)
    }

    pub fn events(&self) -> &[ModuleLinkEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

fn latest_added_in(
    events: &[ModuleLinkEvent],
    contract: ContractAddress,
    at_or_before: ChainPosition,
) -> Option<LinkCandidate> {
    events
        .iter()
        .filter(|event| {
            event.contract == contract
                && event.action == LinkAction::Added
                && event.position <= at_or_before
        })
        .max_by_key(|event| event.position)
        .map(|event| LinkCandidate {
            module_ref: event.module_ref,
            position: event.position,
        })
}

/// Merge the best candidate from each source. The greater position wins; on
/// an exact position tie the pending side wins, since it reflects the most
/// recent intent within the active transaction. The log should never hold
/// two distinct links at one position, so a tie also gets a warning.
pub fn merge_candidates(
    durable: Option<LinkCandidate>,
    pending: Option<LinkCandidate>,
) -> Option<LinkCandidate> {
    match (durable, pending) {
        (Some(durable), Some(pending)) => {
            if durable.position == pending.position {
                tracing::warn!(
                    position = %pending.position,
                    durable_ref = %durable.module_ref,
                    pending_ref = %pending.module_ref,
                    "durable and pending module links share a chain position, preferring pending"
                );
                Some(pending)
            } else if pending.position > durable.position {
                Some(pending)
            } else {
                Some(durable)
            }
        }
        (durable, pending) => pending.or(durable),
    }
}

/// Composes the durable store and the pending buffer into as-of lookups.
pub struct ModuleResolver<D> {
    durable: D,
    pending: PendingLinks,
}

impl<D: DurableLinks> ModuleResolver<D> {
    pub fn new(durable: D) -> Self {
        Self {
            durable,
            pending: PendingLinks::default(),
        }
    }

    /// Buffer a link event generated by the current import batch.
    pub fn record(&mut self, event: ModuleLinkEvent) {
        self.pending.record(event);
    }

    pub fn pending(&self) -> &PendingLinks {
        &self.pending
    }

    /// Drop the pending buffer, after a commit made it durable or a rollback
    /// made it void.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Module reference linked to `contract` at the latest `Added` event with
    /// position at or before `position`.
    pub async fn resolve_as_of(
        &self,
        contract: ContractAddress,
        position: ChainPosition,
    ) -> Result<ModuleReference, ResolveError> {
        let durable = self
            .durable
            .latest_added(contract, position)
            .await
            .map_err(ResolveError::Storage)?;
        let pending = self.pending.latest_added(contract, position);
        merge_candidates(durable, pending)
            .map(|candidate| candidate.module_ref)
            .ok_or(ResolveError::NoModuleLinked { contract, position })
    }
}
