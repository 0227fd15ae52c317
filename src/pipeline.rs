//! Per-block unit of work.
//!
//! Walks a block's transactions and events in chain order, decoding contract
//! logs and replaying lifecycle events into the module resolver, then turns
//! the decoded events into idempotent row updates written through the import
//! transaction. Decoding and projection are pure; everything observable
//! happens in the caller's transaction, so an abandoned block leaves no
//! trace.

use std::collections::{HashMap, HashSet};

use sqlx::PgConnection;

use crate::db::accounts::AccountLookup;
use crate::db::repository::{self, ResolvedBalanceUpdate, TokenEventRow};
use crate::indexer::decoder::decode_token_event;
use crate::indexer::projector::project;
use crate::indexer::source::{BlockData, ContractEventKind};
use crate::indexer::types::{
    AccountBalanceUpdate, ChainPosition, ContractAddress, LinkAction, ModuleLinkEvent,
    ModuleReference, TokenEvent, TokenUpdate,
};
use crate::modules::resolver::{DurableLinks, ModuleResolver, ResolveError};

/// Row counts and per-event outcomes for one imported block, exposed for
/// observability.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockCounts {
    pub events_decoded: u64,
    /// Logs that were not CIS-2 events at all; the common case.
    pub events_skipped: u64,
    pub events_malformed: u64,
    /// Events whose ledger position was already imported by a committed
    /// batch; their deltas are not applied again.
    pub events_replayed: u64,
    /// Balance updates dropped because the account is not indexed yet.
    pub balances_dropped: u64,
    pub token_rows: u64,
    pub balance_rows: u64,
    pub link_rows: u64,
}

/// A decoded token event with the coordinates that produced it.
#[derive(Debug, Clone)]
pub struct DecodedTokenEvent {
    pub position: ChainPosition,
    pub contract: ContractAddress,
    pub event: TokenEvent,
}

/// Decode, project, resolve, and write one block at a time.
pub struct BlockPipeline<D, L> {
    resolver: ModuleResolver<D>,
    accounts: L,
}

impl<D: DurableLinks, L: AccountLookup> BlockPipeline<D, L> {
    pub fn new(durable_links: D, accounts: L) -> Self {
        Self {
            resolver: ModuleResolver::new(durable_links),
            accounts,
        }
    }

    pub fn resolver(&self) -> &ModuleResolver<D> {
        &self.resolver
    }

    /// Process one block inside the caller's transaction. The caller commits
    /// (or rolls back) and then calls [`Self::finish_block`].
    pub async fn process_block(
        &mut self,
        conn: &mut PgConnection,
        block: &BlockData,
    ) -> eyre::Result<BlockCounts> {
        let mut counts = BlockCounts::default();

        let decoded = self.replay_block_events(block, &mut counts).await?;

        let rows = ledger_rows(&decoded, block)?;
        let fresh_positions = repository::record_token_events(conn, &rows).await?;
        let (fresh, replayed) = split_fresh(decoded, &fresh_positions);
        counts.events_replayed = replayed;

        let (token_updates, balance_updates) = build_updates(&fresh);
        let resolved = self.resolve_balances(balance_updates, &mut counts).await?;

        counts.token_rows = repository::apply_token_updates(conn, &token_updates).await?;
        counts.balance_rows = repository::apply_balance_updates(conn, &resolved).await?;
        counts.link_rows =
            repository::insert_link_events(conn, self.resolver.pending().events()).await?;

        Ok(counts)
    }

    /// Drop per-block state once the transaction committed or was abandoned.
    pub fn finish_block(&mut self) {
        self.resolver.clear_pending();
    }

    /// Pass 1: walk events in chain order, decoding token logs and feeding
    /// lifecycle events into the resolver's pending buffer. Link events from
    /// earlier positions are recorded before later positions resolve, which
    /// is the visibility order the resolver depends on.
    async fn replay_block_events(
        &mut self,
        block: &BlockData,
        counts: &mut BlockCounts,
    ) -> eyre::Result<Vec<DecodedTokenEvent>> {
        let mut decoded = Vec::new();
        for tx in &block.transactions {
            for event in &tx.events {
                let position = ChainPosition::new(block.height, tx.index, event.index);
                match &event.kind {
                    ContractEventKind::Logged { data } => match decode_token_event(data) {
                        Ok(token_event) => {
                            counts.events_decoded += 1;
                            decoded.push(DecodedTokenEvent {
                                position,
                                contract: event.contract,
                                event: token_event,
                            });
                        }
                        Err(err) if err.is_not_token_event() => counts.events_skipped += 1,
                        Err(err) => {
                            tracing::warn!(
                                contract = %event.contract,
                                transaction = %tx.hash,
                                position = %position,
                                error = %err,
                                "Dropping malformed token event"
                            );
                            counts.events_malformed += 1;
                        }
                    },
                    ContractEventKind::Initialized { module_ref } => {
                        self.resolver.record(ModuleLinkEvent {
                            contract: event.contract,
                            module_ref: *module_ref,
                            position,
                            action: LinkAction::Added,
                        });
                    }
                    ContractEventKind::Upgraded { from, to } => {
                        self.apply_upgrade(event.contract, position, *from, *to)
                            .await?;
                    }
                }
            }
        }
        Ok(decoded)
    }

    /// Record the link change of an upgrade, first checking that the module
    /// being removed is the one currently resolved for the contract.
    async fn apply_upgrade(
        &mut self,
        contract: ContractAddress,
        position: ChainPosition,
        from: ModuleReference,
        to: ModuleReference,
    ) -> eyre::Result<()> {
        match self.resolver.resolve_as_of(contract, position).await {
            Ok(linked) if linked != from => {
                tracing::warn!(
                    contract = %contract,
                    position = %position,
                    linked = %linked,
                    removed = %from,
                    "Upgrade removed a module that was not the linked one"
                );
            }
            Ok(_) => {}
            Err(ResolveError::NoModuleLinked { .. }) => {
                tracing::error!(
                    contract = %contract,
                    position = %position,
                    "Contract upgraded but no module link exists at or before this position"
                );
            }
            Err(ResolveError::Storage(err)) => return Err(err),
        }

        self.resolver.record(ModuleLinkEvent {
            contract,
            module_ref: from,
            position,
            action: LinkAction::Removed,
        });
        self.resolver.record(ModuleLinkEvent {
            contract,
            module_ref: to,
            position,
            action: LinkAction::Added,
        });
        Ok(())
    }

    /// Map account addresses to internal ids, dropping updates whose address
    /// is not indexed.
    async fn resolve_balances(
        &self,
        updates: Vec<AccountBalanceUpdate>,
        counts: &mut BlockCounts,
    ) -> eyre::Result<Vec<ResolvedBalanceUpdate>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let addresses: HashSet<String> = updates
            .iter()
            .map(|update| update.account.to_string())
            .collect();
        let ids: HashMap<String, Option<i64>> = self.accounts.resolve(&addresses).await?;

        let mut resolved = Vec::with_capacity(updates.len());
        for update in updates {
            let address = update.account.to_string();
            match ids.get(&address).copied().flatten() {
                Some(account_id) => resolved.push(ResolvedBalanceUpdate {
                    contract: update.contract,
                    token_id: update.token_id,
                    account_id,
                    delta: update.delta,
                }),
                None => {
                    tracing::debug!(
                        account = %address,
                        contract = %update.contract,
                        "Dropping balance update for unresolved account"
                    );
                    counts.balances_dropped += 1;
                }
            }
        }
        Ok(resolved)
    }
}

/// Serialize decoded events into ledger rows.
fn ledger_rows(events: &[DecodedTokenEvent], block: &BlockData) -> eyre::Result<Vec<TokenEventRow>> {
    events
        .iter()
        .map(|decoded| {
            Ok(TokenEventRow {
                position: decoded.position,
                contract: decoded.contract,
                token_id: decoded.event.token_id().map(|id| id.to_string()),
                event_type: decoded.event.event_type(),
                payload: serde_json::to_value(&decoded.event)?,
                block_time: block.block_time,
            })
        })
        .collect()
}

/// Keep only events whose ledger row was newly inserted; the rest were
/// already imported. Returns the fresh events and the replay count.
fn split_fresh(
    decoded: Vec<DecodedTokenEvent>,
    fresh_positions: &HashSet<ChainPosition>,
) -> (Vec<DecodedTokenEvent>, u64) {
    let total = decoded.len() as u64;
    let fresh: Vec<DecodedTokenEvent> = decoded
        .into_iter()
        .filter(|event| fresh_positions.contains(&event.position))
        .collect();
    let replayed = total - fresh.len() as u64;
    (fresh, replayed)
}

/// Project fresh events into token and balance updates, in chain order.
fn build_updates(
    events: &[DecodedTokenEvent],
) -> (Vec<TokenUpdate>, Vec<AccountBalanceUpdate>) {
    let mut token_updates = Vec::new();
    let mut balance_updates = Vec::new();
    for decoded in events {
        let projection = project(decoded.contract, &decoded.event);
        token_updates.extend(projection.token);
        balance_updates.extend(projection.balances);
    }
    (token_updates, balance_updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use num_bigint::BigUint;

    use crate::indexer::decoder::encode_token_event;
    use crate::indexer::source::{BlockTransaction, ContractEvent};
    use crate::indexer::types::{AccountAddress, Address, TokenId};
    use crate::modules::resolver::InMemoryLinks;

    struct StaticAccounts(HashMap<String, i64>);

    #[async_trait]
    impl AccountLookup for StaticAccounts {
        async fn resolve(
            &self,
            addresses: &HashSet<String>,
        ) -> eyre::Result<HashMap<String, Option<i64>>> {
            Ok(addresses
                .iter()
                .map(|address| (address.clone(), self.0.get(address).copied()))
                .collect())
        }
    }

    fn pipeline() -> BlockPipeline<InMemoryLinks, StaticAccounts> {
        BlockPipeline::new(InMemoryLinks::default(), StaticAccounts(HashMap::new()))
    }

    fn contract() -> ContractAddress {
        ContractAddress::new(5, 0)
    }

    fn module(byte: u8) -> ModuleReference {
        ModuleReference([byte; 32])
    }

    fn block(transactions: Vec<BlockTransaction>) -> BlockData {
        BlockData {
            height: 100,
            block_time: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            transactions,
        }
    }

    fn logged(index: u32, data: Vec<u8>) -> ContractEvent {
        ContractEvent {
            index,
            contract: contract(),
            kind: ContractEventKind::Logged { data },
        }
    }

    fn transaction(index: u64, events: Vec<ContractEvent>) -> BlockTransaction {
        BlockTransaction {
            index,
            hash: format!("tx-{index}"),
            events,
        }
    }

    fn mint_bytes(amount: u64) -> Vec<u8> {
        encode_token_event(&TokenEvent::Mint {
            token_id: TokenId::new(vec![0x01]),
            amount: BigUint::from(amount),
            owner: Address::Account(AccountAddress([1; 32])),
        })
    }

    #[tokio::test]
    async fn replay_separates_token_events_from_noise() {
        let mut counts = BlockCounts::default();
        let block = block(vec![transaction(
            0,
            vec![
                logged(0, mint_bytes(100)),
                // Unrelated contract log.
                logged(1, vec![0x05, 0x01, 0x02]),
                // Burn discriminant with an unterminated amount varint.
                logged(2, vec![253, 0x00, 0x80]),
            ],
        )]);

        let decoded = pipeline()
            .replay_block_events(&block, &mut counts)
            .await
            .unwrap();

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].position, ChainPosition::new(100, 0, 0));
        assert_eq!(counts.events_decoded, 1);
        assert_eq!(counts.events_skipped, 1);
        assert_eq!(counts.events_malformed, 1);
    }

    #[tokio::test]
    async fn lifecycle_events_land_in_the_pending_buffer() {
        let mut counts = BlockCounts::default();
        let mut pipeline = pipeline();
        let block = block(vec![transaction(
            0,
            vec![
                ContractEvent {
                    index: 0,
                    contract: contract(),
                    kind: ContractEventKind::Initialized {
                        module_ref: module(0xaa),
                    },
                },
                ContractEvent {
                    index: 1,
                    contract: contract(),
                    kind: ContractEventKind::Upgraded {
                        from: module(0xaa),
                        to: module(0xbb),
                    },
                },
            ],
        )]);

        pipeline
            .replay_block_events(&block, &mut counts)
            .await
            .unwrap();

        let pending = pipeline.resolver().pending().events();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].action, LinkAction::Added);
        assert_eq!(pending[0].module_ref, module(0xaa));
        assert_eq!(pending[1].action, LinkAction::Removed);
        assert_eq!(pending[1].module_ref, module(0xaa));
        assert_eq!(pending[2].action, LinkAction::Added);
        assert_eq!(pending[2].module_ref, module(0xbb));

        // The upgrade is visible to as-of queries at its own position.
        let resolved = pipeline
            .resolver()
            .resolve_as_of(contract(), ChainPosition::new(100, 0, 1))
            .await
            .unwrap();
        assert_eq!(resolved, module(0xbb));

        pipeline.finish_block();
        assert!(pipeline.resolver().pending().is_empty());
    }

    #[tokio::test]
    async fn resolve_balances_drops_unknown_accounts() {
        let known = AccountAddress([1; 32]);
        let unknown = AccountAddress([2; 32]);
        let pipeline = BlockPipeline::new(
            InMemoryLinks::default(),
            StaticAccounts(HashMap::from([(known.to_string(), 42i64)])),
        );

        let updates = vec![
            AccountBalanceUpdate {
                contract: contract(),
                token_id: TokenId::new(vec![0x01]),
                account: known,
                delta: bigdecimal::BigDecimal::from(10),
            },
            AccountBalanceUpdate {
                contract: contract(),
                token_id: TokenId::new(vec![0x01]),
                account: unknown,
                delta: bigdecimal::BigDecimal::from(-10),
            },
        ];

        let mut counts = BlockCounts::default();
        let resolved = pipeline.resolve_balances(updates, &mut counts).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].account_id, 42);
        assert_eq!(counts.balances_dropped, 1);
    }

    #[test]
    fn split_fresh_filters_replayed_positions() {
        let fresh_position = ChainPosition::new(100, 0, 0);
        let replayed_position = ChainPosition::new(100, 0, 1);
        let event = TokenEvent::Mint {
            token_id: TokenId::new(vec![0x01]),
            amount: BigUint::from(1u8),
            owner: Address::Account(AccountAddress([1; 32])),
        };
        let decoded = vec![
            DecodedTokenEvent {
                position: fresh_position,
                contract: contract(),
                event: event.clone(),
            },
            DecodedTokenEvent {
                position: replayed_position,
                contract: contract(),
                event,
            },
        ];

        let (fresh, replayed) = split_fresh(decoded, &HashSet::from([fresh_position]));
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].position, fresh_position);
        assert_eq!(replayed, 1);
    }

    #[test]
    fn build_updates_projects_in_chain_order() {
        let decoded = vec![DecodedTokenEvent {
            position: ChainPosition::new(100, 0, 0),
            contract: contract(),
            event: TokenEvent::Transfer {
                token_id: TokenId::new(vec![0x01]),
                amount: BigUint::from(5u8),
                from: Address::Account(AccountAddress([1; 32])),
                to: Address::Account(AccountAddress([2; 32])),
            },
        }];
        let (token_updates, balance_updates) = build_updates(&decoded);
        assert!(token_updates.is_empty());
        assert_eq!(balance_updates.len(), 2);
    }

    #[test]
    fn ledger_rows_carry_event_payloads() {
        let block = block(vec![]);
        let decoded = vec![DecodedTokenEvent {
            position: ChainPosition::new(100, 2, 3),
            contract: contract(),
            event: TokenEvent::Mint {
                token_id: TokenId::new(vec![0x01]),
                amount: BigUint::from(77u8),
                owner: Address::Account(AccountAddress([1; 32])),
            },
        }];
        let rows = ledger_rows(&decoded, &block).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "mint");
        assert_eq!(rows[0].token_id.as_deref(), Some("01"));
        assert_eq!(rows[0].payload["amount"], "77");
        assert_eq!(rows[0].block_time, block.block_time);
    }
}
