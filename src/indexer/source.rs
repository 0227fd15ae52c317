//! Input model for the import pipeline.
//!
//! The node client and the height scheduler live outside this crate; they
//! feed the import loop a stream of `BlockData` values in strictly increasing
//! height order. Raw contract log bytes arrive undecoded, while contract
//! lifecycle changes arrive already parsed by the node.

use chrono::{DateTime, Utc};

use crate::indexer::types::{ContractAddress, ModuleReference};

/// One block's worth of contract events, in chain order.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub height: u64,
    /// Slot time of the block, stored on event-ledger rows.
    pub block_time: DateTime<Utc>,
    pub transactions: Vec<BlockTransaction>,
}

/// Events emitted by a single transaction.
#[derive(Debug, Clone)]
pub struct BlockTransaction {
    /// Index of the transaction within its block.
    pub index: u64,
    /// Node-supplied transaction hash, used only for diagnostics.
    pub hash: String,
    pub events: Vec<ContractEvent>,
}

/// A single event attributed to a contract instance.
#[derive(Debug, Clone)]
pub struct ContractEvent {
    /// Index of the event within its transaction.
    pub index: u32,
    pub contract: ContractAddress,
    pub kind: ContractEventKind,
}

#[derive(Debug, Clone)]
pub enum ContractEventKind {
    /// Raw bytes from the contract's log section; may or may not be CIS-2.
    Logged { data: Vec<u8> },
    /// The contract instance was created from `module_ref`.
    Initialized { module_ref: ModuleReference },
    /// The contract switched its code from `from` to `to`.
    Upgraded {
        from: ModuleReference,
        to: ModuleReference,
    },
}
