use std::fmt;

use bigdecimal::BigDecimal;
use num_bigint::BigUint;
use serde::{Serialize, Serializer};

/// Address of a smart-contract instance, totally ordered by (index, subindex).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ContractAddress {
    pub index: u64,
    pub subindex: u64,
}

impl ContractAddress {
    pub fn new(index: u64, subindex: u64) -> Self {
        Self { index, subindex }
    }
}

impl fmt::Display for ContractAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{},{}>", self.index, self.subindex)
    }
}

/// Position of an event in chain history. Comparison is lexicographic on
/// (block_height, transaction_index, event_index), which gives a strict total
/// order over all emitted events: no two distinct events share a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChainPosition {
    pub block_height: u64,
    pub transaction_index: u64,
    pub event_index: u32,
}

impl ChainPosition {
    pub fn new(block_height: u64, transaction_index: u64, event_index: u32) -> Self {
        Self {
            block_height,
            transaction_index,
            event_index,
        }
    }
}

impl fmt::Display for ChainPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.block_height, self.transaction_index, self.event_index
        )
    }
}

/// A 32-byte account address, displayed as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountAddress(pub [u8; 32]);

impl fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for AccountAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

/// Reference to a deployed contract code module (32-byte hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleReference(pub [u8; 32]);

impl ModuleReference {
    pub fn from_slice(bytes: &[u8]) -> eyre::Result<Self> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| eyre::eyre!("module reference must be 32 bytes, got {}", bytes.len()))?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ModuleReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for ModuleReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

/// Either operand of a CIS-2 event: a plain account or a contract instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "address", rename_all = "snake_case")]
pub enum Address {
    Account(AccountAddress),
    Contract(ContractAddress),
}

/// Raw token id bytes (0-255 of them, possibly none), exposed as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TokenId(Vec<u8>);

impl TokenId {
    pub fn new(bytes: Vec<u8>) -> Self {
        debug_assert!(bytes.len() <= u8::MAX as usize);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl Serialize for TokenId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

/// Operator change carried by an UpdateOperator event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorUpdate {
    Remove,
    Add,
}

/// A decoded CIS-2 token event. Wire amounts are unsigned; the projector
/// applies signs when turning events into deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TokenEvent {
    Transfer {
        token_id: TokenId,
        #[serde(serialize_with = "serialize_biguint")]
        amount: BigUint,
        from: Address,
        to: Address,
    },
    Mint {
        token_id: TokenId,
        #[serde(serialize_with = "serialize_biguint")]
        amount: BigUint,
        owner: Address,
    },
    Burn {
        token_id: TokenId,
        #[serde(serialize_with = "serialize_biguint")]
        amount: BigUint,
        owner: Address,
    },
    UpdateOperator {
        update: OperatorUpdate,
        owner: Address,
        operator: Address,
    },
    TokenMetadata {
        token_id: TokenId,
        metadata_url: String,
        #[serde(serialize_with = "serialize_opt_hash")]
        metadata_hash: Option<[u8; 32]>,
    },
}

impl TokenEvent {
    /// Type tag stored on event-ledger rows.
    pub fn event_type(&self) -> &'static str {
        match self {
            TokenEvent::Transfer { .. } => "transfer",
            TokenEvent::Mint { .. } => "mint",
            TokenEvent::Burn { .. } => "burn",
            TokenEvent::UpdateOperator { .. } => "update_operator",
            TokenEvent::TokenMetadata { .. } => "token_metadata",
        }
    }

    /// The token this event concerns. UpdateOperator events carry none.
    pub fn token_id(&self) -> Option<&TokenId> {
        match self {
            TokenEvent::Transfer { token_id, .. }
            | TokenEvent::Mint { token_id, .. }
            | TokenEvent::Burn { token_id, .. }
            | TokenEvent::TokenMetadata { token_id, .. } => Some(token_id),
            TokenEvent::UpdateOperator { .. } => None,
        }
    }
}

fn serialize_biguint<S: Serializer>(amount: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&amount.to_string())
}

fn serialize_opt_hash<S: Serializer>(
    hash: &Option<[u8; 32]>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match hash {
        Some(raw) => serializer.serialize_some(&hex::encode(raw)),
        None => serializer.serialize_none(),
    }
}

/// Token-level change produced by the projector: a supply delta or a
/// metadata replacement, keyed by (contract, token id).
#[derive(Debug, Clone, PartialEq)]
pub struct TokenUpdate {
    pub contract: ContractAddress,
    pub token_id: TokenId,
    pub kind: TokenUpdateKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenUpdateKind {
    /// Additive supply change: positive for mint, negative for burn.
    SupplyDelta(BigDecimal),
    /// Metadata replacement; hash is lowercase hex when present.
    Metadata {
        url: String,
        hash: Option<String>,
    },
}

/// Signed balance change for one (contract, token id, account) entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountBalanceUpdate {
    pub contract: ContractAddress,
    pub token_id: TokenId,
    pub account: AccountAddress,
    pub delta: BigDecimal,
}

/// Whether a link event attaches or detaches a module reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Added,
    Removed,
}

impl LinkAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkAction::Added => "added",
            LinkAction::Removed => "removed",
        }
    }
}

/// One entry in the append-only module linkage log. A module upgrade emits a
/// Removed for the old reference and an Added for the new one at the same
/// chain position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleLinkEvent {
    pub contract: ContractAddress,
    pub module_ref: ModuleReference,
    pub position: ChainPosition,
    pub action: LinkAction,
}
