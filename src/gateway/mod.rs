//! Ledger gateway: the only boundary the delivery core talks to
//!
//! Reads are block-addressed so that a poll iteration sees one consistent
//! snapshot of the account (state, get-method answers) at a single height.

pub mod http;
pub mod scripted;

pub use http::HttpGateway;
pub use scripted::ScriptedGateway;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Address;
use crate::cell::{Cell, CellError};
use crate::message::message_body;

/// Masterchain block sequence number
pub type BlockHeight = u32;

/// Position of a transaction in an account's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxCheckpoint {
    /// Logical time
    pub lt: u64,
    pub hash: [u8; 32],
}

impl TxCheckpoint {
    /// Checkpoint at logical time `lt` with transaction hash `hash`
    pub fn new(lt: u64, hash: [u8; 32]) -> Self {
        Self { lt, hash }
    }
}

/// Lifecycle status of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    /// Never received anything
    Nonexist,
    /// Holds a balance but no code yet
    Uninit,
    Active,
    Frozen,
}

/// Account snapshot at some block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    pub status: AccountStatus,
    pub balance: u128,
    /// Latest transaction, if the account has any history
    pub last_tx: Option<TxCheckpoint>,
}

impl AccountState {
    /// State of an address that never received anything
    pub fn nonexistent() -> Self {
        Self {
            status: AccountStatus::Nonexist,
            balance: 0,
            last_tx: None,
        }
    }

    /// Whether the contract is deployed and can answer get-methods
    pub fn exists(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// One entry of an account's transaction history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub lt: u64,
    pub hash: [u8; 32],
    /// Preceding transaction of the same account, `None` for the first one
    pub prev: Option<TxCheckpoint>,
    /// Body of the message that triggered the transaction
    pub in_msg_body: Option<Cell>,
}

impl TransactionRecord {
    /// Position of this transaction in the account history
    pub fn checkpoint(&self) -> TxCheckpoint {
        TxCheckpoint::new(self.lt, self.hash)
    }

    /// Whether this is the first transaction the account ever had
    pub fn is_first(&self) -> bool {
        self.prev.is_none()
    }

    /// Parse a `Transaction` cell down to its logical time and incoming body
    pub fn from_cell(cell: &Cell) -> Result<Self, CellError> {
        let mut s = cell.as_slice();
        let tag = s.load_uint(4)?;
        if tag != 0b0111 {
            return Err(CellError::UnexpectedTag {
                what: "transaction",
                tag,
            });
        }
        s.skip(256)?; // account_addr
        let lt = s.load_u64()?;
        let mut prev_hash = [0u8; 32];
        prev_hash.copy_from_slice(&s.load_bytes(32)?);
        let prev_lt = s.load_u64()?;
        // now, outmsg_cnt, orig_status, end_status
        s.skip(32 + 15 + 2 + 2)?;

        let mut messages = s.load_ref()?.as_slice();
        let in_msg_body = if messages.load_bit()? {
            Some(message_body(&messages.load_ref()?)?)
        } else {
            None
        };

        Ok(Self {
            lt,
            hash: cell.hash(),
            prev: (prev_lt != 0).then(|| TxCheckpoint::new(prev_lt, prev_hash)),
            in_msg_body,
        })
    }
}

/// Value on the contract VM stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackValue {
    Null,
    Int(i128),
    Nan,
    Cell(Cell),
    Tuple(Vec<StackValue>),
}

impl StackValue {
    /// Integer value, if this entry is one
    pub fn as_int(&self) -> Option<i128> {
        match self {
            StackValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Ledger access used by the delivery core
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Best-effort submission of a serialized external message
    async fn broadcast(&self, payload: &[u8]) -> Result<(), GatewayError>;

    async fn current_block_height(&self) -> Result<BlockHeight, GatewayError>;

    async fn read_account_state(
        &self,
        block: BlockHeight,
        address: &Address,
    ) -> Result<AccountState, GatewayError>;

    /// Run a get-method against the account state at `block`
    async fn call_read_only(
        &self,
        block: BlockHeight,
        address: &Address,
        method: &str,
        args: &[StackValue],
    ) -> Result<Vec<StackValue>, GatewayError>;

    /// History walking backwards from `since` (inclusive), newest first
    async fn read_recent_transactions(
        &self,
        address: &Address,
        since: &TxCheckpoint,
        limit: Option<usize>,
    ) -> Result<Vec<TransactionRecord>, GatewayError>;
}

/// Gateway failures. All of them are transient from the caller's point of
/// view: nothing about the account can be concluded from them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Get-method {method} failed with exit code {exit_code}")]
    MethodFailed { method: String, exit_code: i32 },

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl From<CellError> for GatewayError {
    fn from(err: CellError) -> Self {
        GatewayError::Decode(err.to_string())
    }
}
