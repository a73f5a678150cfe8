//! Wallet variants and the transfer-builder capability
//!
//! Both wallet contracts accept an external message whose body is
//! `signature || unsigned payload`, the signature being taken over the
//! representation hash of the unsigned payload. They differ in how replay is
//! prevented:
//! - [`HighloadWallet`]: stateless, keyed by an [`IdempotencyKey`]
//! - [`SequenceWallet`]: keyed by the account's sequence number

pub mod highload;
pub mod sequence;

pub use highload::{decode_batch, DecodedBatch, HighloadWallet, MAX_BATCH_MESSAGES};
pub use sequence::{
    decode_sequence_transfer, DecodedSequenceTransfer, SequenceWallet, DEFAULT_WALLET_ID, MAX_SEQUENCE_MESSAGES,
};

use thiserror::Error;

use crate::address::{Address, AddressError};
use crate::cell::{Cell, CellBuilder, CellError};
use crate::idempotency::IdempotencyKey;
use crate::message::{ExternalMessage, OutboundMessage, SendMode};
use crate::signing::{KeyPair, SIGNATURE_LEN};

/// Anything that can produce a signed transfer for its own account
pub trait Wallet: Send + Sync {
    /// Account address of the wallet contract
    fn address(&self) -> Address;

    /// `StateInit` to attach while the contract is not deployed yet
    fn state_init(&self) -> Option<Cell>;

    /// Build and sign a transfer. Pure with respect to the ledger: no network
    /// access, and the result may be broadcast any number of times.
    fn build_transfer(&self, request: &TransferRequest) -> Result<SignedTransfer, EncodingError>;
}

/// Parameters of a single transfer
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Sequence number (seqno wallet) or idempotency sequence (highload);
    /// `None` lets a highload wallet draw a random one
    pub sequence: Option<u32>,
    /// Default send mode for messages that do not carry their own
    pub send_mode: SendMode,
    pub messages: Vec<OutboundMessage>,
    /// Validity window in seconds
    pub timeout: Option<u32>,
}

impl TransferRequest {
    /// Request for `messages` with the default send mode
    pub fn new(messages: Vec<OutboundMessage>) -> Self {
        Self {
            sequence: None,
            send_mode: SendMode::default(),
            messages,
            timeout: None,
        }
    }

    /// Sequence number to bind the transfer to
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_send_mode(mut self, mode: SendMode) -> Self {
        self.send_mode = mode;
        self
    }

    /// Validity window in seconds
    pub fn with_timeout(mut self, timeout: u32) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A signed wallet body, immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransfer {
    /// `signature || unsigned payload`
    pub body: Cell,
    /// Sequence number the transfer is bound to
    pub sequence: u32,
    /// UNIX time after which the contract rejects the transfer
    pub expires_at: u32,
    /// Present for highload transfers
    pub idempotency_key: Option<IdempotencyKey>,
}

impl SignedTransfer {
    /// Wrap the body in an external message addressed to `wallet`
    pub fn external_message<W: Wallet + ?Sized>(
        &self,
        wallet: &W,
        include_state_init: bool,
    ) -> ExternalMessage {
        ExternalMessage {
            destination: wallet.address(),
            state_init: if include_state_init {
                wallet.state_init()
            } else {
                None
            },
            body: self.body.clone(),
        }
    }

    /// Serialized external message ready for broadcast
    pub fn to_broadcast<W: Wallet + ?Sized>(
        &self,
        wallet: &W,
        include_state_init: bool,
    ) -> Result<Vec<u8>, EncodingError> {
        Ok(self.external_message(wallet, include_state_init).to_boc()?)
    }
}

/// Sign `unsigned` and prepend the signature
pub(crate) fn sign_payload(keypair: &KeyPair, unsigned: &Cell) -> Result<Cell, EncodingError> {
    let signature = keypair.sign_cell(unsigned);
    let mut b = CellBuilder::new();
    b.store_bytes(&signature)?;
    b.store_cell_contents(unsigned)?;
    Ok(b.build())
}

/// Split a signed body into its signature and the unsigned remainder
pub(crate) fn split_signature(body: &Cell) -> Result<([u8; SIGNATURE_LEN], Cell), EncodingError> {
    let mut s = body.as_slice();
    let bytes = s.load_bytes(SIGNATURE_LEN)?;
    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(&bytes);
    Ok((signature, s.to_cell()))
}

/// `mode:8 ^message` pair as stored by both wallet contracts
pub(crate) fn mode_and_message(mode: SendMode, message: &OutboundMessage) -> Result<Cell, EncodingError> {
    let mut b = CellBuilder::new();
    b.store_u8(mode.bits())?;
    b.store_ref(message.to_cell()?)?;
    Ok(b.build())
}

/// Errors raised while building or decoding a transfer payload.
/// Never retried: the same input always fails the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Too many messages in one transfer: {count} (max {max})")]
    TooManyMessages { count: usize, max: usize },

    #[error("Sequence number is required for this wallet")]
    MissingSequence,

    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("Cell encoding error: {0}")]
    Cell(#[from] CellError),

    #[error("Malformed transfer payload: {0}")]
    Malformed(String),
}
