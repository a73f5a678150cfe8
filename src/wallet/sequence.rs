//! Classic sequence-number wallet
//!
//! Body layout:
//!
//! ```text
//! signature:512 || wallet_id:32 || valid_until:32 || seqno:32 || (mode:8, ^message)*
//! ```
//!
//! The contract executes a transfer only if `seqno` equals its stored counter
//! and increments the counter by one when it does.

use std::sync::Arc;

use super::{mode_and_message, sign_payload, split_signature, EncodingError, SignedTransfer, TransferRequest, Wallet};
use crate::address::Address;
use crate::cell::{Cell, CellBuilder};
use crate::idempotency::{Clock, SystemClock, DEFAULT_TIMEOUT_SECS};
use crate::message::{state_init, OutboundMessage, SendMode};
use crate::signing::{verify_cell, KeyPair, SIGNATURE_LEN};

/// Messages are stored as refs of the root cell
pub const MAX_SEQUENCE_MESSAGES: usize = 4;

/// Sub-wallet id used by default on the basechain
pub const DEFAULT_WALLET_ID: u32 = 698_983_191;

pub struct SequenceWallet {
    keypair: KeyPair,
    wallet_id: u32,
    address: Address,
    state_init: Option<Cell>,
    clock: Arc<dyn Clock>,
}

impl SequenceWallet {
    /// Wallet at a known address, no `StateInit` attached
    pub fn new(keypair: KeyPair, address: Address) -> Self {
        Self {
            keypair,
            wallet_id: DEFAULT_WALLET_ID,
            address,
            state_init: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Wallet whose address is derived from the contract `code`
    pub fn from_code(
        keypair: KeyPair,
        wallet_id: u32,
        workchain: i8,
        code: Cell,
    ) -> Result<Self, EncodingError> {
        let data = Self::data_cell(&keypair.public_key(), wallet_id)?;
        let init = state_init(code, data)?;
        let address = Address::from_state_init(workchain, &init);
        Ok(Self::new(keypair, address)
            .with_wallet_id(wallet_id)
            .with_state_init(init))
    }

    /// Initial contract data: `seqno:32 wallet_id:32 public_key:256`
    pub fn data_cell(public_key: &[u8; 32], wallet_id: u32) -> Result<Cell, EncodingError> {
        let mut b = CellBuilder::new();
        b.store_u32(0)?;
        b.store_u32(wallet_id)?;
        b.store_bytes(public_key)?;
        Ok(b.build())
    }

    pub fn with_wallet_id(mut self, wallet_id: u32) -> Self {
        self.wallet_id = wallet_id;
        self
    }

    /// `StateInit` attached to the deploying transfer
    pub fn with_state_init(mut self, state_init: Cell) -> Self {
        self.state_init = Some(state_init);
        self
    }

    /// Clock used for `valid_until`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn wallet_id(&self) -> u32 {
        self.wallet_id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key()
    }
}

impl Wallet for SequenceWallet {
    fn address(&self) -> Address {
        self.address
    }

    fn state_init(&self) -> Option<Cell> {
        self.state_init.clone()
    }

    fn build_transfer(&self, request: &TransferRequest) -> Result<SignedTransfer, EncodingError> {
        if request.messages.len() > MAX_SEQUENCE_MESSAGES {
            return Err(EncodingError::TooManyMessages {
                count: request.messages.len(),
                max: MAX_SEQUENCE_MESSAGES,
            });
        }
        let seqno = request.sequence.ok_or(EncodingError::MissingSequence)?;

        // the deploying transfer never expires
        let valid_until = if seqno == 0 {
            u32::MAX
        } else {
            self.clock
                .now_unix()
                .saturating_add(request.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS))
        };

        let mut b = CellBuilder::new();
        b.store_u32(self.wallet_id)?;
        b.store_u32(valid_until)?;
        b.store_u32(seqno)?;
        for message in &request.messages {
            let pair = mode_and_message(message.mode.unwrap_or(request.send_mode), message)?;
            b.store_cell_contents(&pair)?;
        }
        let unsigned = b.build();
        let body = sign_payload(&self.keypair, &unsigned)?;

        tracing::debug!(
            "Built seqno transfer #{} with {} messages (body {})",
            seqno,
            request.messages.len(),
            &body.hash_hex()[..8]
        );

        Ok(SignedTransfer {
            body,
            sequence: seqno,
            expires_at: valid_until,
            idempotency_key: None,
        })
    }
}

/// Parsed sequence-wallet transfer body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSequenceTransfer {
    pub signature: [u8; SIGNATURE_LEN],
    pub wallet_id: u32,
    pub valid_until: u32,
    pub seqno: u32,
    pub messages: Vec<(SendMode, OutboundMessage)>,
    unsigned: Cell,
}

impl DecodedSequenceTransfer {
    /// Check the signature over the unsigned remainder
    pub fn verify(&self, public_key: &[u8; 32]) -> bool {
        verify_cell(public_key, &self.unsigned, &self.signature)
    }
}

/// Parse a body produced by [`SequenceWallet`]
pub fn decode_sequence_transfer(body: &Cell) -> Result<DecodedSequenceTransfer, EncodingError> {
    let (signature, unsigned) = split_signature(body)?;
    let mut s = unsigned.as_slice();
    let wallet_id = s.load_u32()?;
    let valid_until = s.load_u32()?;
    let seqno = s.load_u32()?;

    let mut messages = Vec::new();
    while s.remaining_refs() > 0 {
        let mode = SendMode(s.load_u8()?);
        messages.push((mode, OutboundMessage::from_cell(&s.load_ref()?)?));
    }
    if s.remaining_bits() != 0 {
        return Err(EncodingError::Malformed(format!(
            "{} trailing bits after messages",
            s.remaining_bits()
        )));
    }

    Ok(DecodedSequenceTransfer {
        signature,
        wallet_id,
        valid_until,
        seqno,
        messages,
        unsigned,
    })
}
