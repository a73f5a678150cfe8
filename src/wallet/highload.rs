//! Stateless-nonce ("highload") wallet
//!
//! Packs up to [`MAX_BATCH_MESSAGES`] sub-messages into one signed payload:
//!
//! ```text
//! signature:512 || wallet_id:32 || query_id:64 || HashmapE 16 (int16 -> (mode:8, ^message))
//! ```
//!
//! `query_id` is an [`IdempotencyKey`]. Nothing is read from the ledger while
//! building, so the same wallet can prepare any number of transfers offline.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::{mode_and_message, sign_payload, split_signature, EncodingError, SignedTransfer, TransferRequest, Wallet};
use crate::address::Address;
use crate::cell::{dict, Cell, CellBuilder};
use crate::idempotency::{Clock, IdempotencyKey, SystemClock};
use crate::message::{state_init, OutboundMessage, SendMode};
use crate::signing::{verify_cell, KeyPair, SIGNATURE_LEN};

/// Dictionary capacity accepted by the deployed contract
pub const MAX_BATCH_MESSAGES: usize = 254;

const INDEX_BITS: usize = 16;

/// Highload wallet bound to one key pair and sub-wallet id
pub struct HighloadWallet {
    keypair: KeyPair,
    wallet_id: u32,
    address: Address,
    state_init: Option<Cell>,
    clock: Arc<dyn Clock>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl HighloadWallet {
    /// Wallet already deployed at `address`
    pub fn new(keypair: KeyPair, address: Address) -> Self {
        Self {
            keypair,
            wallet_id: 0,
            address,
            state_init: None,
            clock: Arc::new(SystemClock),
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
        }
    }

    /// Wallet whose address is derived from the contract `code` and the
    /// initial data for `keypair` / `wallet_id`
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

    /// Initial contract data: `wallet_id:32 last_cleaned:64 public_key:256 old_queries:(HashmapE 64)`
    pub fn data_cell(public_key: &[u8; 32], wallet_id: u32) -> Result<Cell, EncodingError> {
        let mut b = CellBuilder::new();
        b.store_u32(wallet_id)?;
        b.store_u64(0)?;
        b.store_bytes(public_key)?;
        b.store_bit(false)?;
        Ok(b.build())
    }

    /// Sub-wallet id signed into every batch
    pub fn with_wallet_id(mut self, wallet_id: u32) -> Self {
        self.wallet_id = wallet_id;
        self
    }

    /// `StateInit` attached while the wallet is undeployed
    pub fn with_state_init(mut self, state_init: Cell) -> Self {
        self.state_init = Some(state_init);
        self
    }

    /// Clock used for key expiry
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the randomness source used for absent sequence numbers
    pub fn with_rng<R: RngCore + Send + 'static>(mut self, rng: R) -> Self {
        self.rng = Mutex::new(Box::new(rng));
        self
    }

    pub fn wallet_id(&self) -> u32 {
        self.wallet_id
    }

    /// Key the contract checks signatures against
    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key()
    }

    /// Key that a transfer built now with these parameters would use
    pub fn idempotency_key(&self, timeout: Option<u32>, sequence: Option<u32>) -> IdempotencyKey {
        let mut rng = self.rng.lock();
        IdempotencyKey::generate(self.clock.as_ref(), &mut **rng, timeout, sequence)
    }

    fn unsigned_payload(
        &self,
        key: IdempotencyKey,
        default_mode: SendMode,
        messages: &[OutboundMessage],
    ) -> Result<Cell, EncodingError> {
        let mut entries = BTreeMap::new();
        for (index, message) in messages.iter().enumerate() {
            let mode = message.mode.unwrap_or(default_mode);
            entries.insert(index as u64, mode_and_message(mode, message)?);
        }

        let mut b = CellBuilder::new();
        b.store_u32(self.wallet_id)?;
        b.store_u64(key.as_u64())?;
        dict::store_dict(&mut b, INDEX_BITS, &entries)?;
        Ok(b.build())
    }
}

impl Wallet for HighloadWallet {
    fn address(&self) -> Address {
        self.address
    }

    fn state_init(&self) -> Option<Cell> {
        self.state_init.clone()
    }

    fn build_transfer(&self, request: &TransferRequest) -> Result<SignedTransfer, EncodingError> {
        if request.messages.len() > MAX_BATCH_MESSAGES {
            return Err(EncodingError::TooManyMessages {
                count: request.messages.len(),
                max: MAX_BATCH_MESSAGES,
            });
        }

        let key = self.idempotency_key(request.timeout, request.sequence);
        let unsigned = self.unsigned_payload(key, request.send_mode, &request.messages)?;
        let body = sign_payload(&self.keypair, &unsigned)?;

        tracing::debug!(
            "Built highload transfer {} with {} messages (body {})",
            key,
            request.messages.len(),
            &body.hash_hex()[..8]
        );

        Ok(SignedTransfer {
            body,
            sequence: key.sequence(),
            expires_at: key.expires_at(),
            idempotency_key: Some(key),
        })
    }
}

/// Parsed highload transfer body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    pub signature: [u8; SIGNATURE_LEN],
    pub wallet_id: u32,
    pub key: IdempotencyKey,
    /// Sub-messages in index order with their effective send mode
    pub messages: Vec<(SendMode, OutboundMessage)>,
    unsigned: Cell,
}

impl DecodedBatch {
    /// Check the signature against `public_key`
    pub fn verify(&self, public_key: &[u8; 32]) -> bool {
        verify_cell(public_key, &self.unsigned, &self.signature)
    }
}

/// Parse a highload transfer body back into its parts
pub fn decode_batch(body: &Cell) -> Result<DecodedBatch, EncodingError> {
    let (signature, unsigned) = split_signature(body)?;
    let mut s = unsigned.as_slice();
    let wallet_id = s.load_u32()?;
    let key = IdempotencyKey::from_u64(s.load_u64()?);
    let entries = dict::load_dict(&mut s, INDEX_BITS)?;

    let mut messages = Vec::with_capacity(entries.len());
    for (expected, (index, mut value)) in entries.into_iter().enumerate() {
        let index = index as u16 as i16;
        if index as i64 != expected as i64 {
            return Err(EncodingError::Malformed(format!(
                "sub-message index {} where {} was expected",
                index, expected
            )));
        }
        let mode = SendMode(value.load_u8()?);
        let message = OutboundMessage::from_cell(&value.load_ref()?)?;
        messages.push((mode, message));
    }

    Ok(DecodedBatch {
        signature,
        wallet_id,
        key,
        messages,
        unsigned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::FixedClock;
    use crate::message::comment;

    fn wallet() -> HighloadWallet {
        HighloadWallet::new(KeyPair::from_seed([3u8; 32]), Address::new(0, [0xAB; 32]))
            .with_wallet_id(7)
            .with_clock(Arc::new(FixedClock(1_700_000_000)))
            .with_rng(StdRng::seed_from_u64(42))
    }

    fn messages(n: usize) -> Vec<OutboundMessage> {
        (0..n)
            .map(|i| OutboundMessage::new(Address::new(0, [i as u8; 32]), 1_000 + i as u128))
            .collect()
    }

    #[test]
    fn test_build_and_decode() {
        let w = wallet();
        let mut msgs = messages(3);
        msgs[1] = msgs[1].clone().with_mode(SendMode::CARRY_ALL_BALANCE);
        msgs[2] = msgs[2].clone().with_body(comment("batch").unwrap());

        let request = TransferRequest::new(msgs.clone())
            .with_sequence(11)
            .with_timeout(60);
        let transfer = w.build_transfer(&request).unwrap();
        assert_eq!(transfer.sequence, 11);
        assert_eq!(transfer.expires_at, 1_700_000_060);

        let decoded = decode_batch(&transfer.body).unwrap();
        assert_eq!(decoded.wallet_id, 7);
        assert_eq!(decoded.key, IdempotencyKey::new(1_700_000_060, 11));
        assert!(decoded.verify(&w.public_key()));
        assert!(!decoded.verify(&KeyPair::from_seed([4u8; 32]).public_key()));

        let modes: Vec<u8> = decoded.messages.iter().map(|(m, _)| m.bits()).collect();
        assert_eq!(modes, vec![3, 128, 3]);
        for ((_, got), want) in decoded.messages.iter().zip(&msgs) {
            assert_eq!(got.destination, want.destination);
            assert_eq!(got.value, want.value);
            assert_eq!(got.body, want.body);
        }
    }

    #[test]
    fn test_identical_inputs_identical_bytes() {
        let w = wallet();
        let request = TransferRequest::new(messages(2)).with_sequence(1);
        let a = w.build_transfer(&request).unwrap();
        let b = w.build_transfer(&request).unwrap();
        assert_eq!(a.body.to_boc(), b.body.to_boc());
    }

    #[test]
    fn test_random_sequence_from_injected_rng() {
        let request = TransferRequest::new(messages(1));
        let a = wallet().build_transfer(&request).unwrap();
        let b = wallet().build_transfer(&request).unwrap();
        assert_eq!(a.idempotency_key, b.idempotency_key);

        let expected = StdRng::seed_from_u64(42).next_u32();
        assert_eq!(a.sequence, expected);
    }

    #[test]
    fn test_capacity_limit() {
        let w = wallet();
        assert!(w.build_transfer(&TransferRequest::new(messages(MAX_BATCH_MESSAGES))).is_ok());
        let err = w
            .build_transfer(&TransferRequest::new(messages(MAX_BATCH_MESSAGES + 1)))
            .unwrap_err();
        assert_eq!(
            err,
            EncodingError::TooManyMessages {
                count: 255,
                max: 254
            }
        );
    }

    #[test]
    fn test_empty_batch() {
        let transfer = wallet().build_transfer(&TransferRequest::new(Vec::new())).unwrap();
        let decoded = decode_batch(&transfer.body).unwrap();
        assert!(decoded.messages.is_empty());
    }

    #[test]
    fn test_from_code_derives_address() {
        let kp = KeyPair::from_seed([5u8; 32]);
        let w = HighloadWallet::from_code(kp.clone(), 1, 0, Cell::empty()).unwrap();
        let data = HighloadWallet::data_cell(&kp.public_key(), 1).unwrap();
        let init = state_init(Cell::empty(), data).unwrap();
        assert_eq!(w.address(), Address::from_state_init(0, &init));
        assert_eq!(w.state_init(), Some(init));
    }

    #[test]
    fn test_decode_rejects_gaps() {
        let w = wallet();
        let msg = OutboundMessage::new(Address::new(0, [1; 32]), 1);
        let mut entries = BTreeMap::new();
        entries.insert(0u64, mode_and_message(SendMode::default(), &msg).unwrap());
        entries.insert(2u64, mode_and_message(SendMode::default(), &msg).unwrap());

        let mut b = CellBuilder::new();
        b.store_u32(0).unwrap();
        b.store_u64(0).unwrap();
        dict::store_dict(&mut b, INDEX_BITS, &entries).unwrap();
        let body = sign_payload(&w.keypair, &b.build()).unwrap();

        assert!(matches!(decode_batch(&body), Err(EncodingError::Malformed(_))));
    }
}
