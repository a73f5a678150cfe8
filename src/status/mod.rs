//! Processed-status oracle for highload transfers
//!
//! The highload contract exposes a `processed?` get-method that, given an
//! idempotency key, answers whether that key was executed, is still unknown,
//! or has already been garbage-collected.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::address::Address;
use crate::gateway::{BlockHeight, GatewayError, LedgerGateway, StackValue};
use crate::idempotency::IdempotencyKey;
use crate::poll::{broadcast_best_effort, PollAttempt, PollObserver};
use crate::wallet::{EncodingError, SignedTransfer, Wallet};

/// Get-method answering the status of an idempotency key
pub const PROCESSED_METHOD: &str = "processed?";

/// Default pause between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Ledger answer for one idempotency key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedStatus {
    /// Executed exactly once
    Processed,
    /// Not seen yet; may still land
    Unprocessed,
    /// Expired and purged without a record of execution
    Forgotten,
}

impl ProcessedStatus {
    /// Map the contract's response code
    pub fn from_code(code: i128) -> Result<Self, StatusError> {
        match code {
            -1 => Ok(ProcessedStatus::Processed),
            0 => Ok(ProcessedStatus::Unprocessed),
            1 => Ok(ProcessedStatus::Forgotten),
            other => Err(StatusError::ProtocolViolation(format!(
                "{} returned undocumented code {}",
                PROCESSED_METHOD, other
            ))),
        }
    }

    /// Whether polling can stop at this status
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProcessedStatus::Unprocessed)
    }
}

/// Successful end of [`ProcessedStatusOracle::await_terminal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub key: IdempotencyKey,
    /// Block at which the key was seen processed
    pub block: BlockHeight,
    pub attempts: u64,
    pub rebroadcasts: u64,
}

/// Watches one highload wallet account
pub struct ProcessedStatusOracle {
    gateway: Arc<dyn LedgerGateway>,
    address: Address,
    poll_interval: Duration,
    observer: Option<PollObserver>,
}

impl ProcessedStatusOracle {
    /// Oracle for the highload wallet at `address`, polling every second
    pub fn new(gateway: Arc<dyn LedgerGateway>, address: Address) -> Self {
        Self {
            gateway,
            address,
            poll_interval: DEFAULT_POLL_INTERVAL,
            observer: None,
        }
    }

    /// Pause between two polls
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Hook called after every poll
    pub fn with_observer(mut self, observer: PollObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Wallet whose transfers this oracle follows
    pub fn address(&self) -> Address {
        self.address
    }

    /// Single read-only status lookup at the current block
    pub async fn query(&self, key: IdempotencyKey) -> Result<ProcessedStatus, StatusError> {
        let block = self.gateway.current_block_height().await?;
        self.query_at(block, key).await
    }

    async fn query_at(&self, block: BlockHeight, key: IdempotencyKey) -> Result<ProcessedStatus, StatusError> {
        let stack = self
            .gateway
            .call_read_only(
                block,
                &self.address,
                PROCESSED_METHOD,
                &[StackValue::Int(key.as_u64() as i128)],
            )
            .await?;
        let code = stack.first().and_then(StackValue::as_int).ok_or_else(|| {
            StatusError::ProtocolViolation(format!(
                "{} returned a non-integer stack: {:?}",
                PROCESSED_METHOD, stack
            ))
        })?;
        ProcessedStatus::from_code(code)
    }

    /// Poll until `key` is processed or forgotten, re-broadcasting `payload`
    /// while the account is undeployed or the key is still unknown.
    ///
    /// Has no deadline of its own; the ledger forgets the key once its expiry
    /// passes, which ends the loop with [`StatusError::TransferForgotten`].
    pub async fn await_terminal(&self, key: IdempotencyKey, payload: &[u8]) -> Result<StatusReport, StatusError> {
        let block = self.gateway.current_block_height().await?;
        let mut deployed = self
            .gateway
            .read_account_state(block, &self.address)
            .await?
            .exists();

        let mut attempts = 0u64;
        let mut rebroadcasts = 0u64;
        loop {
            attempts += 1;
            if !deployed {
                broadcast_best_effort(self.gateway.as_ref(), payload).await;
                rebroadcasts += 1;
            }

            tokio::time::sleep(self.poll_interval).await;

            let block = self.gateway.current_block_height().await?;
            deployed = self
                .gateway
                .read_account_state(block, &self.address)
                .await?
                .exists();
            if let Some(observer) = &self.observer {
                observer(&PollAttempt {
                    attempt: attempts,
                    block,
                    rebroadcasts,
                });
            }
            if !deployed {
                tracing::debug!("Wallet {} not deployed yet at block {}", self.address, block);
                continue;
            }

            match self.query_at(block, key).await? {
                ProcessedStatus::Processed => {
                    tracing::info!("Transfer {} processed at block {} after {} polls", key, block, attempts);
                    return Ok(StatusReport {
                        key,
                        block,
                        attempts,
                        rebroadcasts,
                    });
                }
                ProcessedStatus::Forgotten => {
                    tracing::warn!("Transfer {} expired without being processed", key);
                    return Err(StatusError::TransferForgotten { key });
                }
                ProcessedStatus::Unprocessed => {
                    tracing::debug!("Transfer {} still unprocessed at block {}", key, block);
                    broadcast_best_effort(self.gateway.as_ref(), payload).await;
                    rebroadcasts += 1;
                }
            }
        }
    }

    /// Broadcast a highload transfer and wait for its terminal status
    pub async fn send_and_confirm<W: Wallet + ?Sized>(
        &self,
        wallet: &W,
        transfer: &SignedTransfer,
    ) -> Result<StatusReport, StatusError> {
        let key = transfer.idempotency_key.ok_or(StatusError::MissingKey)?;
        let block = self.gateway.current_block_height().await?;
        let deployed = self
            .gateway
            .read_account_state(block, &self.address)
            .await?
            .exists();
        let payload = transfer.to_broadcast(wallet, !deployed)?;

        tracing::info!("Sending transfer {} to {}", key, self.address);
        broadcast_best_effort(self.gateway.as_ref(), &payload).await;
        self.await_terminal(key, &payload).await
    }
}

/// Failures of the status oracle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Ledger protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Transfer {key} was forgotten by the ledger before being processed")]
    TransferForgotten { key: IdempotencyKey },

    #[error("Transfer carries no idempotency key")]
    MissingKey,
}

impl StatusError {
    /// Whether a new transfer can be submitted without risking a double spend
    pub fn is_safe_to_resubmit(&self) -> bool {
        matches!(self, StatusError::TransferForgotten { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{AccountState, AccountStatus, ScriptedGateway};
    use parking_lot::Mutex;

    fn active() -> AccountState {
        AccountState {
            status: AccountStatus::Active,
            balance: 1_000_000,
            last_tx: None,
        }
    }

    fn oracle(gw: Arc<ScriptedGateway>) -> ProcessedStatusOracle {
        ProcessedStatusOracle::new(gw, Address::new(0, [4; 32]))
    }

    #[test]
    fn test_code_mapping() {
        assert_eq!(ProcessedStatus::from_code(-1).unwrap(), ProcessedStatus::Processed);
        assert_eq!(ProcessedStatus::from_code(0).unwrap(), ProcessedStatus::Unprocessed);
        assert_eq!(ProcessedStatus::from_code(1).unwrap(), ProcessedStatus::Forgotten);
        for code in [-2, 2, 42, i128::MAX] {
            assert!(matches!(
                ProcessedStatus::from_code(code),
                Err(StatusError::ProtocolViolation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_query_non_integer() {
        let gw = Arc::new(
            ScriptedGateway::new()
                .with_heights([1])
                .with_method(1, PROCESSED_METHOD, vec![StackValue::Null]),
        );
        let err = oracle(gw).query(IdempotencyKey::new(10, 1)).await.unwrap_err();
        assert!(matches!(err, StatusError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_query_propagates_read_failure() {
        let gw = Arc::new(ScriptedGateway::new());
        gw.fail_height_reads(1);
        let err = oracle(gw).query(IdempotencyKey::new(10, 1)).await.unwrap_err();
        assert!(matches!(err, StatusError::Gateway(GatewayError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forgotten_is_fatal() {
        let gw = Arc::new(
            ScriptedGateway::new()
                .with_heights([1, 2])
                .with_account(1, active())
                .with_method(1, PROCESSED_METHOD, vec![StackValue::Int(1)]),
        );
        let key = IdempotencyKey::new(10, 1);
        let err = oracle(gw.clone()).await_terminal(key, b"payload").await.unwrap_err();
        assert_eq!(err, StatusError::TransferForgotten { key });
        assert!(err.is_safe_to_resubmit());
        assert_eq!(gw.broadcast_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebroadcasts_while_undeployed() {
        let gw = Arc::new(
            ScriptedGateway::new()
                .with_heights([1, 2, 3, 4])
                .with_account(4, active())
                .with_method(1, PROCESSED_METHOD, vec![StackValue::Int(-1)]),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let report = oracle(gw.clone())
            .with_observer(Arc::new(move |a: &PollAttempt| sink.lock().push(a.attempt)))
            .await_terminal(IdempotencyKey::new(10, 1), b"payload")
            .await
            .unwrap();

        // undeployed at blocks 1, 2, 3
        assert_eq!(gw.broadcast_count(), 3);
        assert_eq!(report.block, 4);
        assert_eq!(report.attempts, 3);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_confirm_requires_key() {
        use crate::signing::KeyPair;
        use crate::wallet::{SequenceWallet, TransferRequest};

        let wallet = SequenceWallet::new(KeyPair::from_seed([1; 32]), Address::new(0, [4; 32]));
        let transfer = wallet
            .build_transfer(&TransferRequest::new(vec![]).with_sequence(1))
            .unwrap();
        let gw = Arc::new(ScriptedGateway::new());
        let err = oracle(gw).send_and_confirm(&wallet, &transfer).await.unwrap_err();
        assert_eq!(err, StatusError::MissingKey);
    }
}
