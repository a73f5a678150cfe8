//! Confirmed delivery for sequence-number wallets
//!
//! A [`DeliverySession`] walks the account forward one block at a time:
//!
//! ```text
//! Init -> AwaitingAdvance <-> Reconciling -> Done
//! ```
//!
//! Each transition is one call to [`DeliverySession::step`]. Broadcast
//! failures are downgraded to [`BroadcastOutcome::Ignored`] and retried by the
//! next cycle; read failures and reconciliation faults end the session with a
//! [`DeliveryError`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::gateway::{AccountState, BlockHeight, GatewayError, LedgerGateway, TransactionRecord, TxCheckpoint};
use crate::poll::{broadcast_best_effort, BroadcastOutcome, PollAttempt, PollObserver};
use crate::status::DEFAULT_POLL_INTERVAL;
use crate::wallet::{EncodingError, SignedTransfer, TransferRequest, Wallet};

/// Get-method returning the wallet's current sequence number
pub const SEQNO_METHOD: &str = "seqno";

/// Where a session currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryPhase {
    /// Waiting for a block newer than the last one inspected
    AwaitingAdvance,
    /// A newer block is known and has to be checked
    Reconciling { block: BlockHeight },
    /// The transfer was found in the account history
    Done(DeliveryReceipt),
}

impl DeliveryPhase {
    /// Whether the session reached its receipt
    pub fn is_done(&self) -> bool {
        matches!(self, DeliveryPhase::Done(_))
    }
}

/// Proof that the transfer was executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Sequence number the executed transfer was bound to
    pub sequence: u32,
    /// First block at which execution was observed
    pub block: BlockHeight,
    /// Transaction carrying the transfer
    pub transaction: TxCheckpoint,
    /// Re-broadcasts issued after the initial one
    pub rebroadcasts: u64,
}

/// The transfer currently in flight together with its broadcast bytes
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub transfer: SignedTransfer,
    pub payload: Vec<u8>,
}

/// What the session knows about the account
#[derive(Debug, Clone)]
pub struct WalletDeliveryState {
    /// Last block inspected
    pub last_block: BlockHeight,
    /// Sequence number the pending transfer is bound to
    pub last_sequence: u32,
    /// Newest transaction known before the pending transfer was sent
    pub checkpoint: Option<TxCheckpoint>,
    pub pending: PendingTransfer,
}

/// Sends transfers from a sequence-number wallet and waits for them to land
pub struct SequenceWalletDelivery {
    gateway: Arc<dyn LedgerGateway>,
    wallet: Arc<dyn Wallet>,
    poll_interval: Duration,
    observer: Option<PollObserver>,
}

impl SequenceWalletDelivery {
    /// Delivery for `wallet`, polling every second by default
    pub fn new(gateway: Arc<dyn LedgerGateway>, wallet: Arc<dyn Wallet>) -> Self {
        Self {
            gateway,
            wallet,
            poll_interval: DEFAULT_POLL_INTERVAL,
            observer: None,
        }
    }

    /// Pause between two block height reads
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Hook called after every block height read
    pub fn with_observer(mut self, observer: PollObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Deliver `request` and wait until the wallet executed it.
    ///
    /// Never gives up on its own; bound it with `tokio::time::timeout` and
    /// treat an elapsed timer as an indeterminate outcome.
    pub async fn send_and_wait(&self, request: TransferRequest) -> Result<DeliveryReceipt, DeliveryError> {
        let mut session = self.start(request).await?;
        loop {
            if let DeliveryPhase::Done(receipt) = session.step().await? {
                return Ok(receipt);
            }
        }
    }

    /// Run the Init step: read the account, build the first transfer and
    /// broadcast it
    pub async fn start(&self, request: TransferRequest) -> Result<DeliverySession<'_>, DeliveryError> {
        let address = self.wallet.address();
        let block = self.gateway.current_block_height().await?;
        let account = self.gateway.read_account_state(block, &address).await?;
        let sequence = self.read_sequence(block, &account).await?;

        let pending = self.prepare(&request, sequence, &account)?;
        tracing::info!(
            "Delivering transfer #{} from {} (block {}, deployed: {})",
            sequence,
            address,
            block,
            account.exists()
        );

        let mut session = DeliverySession {
            delivery: self,
            request,
            state: WalletDeliveryState {
                last_block: block,
                last_sequence: sequence,
                checkpoint: account.last_tx,
                pending,
            },
            phase: DeliveryPhase::AwaitingAdvance,
            polls: 0,
            rebroadcasts: 0,
        };
        session.broadcast().await;
        Ok(session)
    }

    async fn read_sequence(&self, block: BlockHeight, account: &AccountState) -> Result<u32, DeliveryError> {
        if !account.exists() {
            return Ok(0);
        }
        let stack = self
            .gateway
            .call_read_only(block, &self.wallet.address(), SEQNO_METHOD, &[])
            .await?;
        stack
            .first()
            .and_then(|v| v.as_int())
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| {
                DeliveryError::ProtocolViolation(format!(
                    "{} returned {:?} at block {}",
                    SEQNO_METHOD, stack, block
                ))
            })
    }

    fn prepare(
        &self,
        request: &TransferRequest,
        sequence: u32,
        account: &AccountState,
    ) -> Result<PendingTransfer, DeliveryError> {
        let request = request.clone().with_sequence(sequence);
        let transfer = self.wallet.build_transfer(&request)?;
        let payload = transfer.to_broadcast(self.wallet.as_ref(), !account.exists())?;
        Ok(PendingTransfer { transfer, payload })
    }
}

/// One in-flight delivery
pub struct DeliverySession<'a> {
    delivery: &'a SequenceWalletDelivery,
    request: TransferRequest,
    state: WalletDeliveryState,
    phase: DeliveryPhase,
    polls: u64,
    rebroadcasts: u64,
}

impl DeliverySession<'_> {
    /// Phase reached by the last successful step
    pub fn phase(&self) -> &DeliveryPhase {
        &self.phase
    }

    /// Account view and in-flight transfer
    pub fn state(&self) -> &WalletDeliveryState {
        &self.state
    }

    /// Re-broadcasts issued after the initial one
    pub fn rebroadcasts(&self) -> u64 {
        self.rebroadcasts
    }

    /// Perform one transition and return the new phase.
    /// Stepping a finished session returns its receipt again.
    pub async fn step(&mut self) -> Result<DeliveryPhase, DeliveryError> {
        let next = match self.phase.clone() {
            DeliveryPhase::AwaitingAdvance => self.await_advance().await?,
            DeliveryPhase::Reconciling { block } => self.reconcile(block).await?,
            done @ DeliveryPhase::Done(_) => done,
        };
        self.phase = next.clone();
        Ok(next)
    }

    async fn broadcast(&self) -> BroadcastOutcome {
        broadcast_best_effort(self.delivery.gateway.as_ref(), &self.state.pending.payload).await
    }

    async fn rebroadcast(&mut self) -> BroadcastOutcome {
        self.rebroadcasts += 1;
        self.broadcast().await
    }

    async fn await_advance(&mut self) -> Result<DeliveryPhase, DeliveryError> {
        tokio::time::sleep(self.delivery.poll_interval).await;
        let block = self.delivery.gateway.current_block_height().await?;
        self.polls += 1;
        if let Some(observer) = &self.delivery.observer {
            observer(&PollAttempt {
                attempt: self.polls,
                block,
                rebroadcasts: self.rebroadcasts,
            });
        }

        if block <= self.state.last_block {
            return Ok(DeliveryPhase::AwaitingAdvance);
        }
        self.state.last_block = block;
        Ok(DeliveryPhase::Reconciling { block })
    }

    async fn reconcile(&mut self, block: BlockHeight) -> Result<DeliveryPhase, DeliveryError> {
        let gateway = self.delivery.gateway.as_ref();
        let address = self.delivery.wallet.address();
        let account = gateway.read_account_state(block, &address).await?;
        let sequence = self.delivery.read_sequence(block, &account).await?;

        if sequence == self.state.last_sequence {
            tracing::debug!(
                "Sequence still {} at block {}, re-broadcasting",
                sequence,
                block
            );
            self.rebroadcast().await;
            return Ok(DeliveryPhase::AwaitingAdvance);
        }

        let head = account.last_tx.ok_or_else(|| {
            DeliveryError::InternalConsistency(format!(
                "sequence moved {} -> {} but the account has no transactions",
                self.state.last_sequence, sequence
            ))
        })?;
        let history = gateway.read_recent_transactions(&address, &head, None).await?;
        let fresh = self.fresh_transactions(&history)?;

        let body = &self.state.pending.transfer.body;
        if let Some(tx) = fresh.iter().find(|tx| tx.in_msg_body.as_ref() == Some(body)) {
            let receipt = DeliveryReceipt {
                sequence: self.state.pending.transfer.sequence,
                block,
                transaction: tx.checkpoint(),
                rebroadcasts: self.rebroadcasts,
            };
            tracing::info!(
                "Transfer #{} from {} executed in tx at lt {} (block {})",
                receipt.sequence,
                address,
                tx.lt,
                block
            );
            return Ok(DeliveryPhase::Done(receipt));
        }

        if self.state.checkpoint.is_none() && !history.last().is_some_and(TransactionRecord::is_first) {
            return Err(DeliveryError::ReconciliationGap {
                checkpoint: None,
                window: history.len(),
            });
        }

        tracing::warn!(
            "Sequence advanced {} -> {} by another transfer, rebuilding",
            self.state.last_sequence,
            sequence
        );
        self.state.pending = self.delivery.prepare(&self.request, sequence, &account)?;
        self.state.last_sequence = sequence;
        self.state.checkpoint = Some(head);
        self.rebroadcast().await;
        Ok(DeliveryPhase::AwaitingAdvance)
    }

    /// Transactions strictly newer than the checkpoint. Without a checkpoint
    /// the whole window counts, and the caller has to check that it reaches
    /// the account's first transaction before drawing conclusions from it.
    fn fresh_transactions<'h>(&self, history: &'h [TransactionRecord]) -> Result<&'h [TransactionRecord], DeliveryError> {
        let Some(checkpoint) = self.state.checkpoint else {
            return Ok(history);
        };
        match history.iter().position(|tx| tx.checkpoint() == checkpoint) {
            None => Err(DeliveryError::ReconciliationGap {
                checkpoint: Some(checkpoint),
                window: history.len(),
            }),
            Some(0) => Err(DeliveryError::InternalConsistency(format!(
                "checkpoint at lt {} is still the newest transaction after a sequence change",
                checkpoint.lt
            ))),
            Some(index) => Ok(&history[..index]),
        }
    }
}

/// Failures ending a delivery session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Ledger protocol violation: {0}")]
    ProtocolViolation(String),

    /// The history window does not reach back to `checkpoint` (or to the
    /// account's first transaction when there is none)
    #[error(
        "{window} recent transactions do not reach {}",
        .checkpoint.map_or_else(|| "the first transaction".to_string(), |c| format!("the checkpoint at lt {}", c.lt))
    )]
    ReconciliationGap { checkpoint: Option<TxCheckpoint>, window: usize },

    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),
}

impl DeliveryError {
    /// Whether submitting a new transfer cannot duplicate a partial effect
    pub fn is_safe_to_resubmit(&self) -> bool {
        matches!(self, DeliveryError::ReconciliationGap { .. })
    }

    /// Faults that indicate a broken ledger or gateway rather than bad luck
    pub fn needs_investigation(&self) -> bool {
        matches!(
            self,
            DeliveryError::InternalConsistency(_) | DeliveryError::ProtocolViolation(_)
        )
    }
}
