//! Courier - signed wallet transfers with confirmed delivery
//!
//! Builds transfers for two wallet contracts and follows them on the ledger
//! until their outcome is known:
//! - highload wallets batch up to 254 messages under an idempotency key and
//!   are confirmed through the contract's `processed?` get-method
//! - sequence-number wallets are confirmed by finding the exact signed body
//!   in the account's transaction history

pub mod address;
pub mod cell;
pub mod config;
pub mod delivery;
pub mod gateway;
pub mod idempotency;
pub mod message;
pub mod poll;
pub mod signing;
pub mod status;
pub mod wallet;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use address::Address;
pub use cell::Cell;
pub use config::CourierConfig;
pub use delivery::{DeliveryReceipt, SequenceWalletDelivery};
pub use gateway::{HttpGateway, LedgerGateway};
pub use idempotency::IdempotencyKey;
pub use message::{OutboundMessage, SendMode};
pub use status::{ProcessedStatus, ProcessedStatusOracle, StatusReport};
pub use wallet::{HighloadWallet, SequenceWallet, SignedTransfer, TransferRequest, Wallet};

/// Entry point tying a gateway to the configured polling behaviour
pub struct Courier {
    gateway: Arc<dyn LedgerGateway>,
    config: CourierConfig,
    observer: Option<poll::PollObserver>,
}

impl Courier {
    /// Courier over an existing gateway
    pub fn new(gateway: Arc<dyn LedgerGateway>, config: CourierConfig) -> Self {
        Self {
            gateway,
            config,
            observer: None,
        }
    }

    /// Courier talking to the HTTP endpoint named in `config`
    pub fn from_config(config: CourierConfig) -> Result<Self, CourierError> {
        config.validate()?;
        let gateway = HttpGateway::new(&config.endpoint, config.request_timeout())?;
        tracing::info!("Using ledger endpoint {}", gateway.endpoint());
        Ok(Self::new(Arc::new(gateway), config))
    }

    /// Hook passed on to every oracle and delivery this courier creates
    pub fn with_observer(mut self, observer: poll::PollObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    /// Shared handle to the ledger gateway
    pub fn gateway(&self) -> Arc<dyn LedgerGateway> {
        self.gateway.clone()
    }

    /// Status oracle for the highload wallet at `address`
    pub fn oracle(&self, address: Address) -> ProcessedStatusOracle {
        let oracle = ProcessedStatusOracle::new(self.gateway.clone(), address)
            .with_poll_interval(self.config.poll_interval());
        match &self.observer {
            Some(observer) => oracle.with_observer(observer.clone()),
            None => oracle,
        }
    }

    /// Delivery driver for a sequence-number wallet
    pub fn delivery(&self, wallet: Arc<dyn Wallet>) -> SequenceWalletDelivery {
        let delivery = SequenceWalletDelivery::new(self.gateway.clone(), wallet)
            .with_poll_interval(self.config.poll_interval());
        match &self.observer {
            Some(observer) => delivery.with_observer(observer.clone()),
            None => delivery,
        }
    }

    /// Current status of a highload transfer
    pub async fn processed_status(
        &self,
        address: Address,
        key: IdempotencyKey,
    ) -> Result<ProcessedStatus, CourierError> {
        Ok(self.oracle(address).query(key).await?)
    }

    /// Build a highload batch, broadcast it and wait for its terminal status
    pub async fn send_batch_and_confirm(
        &self,
        wallet: &HighloadWallet,
        request: TransferRequest,
    ) -> Result<StatusReport, CourierError> {
        let request = match request.timeout {
            Some(_) => request,
            None => request.with_timeout(self.config.transfer_timeout_secs),
        };
        let transfer = wallet.build_transfer(&request)?;
        let oracle = self.oracle(wallet.address());
        with_deadline(self.config.send_timeout(), oracle.send_and_confirm(wallet, &transfer)).await
    }

    /// Send from a sequence-number wallet and wait for execution, bounded by
    /// the configured send timeout
    pub async fn send_and_wait(
        &self,
        wallet: Arc<dyn Wallet>,
        request: TransferRequest,
    ) -> Result<DeliveryReceipt, CourierError> {
        let delivery = self.delivery(wallet);
        with_deadline(self.config.send_timeout(), delivery.send_and_wait(request)).await
    }
}

/// Race `future` against `deadline`, mapping expiry to `Indeterminate`
async fn with_deadline<T, E, F>(deadline: Option<Duration>, future: F) -> Result<T, CourierError>
where
    F: std::future::Future<Output = Result<T, E>>,
    CourierError: From<E>,
{
    match deadline {
        Some(after) => match tokio::time::timeout(after, future).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!("No outcome after {:?}; the transfer may still land", after);
                Err(CourierError::Indeterminate { after })
            }
        },
        None => Ok(future.await?),
    }
}

/// Error types for courier operations
#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Encoding error: {0}")]
    Encoding(#[from] wallet::EncodingError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] gateway::GatewayError),

    #[error("Status error: {0}")]
    Status(#[from] status::StatusError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] delivery::DeliveryError),

    #[error("Address error: {0}")]
    Address(#[from] address::AddressError),

    #[error("Key error: {0}")]
    Signing(#[from] signing::SigningError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] config::ConfigError),

    #[error("Outcome unknown after {after:?}")]
    Indeterminate { after: Duration },
}

impl CourierError {
    /// Whether a new transfer can be submitted without risking a duplicate
    pub fn is_safe_to_resubmit(&self) -> bool {
        match self {
            CourierError::Status(e) => e.is_safe_to_resubmit(),
            CourierError::Delivery(e) => e.is_safe_to_resubmit(),
            CourierError::Encoding(_) => true,
            _ => false,
        }
    }
}
