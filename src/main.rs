//! Courier command line
//!
//! Sends one transfer from a sequence-number wallet and waits until it is
//! executed. Everything is read from the environment (a `.env` file is
//! honoured):
//!
//! - `COURIER_SECRET_KEY`: hex ed25519 seed of the wallet key
//! - `COURIER_WALLET_ADDRESS`: wallet contract address, or
//!   `COURIER_WALLET_CODE`: base64 BOC of the wallet code, from which the
//!   address is derived in the configured workchain
//! - `COURIER_DESTINATION`, `COURIER_AMOUNT` (nano units), `COURIER_COMMENT`
//! - `COURIER_CONFIG`: optional configuration file

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use courier::message::comment;
use courier::signing::KeyPair;
use courier::wallet::DEFAULT_WALLET_ID;
use courier::{
    Address, Cell, Courier, CourierConfig, CourierError, OutboundMessage, SequenceWallet,
    TransferRequest, Wallet,
};
use tracing::{error, info, warn};

fn required_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} is not set", name))
}

fn load_wallet(config: &CourierConfig, keypair: KeyPair) -> Result<SequenceWallet> {
    let wallet_id = config.wallet_id.unwrap_or(DEFAULT_WALLET_ID);
    if let Ok(code) = std::env::var("COURIER_WALLET_CODE") {
        let code = Cell::from_boc_base64(code.trim()).context("COURIER_WALLET_CODE is not a valid BOC")?;
        return Ok(SequenceWallet::from_code(keypair, wallet_id, config.workchain, code)?);
    }

    let address: Address = required_env("COURIER_WALLET_ADDRESS")?.parse()?;
    config.check_address(&address)?;
    Ok(SequenceWallet::new(keypair, address).with_wallet_id(wallet_id))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config_path = std::env::var("COURIER_CONFIG").ok().map(PathBuf::from);
    let config = CourierConfig::load(config_path.as_deref())?;

    let keypair = KeyPair::from_hex(required_env("COURIER_SECRET_KEY")?.trim())?;
    let wallet = load_wallet(&config, keypair)?;
    let address = wallet.address();
    let destination: Address = required_env("COURIER_DESTINATION")?.parse()?;
    let amount: u128 = required_env("COURIER_AMOUNT")?
        .parse()
        .context("COURIER_AMOUNT must be an integer amount of nano units")?;

    let mut message = OutboundMessage::new(destination, amount);
    if let Ok(text) = std::env::var("COURIER_COMMENT") {
        message = message.with_body(comment(&text)?);
    }

    info!("🚀 Sending {} from {} to {}", amount, address, destination);
    let courier = Courier::from_config(config)?;
    match courier
        .send_and_wait(Arc::new(wallet), TransferRequest::new(vec![message]))
        .await
    {
        Ok(receipt) => {
            info!(
                "✅ Transfer #{} executed at block {} (tx lt {}, hash {})",
                receipt.sequence,
                receipt.block,
                receipt.transaction.lt,
                hex::encode(receipt.transaction.hash)
            );
            Ok(())
        }
        Err(CourierError::Indeterminate { after }) => {
            warn!(
                "⏳ Outcome indeterminate after {:?}; do not resend before checking the wallet",
                after
            );
            std::process::exit(2);
        }
        Err(e) => {
            error!("❌ Delivery failed: {}", e);
            if e.is_safe_to_resubmit() {
                info!("A new transfer can be submitted safely");
            }
            Err(e.into())
        }
    }
}
