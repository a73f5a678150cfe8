//! Gateway over the block-addressed v4 HTTP API

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    AccountState, AccountStatus, BlockHeight, GatewayError, LedgerGateway, StackValue,
    TransactionRecord, TxCheckpoint,
};
use crate::address::Address;
use crate::cell::boc::from_boc_multi;
use crate::cell::{Cell, CellBuilder, CellError};

/// HTTP client for one API endpoint
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base: Url,
}

impl HttpGateway {
    /// Client for the v4 API rooted at `endpoint`
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, GatewayError> {
        let base = Url::parse(endpoint)
            .map_err(|e| GatewayError::Rejected(format!("invalid endpoint {}: {}", endpoint, e)))?;
        if base.cannot_be_a_base() {
            return Err(GatewayError::Rejected(format!(
                "endpoint {} cannot carry a path",
                endpoint
            )));
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self { client, base })
    }

    /// Base URL requests are resolved against
    pub fn endpoint(&self) -> &str {
        self.base.as_str()
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // checked in `new`
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, GatewayError> {
        let url = self.url(segments);
        tracing::debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        decode_response(response).await
    }
}

async fn decode_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, GatewayError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::Status {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::Decode(e.to_string()))
}

#[derive(Deserialize)]
struct LatestBlock {
    last: BlockId,
}

#[derive(Deserialize)]
struct BlockId {
    seqno: BlockHeight,
}

#[derive(Deserialize)]
struct AccountEnvelope {
    account: AccountJson,
}

#[derive(Deserialize)]
struct AccountJson {
    state: AccountStateJson,
    balance: BalanceJson,
    last: Option<LastTxJson>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum AccountStateJson {
    Uninit,
    Active,
    Frozen,
}

#[derive(Deserialize)]
struct BalanceJson {
    coins: String,
}

#[derive(Deserialize)]
struct LastTxJson {
    lt: String,
    hash: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunResult {
    exit_code: i32,
    #[serde(default)]
    result: Vec<StackItemJson>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StackItemJson {
    Null,
    Int { value: String },
    Nan,
    Cell { cell: String },
    Slice { cell: String },
    Builder { cell: String },
    Tuple { items: Vec<StackItemJson> },
}

#[derive(Deserialize)]
struct TransactionsJson {
    boc: String,
}

#[derive(Serialize)]
struct SendRequest {
    boc: String,
}

/// Unpadded url-safe base64, the form path segments are expected in
fn path_segment(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn decode_hash(encoded: &str) -> Result<[u8; 32], GatewayError> {
    let bytes = STANDARD
        .decode(encoded)
        .or_else(|_| URL_SAFE.decode(encoded))
        .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
        .map_err(|e| GatewayError::Decode(format!("transaction hash: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| GatewayError::Decode("transaction hash is not 32 bytes".into()))
}

fn parse_number<T: std::str::FromStr>(what: &str, raw: &str) -> Result<T, GatewayError> {
    raw.parse()
        .map_err(|_| GatewayError::Decode(format!("{} is not a number: {}", what, raw)))
}

impl AccountJson {
    fn into_state(self) -> Result<AccountState, GatewayError> {
        let last_tx = match self.last {
            Some(last) => Some(TxCheckpoint::new(
                parse_number("lt", &last.lt)?,
                decode_hash(&last.hash)?,
            )),
            None => None,
        };
        let balance = parse_number("balance", &self.balance.coins)?;
        let status = match self.state {
            AccountStateJson::Active => AccountStatus::Active,
            AccountStateJson::Frozen => AccountStatus::Frozen,
            AccountStateJson::Uninit if last_tx.is_none() && balance == 0 => AccountStatus::Nonexist,
            AccountStateJson::Uninit => AccountStatus::Uninit,
        };
        Ok(AccountState {
            status,
            balance,
            last_tx,
        })
    }
}

impl StackItemJson {
    fn into_value(self) -> Result<StackValue, GatewayError> {
        Ok(match self {
            StackItemJson::Null => StackValue::Null,
            StackItemJson::Nan => StackValue::Nan,
            StackItemJson::Int { value } => StackValue::Int(parse_number("stack integer", &value)?),
            StackItemJson::Cell { cell }
            | StackItemJson::Slice { cell }
            | StackItemJson::Builder { cell } => StackValue::Cell(Cell::from_boc_base64(&cell)?),
            StackItemJson::Tuple { items } => StackValue::Tuple(
                items
                    .into_iter()
                    .map(StackItemJson::into_value)
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

/// Serialize get-method arguments as a VM stack:
/// `depth:24` followed by a chain of `^rest value` entries, last item on top
pub(crate) fn serialize_stack(items: &[StackValue]) -> Result<Cell, CellError> {
    let mut b = CellBuilder::new();
    b.store_uint(items.len() as u64, 24)?;
    store_stack_tail(&mut b, items)?;
    Ok(b.build())
}

fn store_stack_tail(b: &mut CellBuilder, items: &[StackValue]) -> Result<(), CellError> {
    let Some((top, rest)) = items.split_last() else {
        return Ok(());
    };
    let mut tail = CellBuilder::new();
    store_stack_tail(&mut tail, rest)?;
    b.store_ref(tail.build())?;

    match top {
        StackValue::Null => {
            b.store_u8(0x00)?;
        }
        StackValue::Int(v) if i64::try_from(*v).is_ok() => {
            b.store_u8(0x01)?;
            b.store_int(*v, 64)?;
        }
        StackValue::Int(v) => {
            b.store_uint(0x0100, 15)?;
            b.store_int(*v, 257)?;
        }
        StackValue::Nan => {
            b.store_uint(0x02ff, 16)?;
        }
        StackValue::Cell(cell) => {
            b.store_u8(0x03)?;
            b.store_ref(cell.clone())?;
        }
        StackValue::Tuple(_) => return Err(CellError::Unsupported("tuple get-method arguments")),
    }
    Ok(())
}

#[async_trait]
impl LedgerGateway for HttpGateway {
    async fn broadcast(&self, payload: &[u8]) -> Result<(), GatewayError> {
        let url = self.url(&["send"]);
        let request = SendRequest {
            boc: STANDARD.encode(payload),
        };
        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let _: serde_json::Value = decode_response(response).await?;
        Ok(())
    }

    async fn current_block_height(&self) -> Result<BlockHeight, GatewayError> {
        let latest: LatestBlock = self.get_json(&["block", "latest"]).await?;
        Ok(latest.last.seqno)
    }

    async fn read_account_state(
        &self,
        block: BlockHeight,
        address: &Address,
    ) -> Result<AccountState, GatewayError> {
        let envelope: AccountEnvelope = self
            .get_json(&["block", &block.to_string(), &address.to_friendly(true, false)])
            .await?;
        envelope.account.into_state()
    }

    async fn call_read_only(
        &self,
        block: BlockHeight,
        address: &Address,
        method: &str,
        args: &[StackValue],
    ) -> Result<Vec<StackValue>, GatewayError> {
        let block = block.to_string();
        let address = address.to_friendly(true, false);
        let encoded_args;
        let mut segments = vec!["block", block.as_str(), address.as_str(), "run", method];
        if !args.is_empty() {
            encoded_args = path_segment(&serialize_stack(args)?.to_boc());
            segments.push(&encoded_args);
        }

        let run: RunResult = self.get_json(&segments).await?;
        if run.exit_code != 0 && run.exit_code != 1 {
            return Err(GatewayError::MethodFailed {
                method: method.to_string(),
                exit_code: run.exit_code,
            });
        }
        run.result.into_iter().map(StackItemJson::into_value).collect()
    }

    async fn read_recent_transactions(
        &self,
        address: &Address,
        since: &TxCheckpoint,
        limit: Option<usize>,
    ) -> Result<Vec<TransactionRecord>, GatewayError> {
        let lt = since.lt.to_string();
        let hash = path_segment(&since.hash);
        let response: TransactionsJson = self
            .get_json(&["account", &address.to_friendly(true, false), "tx", &lt, &hash])
            .await?;

        let bytes = STANDARD
            .decode(&response.boc)
            .map_err(|e| GatewayError::Decode(format!("transactions boc: {}", e)))?;
        let roots = from_boc_multi(&bytes)?;
        let take = limit.unwrap_or(roots.len());
        let records = roots
            .iter()
            .take(take)
            .map(TransactionRecord::from_cell)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            "Fetched {} transactions of {} from lt {}",
            records.len(),
            address,
            since.lt
        );
        Ok(records)
    }
}
