use crate::{
    abi,
    config::DEFAULT_REQUEST_TIMEOUT,
    error::{
        Result,
        SyncError,
    },
    types::{
        Address,
        TxHash,
    },
};
use serde::Deserialize;
use serde_json::{
    Value,
    json,
};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};

/// EIP-1193 code for "the user rejected the request".
pub const USER_REJECTED_CODE: i64 = 4001;
/// Code nodes use for execution reverted during `eth_call`/gas estimation.
pub const EXECUTION_REVERTED_CODE: i64 = 3;

#[derive(Clone, Debug, PartialEq)]
pub enum RpcError {
    /// The endpoint could not be reached or answered with something that is
    /// not JSON-RPC.
    Transport(String),
    /// A well-formed JSON-RPC error object.
    Response {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl RpcError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }

    fn revert_data(&self) -> Option<Vec<u8>> {
        let RpcError::Response {
            data: Some(data), ..
        } = self
        else {
            return None;
        };
        let raw = match data {
            Value::String(raw) => raw.as_str(),
            Value::Object(fields) => fields.get("data")?.as_str()?,
            _ => return None,
        };
        decode_hex(raw).ok()
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Transport(message) => write!(f, "transport error: {message}"),
            RpcError::Response { code, message, .. } => {
                write!(f, "rpc error {code}: {message}")
            }
        }
    }
}

impl std::error::Error for RpcError {}

impl From<RpcError> for SyncError {
    fn from(err: RpcError) -> Self {
        if let Some(reason) = err.revert_data().as_deref().and_then(abi::decode_revert_reason)
        {
            return SyncError::TransactionReverted {
                reason,
                tx_hash: None,
            };
        }
        match err {
            RpcError::Transport(message) => SyncError::RpcFailure(message),
            RpcError::Response {
                code: USER_REJECTED_CODE,
                message,
                ..
            } => SyncError::UserRejected(message),
            RpcError::Response {
                code: EXECUTION_REVERTED_CODE,
                message,
                ..
            } => SyncError::TransactionReverted {
                reason: message,
                tx_hash: None,
            },
            RpcError::Response { message, .. } => SyncError::RpcFailure(message),
        }
    }
}

/// A JSON-RPC endpoint. Clones share the underlying connection.
pub trait RpcTransport: Clone + Send + Sync + 'static {
    fn request(
        &self,
        method: &'static str,
        params: Value,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send;
}

#[derive(Clone)]
pub struct HttpTransport {
    url: Arc<str>,
    http: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Requests that get no answer within `timeout` fail as transport errors.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url: String = url.into();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::rpc(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.trim_end_matches('/').into(),
            http,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport").field("url", &self.url).finish()
    }
}

#[derive(Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl RpcTransport for HttpTransport {
    async fn request(&self, method: &'static str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        tracing::debug!(%method, id, url = %self.url, "rpc request");
        let res = self
            .http
            .post(&*self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(format!("{method} request failed: {e}")))?;
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| RpcError::Transport(format!("failed to read {method} response: {e}")))?;
        let envelope: ResponseEnvelope = serde_json::from_slice(&bytes).map_err(|e| {
            let body = String::from_utf8_lossy(&bytes);
            RpcError::Transport(format!(
                "endpoint responded with {status} and a non JSON-RPC body ({e}): {body}"
            ))
        })?;
        if let Some(error) = envelope.error {
            return Err(RpcError::Response {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        Ok(envelope.result)
    }
}

pub fn quantity(value: u128) -> String {
    format!("{value:#x}")
}

pub fn parse_quantity(value: &Value) -> Result<u64> {
    let raw = value
        .as_str()
        .ok_or_else(|| SyncError::rpc(format!("expected hex quantity, got {value}")))?;
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16)
        .map_err(|e| SyncError::rpc(format!("invalid hex quantity {raw:?}: {e}")))
}

pub fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(digits).map_err(|e| SyncError::rpc(format!("invalid hex data: {e}")))
}

pub fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn parse_accounts(value: &Value) -> Result<Vec<Address>> {
    let entries = value
        .as_array()
        .ok_or_else(|| SyncError::rpc(format!("expected account list, got {value}")))?;
    entries
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .ok_or_else(|| SyncError::rpc("account entry is not a string"))?
                .parse::<Address>()
                .map_err(|e| SyncError::rpc(e.to_string()))
        })
        .collect()
}

pub fn parse_tx_hash(value: &Value) -> Result<TxHash> {
    value
        .as_str()
        .ok_or_else(|| SyncError::rpc(format!("expected transaction hash, got {value}")))?
        .parse::<TxHash>()
        .map_err(|e| SyncError::rpc(e.to_string()))
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn into_sync_error__maps_user_rejection_code() {
        // given
        let err = RpcError::Response {
            code: USER_REJECTED_CODE,
            message: "User denied transaction signature".to_string(),
            data: None,
        };

        // when
        let mapped = SyncError::from(err);

        // then
        assert_eq!(
            mapped,
            SyncError::UserRejected("User denied transaction signature".to_string())
        );
    }

    #[test]
    fn into_sync_error__prefers_decoded_revert_reason_over_message() {
        // given
        let data = encode_hex(&abi::encode_revert_reason("Lottery is not open"));
        let err = RpcError::Response {
            code: -32000,
            message: "execution reverted".to_string(),
            data: Some(Value::String(data)),
        };

        // when
        let mapped = SyncError::from(err);

        // then
        assert_eq!(
            mapped,
            SyncError::TransactionReverted {
                reason: "Lottery is not open".to_string(),
                tx_hash: None,
            }
        );
    }

    #[test]
    fn into_sync_error__reads_nested_revert_data() {
        let data = encode_hex(&abi::encode_revert_reason("Only owner"));
        let err = RpcError::Response {
            code: EXECUTION_REVERTED_CODE,
            message: "execution reverted".to_string(),
            data: Some(json!({ "data": data })),
        };
        assert_eq!(SyncError::from(err).reason(), "Only owner");
    }

    #[test]
    fn into_sync_error__falls_back_to_node_message() {
        let err = RpcError::Response {
            code: -32603,
            message: "header not found".to_string(),
            data: None,
        };
        assert_eq!(
            SyncError::from(err),
            SyncError::RpcFailure("header not found".to_string())
        );
    }

    #[test]
    fn parse_quantity__reads_hex_numbers() {
        assert_eq!(parse_quantity(&json!("0x1")), Ok(1));
        assert_eq!(parse_quantity(&json!("0xaa36a7")), Ok(11_155_111));
        assert!(parse_quantity(&json!(5)).is_err());
    }

    #[test]
    fn quantity__renders_minimal_hex() {
        assert_eq!(quantity(0), "0x0");
        assert_eq!(quantity(10_000_000_000_000_000), "0x2386f26fc10000");
    }

    #[test]
    fn parse_accounts__accepts_mixed_case_entries() {
        let value = json!(["0x9E8C9d5d8C27A0D3b9Ad96889E64d0eb0722Bd64"]);
        let accounts = parse_accounts(&value).unwrap();
        assert_eq!(
            accounts[0].to_string(),
            "0x9e8c9d5d8c27a0d3b9ad96889e64d0eb0722bd64"
        );
    }
}
