use crate::types::TxHash;
use std::fmt;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Failures surfaced by the wallet session, the contract handles and the
/// transaction lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncError {
    /// No wallet endpoint is configured or it cannot be reached.
    WalletUnavailable,
    /// The user declined the access prompt or a signature request.
    UserRejected(String),
    /// A read, a submission or the confirmation wait could not reach the node.
    RpcFailure(String),
    /// Contract logic rejected the transaction.
    TransactionReverted {
        reason: String,
        tx_hash: Option<TxHash>,
    },
    /// The session that owned a write ended before it settled.
    SessionClosed,
}

impl SyncError {
    pub fn rpc(message: impl Into<String>) -> Self {
        SyncError::RpcFailure(message.into())
    }

    /// The message shown to the user: the revert reason when there is one,
    /// otherwise whatever the wallet or node reported.
    pub fn reason(&self) -> String {
        match self {
            SyncError::WalletUnavailable => "no wallet provider available".to_string(),
            SyncError::UserRejected(reason) => reason.clone(),
            SyncError::RpcFailure(reason) => reason.clone(),
            SyncError::TransactionReverted { reason, .. } => reason.clone(),
            SyncError::SessionClosed => {
                "wallet session ended before the transaction settled".to_string()
            }
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SyncError::WalletUnavailable)
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::WalletUnavailable => write!(f, "wallet unavailable"),
            SyncError::UserRejected(reason) => write!(f, "user rejected: {reason}"),
            SyncError::RpcFailure(reason) => write!(f, "rpc failure: {reason}"),
            SyncError::TransactionReverted {
                reason,
                tx_hash: Some(hash),
            } => write!(f, "transaction {} reverted: {reason}", hash.short()),
            SyncError::TransactionReverted {
                reason,
                tx_hash: None,
            } => write!(f, "transaction reverted: {reason}"),
            SyncError::SessionClosed => write!(f, "wallet session closed"),
        }
    }
}

impl std::error::Error for SyncError {}
