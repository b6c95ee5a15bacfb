use crate::types::Address;
use std::time::Duration;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_WALLET_WATCH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub contract: Address,
    /// Value attached to every `enter` call, in wei.
    pub entry_fee: u128,
    /// Period of the snapshot poller while a session is active.
    pub refresh_interval: Duration,
    /// How often the wallet is asked for its accounts and chain id.
    pub wallet_watch_interval: Duration,
    pub receipt_poll_interval: Duration,
    pub confirmation_timeout: Duration,
    /// Upper bound on a single node request, and on the refresh that follows
    /// a settled transaction.
    pub request_timeout: Duration,
}

impl EngineConfig {
    pub fn new(contract: Address, entry_fee: u128) -> Self {
        Self {
            contract,
            entry_fee,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            wallet_watch_interval: DEFAULT_WALLET_WATCH_INTERVAL,
            receipt_poll_interval: DEFAULT_RECEIPT_POLL_INTERVAL,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_wallet_watch_interval(mut self, interval: Duration) -> Self {
        self.wallet_watch_interval = interval;
        self
    }

    pub fn with_receipt_poll_interval(mut self, interval: Duration) -> Self {
        self.receipt_poll_interval = interval;
        self
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
