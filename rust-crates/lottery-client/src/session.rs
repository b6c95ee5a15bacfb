//! The binding to the user's wallet.
//!
//! A [`WalletConnector`] turns an optional wallet endpoint into a [`Session`]
//! and watches the wallet for account and network switches. The endpoint
//! holds the signing keys; a session only carries the address it may sign for.

use crate::{
    error::{
        Result,
        SyncError,
    },
    rpc::{
        RpcError,
        RpcTransport,
        parse_accounts,
        parse_quantity,
    },
    task::AbortOnDrop,
    types::Address,
};
use serde_json::json;
use std::time::Duration;
use tokio::{
    sync::{
        mpsc,
        watch,
    },
    time::{
        self,
        MissedTickBehavior,
    },
};
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
}

#[derive(Clone, Debug)]
pub struct WalletConnector<T> {
    wallet: Option<T>,
    watch_interval: Duration,
}

impl<T: RpcTransport> WalletConnector<T> {
    pub fn new(wallet: Option<T>, watch_interval: Duration) -> Self {
        Self {
            wallet,
            watch_interval,
        }
    }

    pub fn is_available(&self) -> bool {
        self.wallet.is_some()
    }

    fn wallet(&self) -> Result<&T> {
        self.wallet.as_ref().ok_or(SyncError::WalletUnavailable)
    }

    /// Accounts the wallet already exposes to us. Never prompts.
    pub async fn authorized_accounts(&self) -> Result<Vec<Address>> {
        let wallet = self.wallet()?;
        let value = wallet
            .request("eth_accounts", json!([]))
            .await
            .map_err(unreachable_as_unavailable)?;
        parse_accounts(&value)
    }

    /// Asks the wallet for account access and binds a session to the first
    /// account it grants.
    pub async fn connect(&self) -> Result<Session<T>> {
        let wallet = self.wallet()?;
        let value = wallet
            .request("eth_requestAccounts", json!([]))
            .await
            .map_err(unreachable_as_unavailable)?;
        let accounts = parse_accounts(&value)?;
        let Some(address) = accounts.first().copied() else {
            return Err(SyncError::UserRejected(
                "wallet granted access to no accounts".to_string(),
            ));
        };
        let chain_id = request_chain_id(wallet).await?;
        info!(%address, chain_id, "wallet session established");
        let (closed, _) = watch::channel(false);
        Ok(Session {
            transport: wallet.clone(),
            address,
            chain_id,
            accounts,
            closed,
        })
    }

    /// Starts watching the wallet behind `session`. Events flow until the
    /// returned [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe(
        &self,
        session: &Session<T>,
    ) -> (Subscription, mpsc::UnboundedReceiver<WalletEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let watcher = watch_wallet(
            session.transport.clone(),
            self.watch_interval,
            session.accounts.clone(),
            session.chain_id,
            events_tx,
        );
        let handle = tokio::spawn(watcher);
        (
            Subscription {
                _watcher: AbortOnDrop::new(handle),
            },
            events_rx,
        )
    }
}

fn unreachable_as_unavailable(err: RpcError) -> SyncError {
    if err.is_transport() {
        warn!(%err, "wallet endpoint unreachable");
        SyncError::WalletUnavailable
    } else {
        SyncError::from(err)
    }
}

async fn request_chain_id<T: RpcTransport>(wallet: &T) -> Result<u64> {
    let value = wallet.request("eth_chainId", json!([])).await?;
    parse_quantity(&value)
}

async fn request_accounts<T: RpcTransport>(wallet: &T) -> Result<Vec<Address>> {
    let value = wallet.request("eth_accounts", json!([])).await?;
    parse_accounts(&value)
}

async fn watch_wallet<T: RpcTransport>(
    wallet: T,
    interval: Duration,
    mut accounts: Vec<Address>,
    mut chain_id: u64,
    events: mpsc::UnboundedSender<WalletEvent>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        match request_accounts(&wallet).await {
            Ok(current) if current != accounts => {
                debug!(?current, "wallet accounts changed");
                accounts = current.clone();
                if events.send(WalletEvent::AccountsChanged(current)).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "failed to poll wallet accounts"),
        }

        match request_chain_id(&wallet).await {
            Ok(current) if current != chain_id => {
                debug!(from = chain_id, to = current, "wallet network changed");
                chain_id = current;
                if events.send(WalletEvent::ChainChanged(current)).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "failed to poll wallet network"),
        }
    }
}

/// Standing subscription to wallet change notifications.
#[derive(Debug)]
pub struct Subscription {
    _watcher: AbortOnDrop,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

/// An authenticated binding to one wallet account on one network.
///
/// Dropping or closing the session signals every [`Signer`] derived from it,
/// which ends any confirmation wait still running on its behalf.
#[derive(Debug)]
pub struct Session<T> {
    transport: T,
    address: Address,
    chain_id: u64,
    accounts: Vec<Address>,
    closed: watch::Sender<bool>,
}

impl<T: RpcTransport> Session<T> {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_active(&self) -> bool {
        !*self.closed.borrow()
    }

    pub fn signer(&self) -> Signer<T> {
        Signer {
            transport: self.transport.clone(),
            address: self.address,
            closed: self.closed.subscribe(),
        }
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }
}

impl<T> Drop for Session<T> {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

/// Signing authority for one session: submissions go to the wallet, which
/// signs for `address`.
#[derive(Clone, Debug)]
pub struct Signer<T> {
    transport: T,
    address: Address,
    closed: watch::Receiver<bool>,
}

impl<T: RpcTransport> Signer<T> {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Resolves once the owning session is closed or dropped.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}
