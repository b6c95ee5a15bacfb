//! The engine ties the wallet session, contract handles, synchronizer and
//! orchestrator together and is the only thing the presentation layer holds.

use crate::{
    config::EngineConfig,
    derived::{
        self,
        DerivedView,
    },
    error::{
        Result,
        SyncError,
    },
    gateway::{
        ContractGateway,
        ReadHandle,
    },
    orchestrator::{
        DispatchHooks,
        Orchestrator,
        Rejection,
        Settlement,
        TxPhase,
    },
    rpc::RpcTransport,
    session::{
        Session,
        Subscription,
        WalletConnector,
        WalletEvent,
    },
    sync::{
        StateSynchronizer,
        SyncState,
    },
    task::AbortOnDrop,
    types::{
        Address,
        ContractSnapshot,
        LotteryAction,
        PendingAction,
        TxHash,
    },
};
use std::{
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc,
        watch,
    },
    task::JoinHandle,
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

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// One-line message for the user about the latest intent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStatus {
    pub address: Option<Address>,
    pub chain_id: Option<u64>,
    pub wallet_available: bool,
    pub notice: Option<Notice>,
    /// Set once the wallet switched networks. The host must discard this
    /// engine and build a new one.
    pub reload_requested: bool,
}

/// Everything the presentation layer renders, composed on demand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineView {
    pub contract: Address,
    pub entry_fee: u128,
    pub status: EngineStatus,
    pub snapshot: Option<ContractSnapshot>,
    pub loading: bool,
    pub phase: TxPhase,
    pub in_flight: bool,
    pub derived: DerivedView,
}

/// Resolves whenever anything in the engine's view may have changed.
pub struct EngineWatcher {
    status: watch::Receiver<EngineStatus>,
    sync: watch::Receiver<SyncState>,
    phase: watch::Receiver<TxPhase>,
}

impl EngineWatcher {
    /// Returns `false` once the engine is gone.
    pub async fn changed(&mut self) -> bool {
        tokio::select! {
            res = self.status.changed() => res.is_ok(),
            res = self.sync.changed() => res.is_ok(),
            res = self.phase.changed() => res.is_ok(),
        }
    }
}

/// The current session and everything bound to it. Replaced as a whole.
struct Link<T> {
    session: Option<Session<T>>,
    gateway: ContractGateway<T>,
    _subscription: Option<Subscription>,
    _poller: Option<AbortOnDrop>,
}

impl<T: RpcTransport> Link<T> {
    fn detached(config: &EngineConfig, fallback: &T) -> Self {
        Self {
            session: None,
            gateway: ContractGateway::bind(config, fallback, None),
            _subscription: None,
            _poller: None,
        }
    }
}

struct Inner<T> {
    config: EngineConfig,
    connector: WalletConnector<T>,
    fallback: T,
    link: Mutex<Link<T>>,
    sync: StateSynchronizer,
    orchestrator: Orchestrator,
    status: watch::Sender<EngineStatus>,
    reloading: AtomicBool,
}

pub struct Engine<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: RpcTransport> Engine<T> {
    /// `wallet` is the endpoint holding the user's keys, if any; `fallback`
    /// serves reads while no session exists.
    pub fn new(config: EngineConfig, wallet: Option<T>, fallback: T) -> Self {
        let connector = WalletConnector::new(wallet, config.wallet_watch_interval);
        let (status, _) = watch::channel(EngineStatus {
            wallet_available: connector.is_available(),
            ..EngineStatus::default()
        });
        let link = Link::detached(&config, &fallback);
        let orchestrator =
            Orchestrator::new(config.entry_fee).with_resync_timeout(config.request_timeout);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                fallback,
                link: Mutex::new(link),
                sync: StateSynchronizer::new(),
                orchestrator,
                status,
                reloading: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Reconnects without prompting if the wallet already authorized an
    /// account, otherwise reads the contract once through the fallback
    /// endpoint so there is something to show.
    pub async fn start(&self) {
        match self.inner.connector.authorized_accounts().await {
            Ok(accounts) if !accounts.is_empty() => {
                info!(account = %accounts[0], "wallet already authorized, reconnecting");
                if let Err(err) = self.connect().await {
                    warn!(%err, "silent reconnect failed");
                }
            }
            Ok(_) => debug!("no previously authorized wallet account"),
            Err(SyncError::WalletUnavailable) => info!("no wallet provider available"),
            Err(err) => warn!(%err, "failed to query authorized wallet accounts"),
        }
        if self.address().is_none() {
            self.refresh().await;
        }
    }

    pub async fn request_connect(&self) -> Result<Address> {
        self.notify(Notice::info("Connecting wallet..."));
        match self.connect().await {
            Ok(address) => {
                self.notify(Notice::success(format!("Connected {}", address.short())));
                Ok(address)
            }
            Err(err) if self.is_reloading() => Err(err),
            Err(err) => {
                let message = match &err {
                    SyncError::WalletUnavailable => {
                        "No wallet provider available. Please configure a wallet.".to_string()
                    }
                    err => format!("Connection failed: {}", err.reason()),
                };
                self.notify(Notice::error(message));
                Err(err)
            }
        }
    }

    /// Ends the session. Safe to call with no session.
    pub fn request_disconnect(&self) {
        if self.teardown() {
            info!("wallet disconnected");
            self.inner.status.send_modify(|status| {
                status.address = None;
                status.chain_id = None;
                status.notice = Some(Notice::info("Wallet disconnected"));
            });
        }
    }

    /// Dispatches `action` in the background. The returned handle resolves
    /// with the settlement once contract state has been refreshed.
    pub fn request_action(
        &self,
        action: LotteryAction,
    ) -> std::result::Result<JoinHandle<Settlement>, Rejection> {
        let result = if self.is_reloading() {
            Err(Rejection::Reloading)
        } else {
            let writer = self.lock_link().gateway.write_handle();
            self.inner.orchestrator.begin(action, writer)
        };
        match result {
            Ok(dispatch) => {
                let engine = self.clone();
                Ok(tokio::spawn(async move { dispatch.run(&engine).await }))
            }
            Err(rejection) => {
                debug!(%action, ?rejection, "dispatch rejected");
                self.notify(Notice::error(rejection.to_string()));
                Err(rejection)
            }
        }
    }

    /// Re-reads the contract through the current read handle.
    pub async fn refresh(&self) {
        if self.is_reloading() {
            debug!("reload pending, skipping refresh");
            return;
        }
        let (reader, caller) = {
            let link = self.lock_link();
            (
                link.gateway.read_handle(),
                link.session.as_ref().map(Session::address),
            )
        };
        // failures are logged and the previous snapshot stays published
        let _ = self.inner.sync.refresh(&reader, caller).await;
    }

    pub fn address(&self) -> Option<Address> {
        self.inner.status.borrow().address
    }

    pub fn read_handle(&self) -> ReadHandle<T> {
        self.lock_link().gateway.read_handle()
    }

    pub fn has_write_handle(&self) -> bool {
        self.lock_link().gateway.write_handle().is_some()
    }

    pub fn is_reloading(&self) -> bool {
        self.inner.reloading.load(Ordering::SeqCst)
    }

    pub fn refreshes_issued(&self) -> u64 {
        self.inner.sync.refreshes_issued()
    }

    pub fn view(&self) -> EngineView {
        let status = self.inner.status.borrow().clone();
        let sync = self.inner.sync.state();
        let phase = self.inner.orchestrator.phase();
        let derived = derived::resolve(
            status.address,
            sync.snapshot.as_ref(),
            &phase,
            self.inner.config.entry_fee,
        );
        EngineView {
            contract: self.inner.config.contract,
            entry_fee: self.inner.config.entry_fee,
            in_flight: phase.is_in_flight(),
            status,
            snapshot: sync.snapshot,
            loading: sync.loading,
            phase,
            derived,
        }
    }

    pub fn watch(&self) -> EngineWatcher {
        EngineWatcher {
            status: self.inner.status.subscribe(),
            sync: self.inner.sync.subscribe(),
            phase: self.inner.orchestrator.subscribe(),
        }
    }

    /// Resolves once the wallet has switched networks.
    pub async fn reload_requested(&self) {
        let mut status = self.inner.status.subscribe();
        let _ = status.wait_for(|status| status.reload_requested).await;
    }

    /// Stops every background task bound to the session.
    pub fn shutdown(&self) {
        self.teardown();
    }

    async fn connect(&self) -> Result<Address> {
        // a failed attempt leaves the current session in place
        let session = self.inner.connector.connect().await?;
        if self.is_reloading() {
            return Err(SyncError::SessionClosed);
        }
        let address = session.address();
        let chain_id = session.chain_id();
        let previous_chain = self.inner.status.borrow().chain_id;
        if previous_chain.is_some_and(|previous| previous != chain_id) {
            // the wallet moved networks while the session was being replaced
            drop(session);
            self.request_reload(chain_id);
            return Err(SyncError::SessionClosed);
        }
        self.install(session);
        self.inner.status.send_modify(|status| {
            status.address = Some(address);
            status.chain_id = Some(chain_id);
        });
        Ok(address)
    }

    fn install(&self, session: Session<T>) {
        let (subscription, events) = self.inner.connector.subscribe(&session);
        let gateway =
            ContractGateway::bind(&self.inner.config, &self.inner.fallback, Some(&session));
        let weak = Arc::downgrade(&self.inner);
        let poller = tokio::spawn(poll_snapshots(
            weak.clone(),
            self.inner.config.refresh_interval,
        ));
        tokio::spawn(pump_wallet_events(weak, events));

        let replaced = std::mem::replace(
            &mut *self.lock_link(),
            Link {
                session: Some(session),
                gateway,
                _subscription: Some(subscription),
                _poller: Some(AbortOnDrop::new(poller)),
            },
        );
        // closes the previous session and stops its tasks
        drop(replaced);
    }

    /// Drops the current link. Returns whether a session was active.
    fn teardown(&self) -> bool {
        let detached = Link::detached(&self.inner.config, &self.inner.fallback);
        let replaced = std::mem::replace(&mut *self.lock_link(), detached);
        let had_session = replaced.session.is_some();
        drop(replaced);
        had_session
    }

    fn request_reload(&self, chain_id: u64) {
        if self.inner.reloading.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(chain_id, "wallet switched network, reloading");
        self.teardown();
        self.inner.status.send_modify(|status| {
            status.address = None;
            status.chain_id = None;
            status.reload_requested = true;
            status.notice = Some(Notice::info("Network changed, reloading..."));
        });
    }

    async fn handle_wallet_event(&self, event: WalletEvent) {
        match event {
            WalletEvent::AccountsChanged(accounts) => match accounts.first() {
                None => {
                    info!("wallet exposes no accounts anymore");
                    self.request_disconnect();
                }
                Some(&account) => {
                    let Some(current) = self.address() else {
                        return;
                    };
                    if current == account {
                        return;
                    }
                    info!(from = %current, to = %account, "wallet account switched");
                    if let Err(err) = self.connect().await {
                        warn!(%err, "reconnect after account switch failed");
                        self.request_disconnect();
                    }
                }
            },
            WalletEvent::ChainChanged(chain_id) => self.request_reload(chain_id),
        }
    }

    fn notify(&self, notice: Notice) {
        self.inner
            .status
            .send_modify(|status| status.notice = Some(notice));
    }

    fn lock_link(&self) -> MutexGuard<'_, Link<T>> {
        self.inner
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: RpcTransport> DispatchHooks for Engine<T> {
    fn submitted(&self, pending: &PendingAction, tx_hash: TxHash) {
        debug!(action = %pending.action, %tx_hash, "awaiting confirmation");
        self.notify(Notice::info(format!(
            "Transaction sent! Hash: {}",
            tx_hash.short()
        )));
    }

    fn settled(&self, settlement: &Settlement) {
        let notice = if settlement.is_success() {
            Notice::success(settlement.message())
        } else {
            Notice::error(settlement.message())
        };
        self.notify(notice);
    }

    async fn resync(&self) {
        self.refresh().await;
    }
}

/// Refreshes right away, then on every tick, for as long as the session's
/// link holds this task.
async fn poll_snapshots<T: RpcTransport>(inner: Weak<Inner<T>>, period: Duration) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        Engine { inner }.refresh().await;
    }
}

async fn pump_wallet_events<T: RpcTransport>(
    inner: Weak<Inner<T>>,
    mut events: mpsc::UnboundedReceiver<WalletEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        Engine { inner }.handle_wallet_event(event).await;
    }
}
