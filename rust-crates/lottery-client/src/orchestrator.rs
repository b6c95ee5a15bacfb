//! Serializes user-submitted writes and tracks each through its lifecycle:
//! `Idle -> Dispatching -> AwaitingConfirmation -> Settled -> Idle`.

use crate::{
    config::DEFAULT_REQUEST_TIMEOUT,
    error::SyncError,
    gateway::LotteryWriter,
    types::{
        LotteryAction,
        PendingAction,
        TxHash,
    },
};
use std::{
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::watch,
    time,
};
use tracing::{
    error,
    info,
    warn,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TxPhase {
    #[default]
    Idle,
    Dispatching(PendingAction),
    AwaitingConfirmation {
        pending: PendingAction,
        tx_hash: TxHash,
    },
    Settled(Settlement),
}

impl TxPhase {
    pub fn is_idle(&self) -> bool {
        matches!(self, TxPhase::Idle)
    }

    /// True between dispatch and the terminal outcome.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TxPhase::Dispatching(_) | TxPhase::AwaitingConfirmation { .. }
        )
    }

    pub fn pending(&self) -> Option<&PendingAction> {
        match self {
            TxPhase::Dispatching(pending) | TxPhase::AwaitingConfirmation { pending, .. } => {
                Some(pending)
            }
            TxPhase::Idle | TxPhase::Settled(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    Success {
        action: LotteryAction,
        tx_hash: TxHash,
    },
    Failure {
        action: LotteryAction,
        tx_hash: Option<TxHash>,
        error: SyncError,
    },
}

impl Settlement {
    pub fn action(&self) -> LotteryAction {
        match self {
            Settlement::Success { action, .. } | Settlement::Failure { action, .. } => *action,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Settlement::Success { .. })
    }

    /// Line shown to the user once the write has settled.
    pub fn message(&self) -> String {
        match self {
            Settlement::Success { action, .. } => format!("{action} successful!"),
            Settlement::Failure { error, .. } => format!("Transaction failed: {}", error.reason()),
        }
    }
}

/// Why a dispatch was refused without any state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    WalletRequired,
    Busy,
    Reloading,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::WalletRequired => {
                f.write_str("Please connect your wallet to perform this action.")
            }
            Rejection::Busy => f.write_str("Another transaction is still pending."),
            Rejection::Reloading => f.write_str("Network changed, reloading."),
        }
    }
}

impl std::error::Error for Rejection {}

/// Callbacks a dispatch drives as it progresses.
pub trait DispatchHooks: Send + Sync {
    fn submitted(&self, _pending: &PendingAction, _tx_hash: TxHash) {}

    fn settled(&self, _settlement: &Settlement) {}

    /// Brings published contract state up to date. Awaited exactly once per
    /// dispatch, after settlement and before the orchestrator is idle again.
    fn resync(&self) -> impl Future<Output = ()> + Send;
}

#[derive(Clone, Debug)]
pub struct Orchestrator {
    phase: Arc<watch::Sender<TxPhase>>,
    entry_fee: u128,
    resync_timeout: Duration,
}

impl Orchestrator {
    pub fn new(entry_fee: u128) -> Self {
        let (phase, _) = watch::channel(TxPhase::Idle);
        Self {
            phase: Arc::new(phase),
            entry_fee,
            resync_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bounds how long a settled dispatch waits for the refresh before it
    /// gives the orchestrator back.
    pub fn with_resync_timeout(mut self, timeout: Duration) -> Self {
        self.resync_timeout = timeout;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<TxPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> TxPhase {
        self.phase.borrow().clone()
    }

    pub fn is_in_flight(&self) -> bool {
        self.phase.borrow().is_in_flight()
    }

    /// Claims the orchestrator for `action`.
    ///
    /// Checking for `Idle` and moving to `Dispatching` happen as one step, so
    /// two callers can never both succeed.
    pub fn begin<W: LotteryWriter>(
        &self,
        action: LotteryAction,
        writer: Option<W>,
    ) -> Result<Dispatch<W>, Rejection> {
        let writer = writer.ok_or(Rejection::WalletRequired)?;
        let pending = PendingAction::new(action, self.entry_fee);
        let claimed = self.phase.send_if_modified(|phase| {
            if !phase.is_idle() {
                return false;
            }
            *phase = TxPhase::Dispatching(pending.clone());
            true
        });
        if !claimed {
            return Err(Rejection::Busy);
        }
        Ok(Dispatch {
            phase: self.phase.clone(),
            pending,
            writer,
            resync_timeout: self.resync_timeout,
        })
    }
}

/// A claimed dispatch. Dropping it, run to completion or not, returns the
/// orchestrator to `Idle`.
#[must_use]
pub struct Dispatch<W> {
    phase: Arc<watch::Sender<TxPhase>>,
    pending: PendingAction,
    writer: W,
    resync_timeout: Duration,
}

impl<W: LotteryWriter> Dispatch<W> {
    pub fn pending(&self) -> &PendingAction {
        &self.pending
    }

    pub async fn run<H: DispatchHooks>(self, hooks: &H) -> Settlement {
        let action = self.pending.action;
        info!(%action, sender = %self.writer.sender(), "dispatching transaction");

        let settlement = match self.writer.submit(&self.pending).await {
            Err(error) => Settlement::Failure {
                action,
                tx_hash: None,
                error,
            },
            Ok(tx_hash) => {
                info!(%action, %tx_hash, "transaction sent");
                self.phase.send_replace(TxPhase::AwaitingConfirmation {
                    pending: self.pending.clone(),
                    tx_hash,
                });
                hooks.submitted(&self.pending, tx_hash);
                match self.writer.wait_for_confirmation(tx_hash).await {
                    Ok(receipt) => {
                        info!(%action, %tx_hash, block = ?receipt.block_number, "transaction confirmed");
                        Settlement::Success { action, tx_hash }
                    }
                    Err(error) => Settlement::Failure {
                        action,
                        tx_hash: Some(tx_hash),
                        error,
                    },
                }
            }
        };

        if let Settlement::Failure { error, tx_hash, .. } = &settlement {
            error!(%action, ?tx_hash, %error, "transaction failed");
        }
        self.phase
            .send_replace(TxPhase::Settled(settlement.clone()));
        hooks.settled(&settlement);
        if time::timeout(self.resync_timeout, hooks.resync())
            .await
            .is_err()
        {
            warn!(%action, timeout = ?self.resync_timeout, "refresh after settlement timed out");
        }
        settlement
    }
}

impl<W> Drop for Dispatch<W> {
    fn drop(&mut self) {
        self.phase.send_replace(TxPhase::Idle);
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        error::Result,
        gateway::Receipt,
        types::Address,
    };
    use std::sync::{
        Mutex,
        atomic::{
            AtomicUsize,
            Ordering,
        },
    };
    use tokio::sync::Notify;

    const FEE: u128 = 10_000_000_000_000_000;

    #[derive(Clone, Default)]
    struct FakeWriter {
        submitted: Arc<Mutex<Vec<PendingAction>>>,
        submit_error: Option<SyncError>,
        confirm_error: Option<SyncError>,
        confirm_gate: Option<Arc<Notify>>,
    }

    impl LotteryWriter for FakeWriter {
        fn sender(&self) -> Address {
            Address::new([1; 20])
        }

        async fn submit(&self, pending: &PendingAction) -> Result<TxHash> {
            if let Some(error) = &self.submit_error {
                return Err(error.clone());
            }
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(pending.clone());
            Ok(TxHash::new([submitted.len() as u8; 32]))
        }

        async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<Receipt> {
            if let Some(gate) = &self.confirm_gate {
                gate.notified().await;
            }
            match &self.confirm_error {
                Some(error) => Err(error.clone()),
                None => Ok(Receipt {
                    tx_hash,
                    block_number: Some(1),
                }),
            }
        }
    }

    /// Counts resyncs and records the phase each one observed.
    #[derive(Default)]
    struct CountingHooks {
        resyncs: AtomicUsize,
        phases_seen: Mutex<Vec<TxPhase>>,
        orchestrator: Option<Orchestrator>,
        stall_resync: bool,
    }

    impl DispatchHooks for CountingHooks {
        async fn resync(&self) {
            self.resyncs.fetch_add(1, Ordering::SeqCst);
            if let Some(orchestrator) = &self.orchestrator {
                self.phases_seen.lock().unwrap().push(orchestrator.phase());
            }
            if self.stall_resync {
                std::future::pending::<()>().await;
            }
        }
    }

    #[test]
    fn begin__without_writer_is_rejected_and_stays_idle() {
        // given
        let orchestrator = Orchestrator::new(FEE);

        // when
        let result = orchestrator.begin::<FakeWriter>(LotteryAction::Enter, None);

        // then
        assert_eq!(result.err(), Some(Rejection::WalletRequired));
        assert_eq!(orchestrator.phase(), TxPhase::Idle);
    }

    #[test]
    fn begin__second_dispatch_while_in_flight_is_a_no_op() {
        // given
        let orchestrator = Orchestrator::new(FEE);
        let writer = FakeWriter::default();
        let first = orchestrator
            .begin(LotteryAction::Enter, Some(writer.clone()))
            .unwrap();

        // when
        let second = orchestrator.begin(LotteryAction::StartRound, Some(writer.clone()));

        // then
        assert_eq!(second.err(), Some(Rejection::Busy));
        assert_eq!(
            orchestrator.phase(),
            TxPhase::Dispatching(PendingAction::new(LotteryAction::Enter, FEE))
        );
        assert_eq!(first.pending().attached_value, Some(FEE));
        assert!(writer.submitted.lock().unwrap().is_empty());
    }

    #[test]
    fn dropping_dispatch__returns_to_idle() {
        let orchestrator = Orchestrator::new(FEE);
        let dispatch = orchestrator
            .begin(LotteryAction::EndRound, Some(FakeWriter::default()))
            .unwrap();
        assert!(orchestrator.is_in_flight());

        drop(dispatch);

        assert_eq!(orchestrator.phase(), TxPhase::Idle);
    }

    #[tokio::test]
    async fn run__success_resyncs_once_then_idles() {
        // given
        let orchestrator = Orchestrator::new(FEE);
        let writer = FakeWriter::default();
        let hooks = CountingHooks {
            orchestrator: Some(orchestrator.clone()),
            ..Default::default()
        };
        let dispatch = orchestrator
            .begin(LotteryAction::Enter, Some(writer.clone()))
            .unwrap();

        // when
        let settlement = dispatch.run(&hooks).await;

        // then
        assert!(settlement.is_success());
        assert_eq!(settlement.message(), "enter successful!");
        assert_eq!(hooks.resyncs.load(Ordering::SeqCst), 1);
        assert!(matches!(
            hooks.phases_seen.lock().unwrap()[0],
            TxPhase::Settled(Settlement::Success { .. })
        ));
        assert_eq!(orchestrator.phase(), TxPhase::Idle);
        assert_eq!(
            *writer.submitted.lock().unwrap(),
            vec![PendingAction::new(LotteryAction::Enter, FEE)]
        );
    }

    #[tokio::test]
    async fn run__rejected_signature_settles_as_failure_and_still_resyncs() {
        // given
        let orchestrator = Orchestrator::new(FEE);
        let writer = FakeWriter {
            submit_error: Some(SyncError::UserRejected(
                "User denied transaction signature".into(),
            )),
            ..Default::default()
        };
        let hooks = CountingHooks::default();

        // when
        let settlement = orchestrator
            .begin(LotteryAction::StartRound, Some(writer))
            .unwrap()
            .run(&hooks)
            .await;

        // then
        assert_eq!(
            settlement,
            Settlement::Failure {
                action: LotteryAction::StartRound,
                tx_hash: None,
                error: SyncError::UserRejected("User denied transaction signature".into()),
            }
        );
        assert_eq!(
            settlement.message(),
            "Transaction failed: User denied transaction signature"
        );
        assert_eq!(hooks.resyncs.load(Ordering::SeqCst), 1);
        assert!(orchestrator.phase().is_idle());
    }

    #[tokio::test]
    async fn run__revert_during_confirmation_keeps_tx_hash() {
        let orchestrator = Orchestrator::new(FEE);
        let writer = FakeWriter {
            confirm_error: Some(SyncError::TransactionReverted {
                reason: "execution reverted".into(),
                tx_hash: None,
            }),
            ..Default::default()
        };
        let hooks = CountingHooks::default();

        let settlement = orchestrator
            .begin(LotteryAction::EndRound, Some(writer))
            .unwrap()
            .run(&hooks)
            .await;

        assert!(matches!(
            settlement,
            Settlement::Failure {
                tx_hash: Some(_),
                ..
            }
        ));
        assert_eq!(hooks.resyncs.load(Ordering::SeqCst), 1);
        assert!(orchestrator.phase().is_idle());
    }

    #[tokio::test]
    async fn run__records_tx_hash_while_awaiting_confirmation() {
        // given
        let orchestrator = Orchestrator::new(FEE);
        let gate = Arc::new(Notify::new());
        let writer = FakeWriter {
            confirm_gate: Some(gate.clone()),
            ..Default::default()
        };
        let mut phases = orchestrator.subscribe();
        let dispatch = orchestrator
            .begin(LotteryAction::Enter, Some(writer))
            .unwrap();
        let hooks = CountingHooks::default();

        // when
        let run = tokio::spawn(async move { dispatch.run(&hooks).await });
        phases
            .wait_for(|phase| matches!(phase, TxPhase::AwaitingConfirmation { .. }))
            .await
            .unwrap();
        let awaiting = orchestrator.phase();
        assert!(orchestrator.begin(LotteryAction::Enter, Some(FakeWriter::default())).is_err());
        gate.notify_one();
        let settlement = run.await.unwrap();

        // then
        assert_eq!(
            awaiting,
            TxPhase::AwaitingConfirmation {
                pending: PendingAction::new(LotteryAction::Enter, FEE),
                tx_hash: TxHash::new([1; 32]),
            }
        );
        assert!(awaiting.is_in_flight());
        assert!(settlement.is_success());
        assert!(orchestrator.phase().is_idle());
    }

    #[tokio::test]
    async fn run__stalled_resync_still_returns_to_idle() {
        // given
        let orchestrator =
            Orchestrator::new(FEE).with_resync_timeout(Duration::from_millis(50));
        let hooks = CountingHooks {
            stall_resync: true,
            ..Default::default()
        };
        let dispatch = orchestrator
            .begin(LotteryAction::StartRound, Some(FakeWriter::default()))
            .unwrap();

        // when
        let settlement = time::timeout(Duration::from_secs(5), dispatch.run(&hooks))
            .await
            .unwrap();

        // then
        assert!(settlement.is_success());
        assert_eq!(hooks.resyncs.load(Ordering::SeqCst), 1);
        assert!(orchestrator.phase().is_idle());
        assert!(
            orchestrator
                .begin(LotteryAction::EndRound, Some(FakeWriter::default()))
                .is_ok()
        );
    }
}
