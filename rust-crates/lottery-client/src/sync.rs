use crate::{
    error::Result,
    gateway::LotteryReader,
    types::{
        Address,
        ContractSnapshot,
    },
};
use std::sync::atomic::{
    AtomicU64,
    Ordering,
};
use tokio::sync::watch;
use tracing::{
    debug,
    warn,
};

/// What the synchronizer currently publishes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncState {
    /// The latest complete snapshot, if any refresh has ever succeeded.
    pub snapshot: Option<ContractSnapshot>,
    /// Generation of the refresh that produced `snapshot`.
    pub generation: u64,
    /// True while at least one refresh is outstanding.
    pub loading: bool,
    /// Reason the most recent refresh was discarded, cleared on success.
    pub last_error: Option<String>,
    outstanding: usize,
}

#[derive(Debug)]
pub struct StateSynchronizer {
    state: watch::Sender<SyncState>,
    issued: AtomicU64,
}

impl Default for StateSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSynchronizer {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SyncState::default());
        Self {
            state,
            issued: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn snapshot(&self) -> Option<ContractSnapshot> {
        self.state.borrow().snapshot.clone()
    }

    pub fn refreshes_issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    /// Reads all six fields concurrently and publishes them as one snapshot.
    ///
    /// A failed read discards the whole attempt and leaves the published
    /// snapshot untouched. A result that arrives after a newer refresh has
    /// already published is dropped as well.
    pub async fn refresh<R: LotteryReader>(
        &self,
        reader: &R,
        caller: Option<Address>,
    ) -> Result<ContractSnapshot> {
        let generation = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let _loading = Loading::enter(&self.state);

        match fetch_snapshot(reader, caller).await {
            Ok(snapshot) => {
                let published = self.state.send_if_modified(|state| {
                    if generation <= state.generation {
                        return false;
                    }
                    state.snapshot = Some(snapshot.clone());
                    state.generation = generation;
                    state.last_error = None;
                    true
                });
                if published {
                    debug!(
                        generation,
                        round_id = snapshot.round_id,
                        players = snapshot.player_count,
                        "snapshot published"
                    );
                } else {
                    debug!(generation, "newer snapshot already published, dropping result");
                }
                Ok(snapshot)
            }
            Err(err) => {
                warn!(%err, generation, "refresh failed, keeping previous snapshot");
                let reason = err.reason();
                self.state.send_modify(|state| state.last_error = Some(reason));
                Err(err)
            }
        }
    }
}

async fn fetch_snapshot<R: LotteryReader>(
    reader: &R,
    caller: Option<Address>,
) -> Result<ContractSnapshot> {
    let has_entered = async {
        match caller {
            Some(who) => reader.has_entered(who).await,
            None => Ok(false),
        }
    };
    let (round_id, player_count, owner, round_state, last_winner, caller_has_entered) =
        futures::try_join!(
            reader.current_round(),
            reader.players_count(),
            reader.owner(),
            reader.lottery_state(),
            reader.recent_winner(),
            has_entered,
        )?;
    Ok(ContractSnapshot {
        round_id,
        player_count,
        owner,
        round_state,
        last_winner,
        caller_has_entered,
        caller,
    })
}

/// Counts an outstanding refresh for as long as it lives.
struct Loading<'a> {
    state: &'a watch::Sender<SyncState>,
}

impl<'a> Loading<'a> {
    fn enter(state: &'a watch::Sender<SyncState>) -> Self {
        state.send_modify(|state| {
            state.outstanding += 1;
            state.loading = true;
        });
        Self { state }
    }
}

impl Drop for Loading<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|state| {
            state.outstanding = state.outstanding.saturating_sub(1);
            state.loading = state.outstanding > 0;
        });
    }
}
