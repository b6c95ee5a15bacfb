use crate::{
    orchestrator::TxPhase,
    types::{
        Address,
        ContractSnapshot,
        RoundState,
        format_ether,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimaryAction {
    ConnectToEnter,
    AlreadyEntered,
    Enter,
    RoundClosed,
}

impl PrimaryAction {
    pub fn label(self, entry_fee: u128) -> String {
        match self {
            PrimaryAction::ConnectToEnter => "Connect Wallet to Enter".to_string(),
            PrimaryAction::AlreadyEntered => "Ticket Purchased (Max 1 Per Round)".to_string(),
            PrimaryAction::Enter => format!("Enter Lottery ({} ETH)", format_ether(entry_fee)),
            PrimaryAction::RoundClosed => "Lottery is CLOSED".to_string(),
        }
    }
}

/// Everything the presentation layer needs to decide what to enable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedView {
    pub is_owner: bool,
    pub is_round_open: bool,
    pub is_round_closed: bool,
    pub entry_allowed: bool,
    pub primary_action: PrimaryAction,
    pub primary_action_label: String,
    pub can_start_round: bool,
    pub can_end_round: bool,
    pub can_toggle_connection: bool,
}

pub fn resolve(
    session: Option<Address>,
    snapshot: Option<&ContractSnapshot>,
    phase: &TxPhase,
    entry_fee: u128,
) -> DerivedView {
    let round_state = snapshot.map(|s| s.round_state);
    let is_round_open = round_state == Some(RoundState::Open);
    let is_round_closed = round_state == Some(RoundState::Closed);
    let is_owner = match (session, snapshot) {
        (Some(address), Some(snapshot)) => snapshot.owner == address,
        _ => false,
    };
    // None when the snapshot was fetched for a different account
    let has_entered = match (session, snapshot) {
        (Some(address), Some(snapshot)) => snapshot.entrant_data_for(address),
        _ => None,
    };
    // dispatch only succeeds from Idle, so Settled locks the controls too
    let idle = phase.is_idle();

    let primary_action = if session.is_none() {
        PrimaryAction::ConnectToEnter
    } else if has_entered == Some(true) {
        PrimaryAction::AlreadyEntered
    } else if is_round_open {
        PrimaryAction::Enter
    } else {
        PrimaryAction::RoundClosed
    };

    DerivedView {
        is_owner,
        is_round_open,
        is_round_closed,
        entry_allowed: session.is_some() && is_round_open && has_entered == Some(false) && idle,
        primary_action,
        primary_action_label: primary_action.label(entry_fee),
        can_start_round: is_owner && is_round_closed && idle,
        can_end_round: is_owner && is_round_open && idle,
        can_toggle_connection: idle,
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        orchestrator::Settlement,
        types::{
            LotteryAction,
            PendingAction,
            TxHash,
        },
    };
    use proptest::prelude::*;

    const FEE: u128 = 10_000_000_000_000_000;

    fn me() -> Address {
        Address::new([0xaa; 20])
    }

    fn snapshot(round_state: RoundState, has_entered: bool, owner: Address) -> ContractSnapshot {
        ContractSnapshot {
            round_id: 4,
            player_count: 2,
            owner,
            round_state,
            last_winner: Address::ZERO,
            caller_has_entered: has_entered,
            caller: Some(me()),
        }
    }

    #[test]
    fn resolve__open_round_not_entered_allows_entry() {
        // given
        let snapshot = snapshot(RoundState::Open, false, Address::ZERO);

        // when
        let view = resolve(Some(me()), Some(&snapshot), &TxPhase::Idle, FEE);

        // then
        assert!(view.entry_allowed);
        assert_eq!(view.primary_action, PrimaryAction::Enter);
        assert_eq!(view.primary_action_label, "Enter Lottery (0.01 ETH)");
        assert!(!view.is_owner);
    }

    #[test]
    fn resolve__already_entered_wins_over_open_round() {
        let snapshot = snapshot(RoundState::Open, true, Address::ZERO);

        let view = resolve(Some(me()), Some(&snapshot), &TxPhase::Idle, FEE);

        assert!(!view.entry_allowed);
        assert!(view.is_round_open);
        assert_eq!(view.primary_action, PrimaryAction::AlreadyEntered);
        assert_eq!(view.primary_action_label, "Ticket Purchased (Max 1 Per Round)");
    }

    #[test]
    fn resolve__no_session_asks_to_connect_and_is_never_owner() {
        let snapshot = snapshot(RoundState::Open, false, me());

        let view = resolve(None, Some(&snapshot), &TxPhase::Idle, FEE);

        assert!(!view.is_owner);
        assert!(!view.entry_allowed);
        assert_eq!(view.primary_action_label, "Connect Wallet to Enter");
    }

    #[test]
    fn resolve__no_snapshot_is_neither_open_nor_closed() {
        let view = resolve(Some(me()), None, &TxPhase::Idle, FEE);

        assert!(!view.is_round_open);
        assert!(!view.is_round_closed);
        assert!(!view.entry_allowed);
        assert_eq!(view.primary_action, PrimaryAction::RoundClosed);
    }

    #[test]
    fn resolve__entrant_data_for_another_account_is_not_trusted() {
        // given
        let snapshot = snapshot(RoundState::Open, false, Address::ZERO);
        let switched = Address::new([0xbb; 20]);

        // when
        let view = resolve(Some(switched), Some(&snapshot), &TxPhase::Idle, FEE);

        // then
        assert!(!view.entry_allowed);
        assert_eq!(view.primary_action, PrimaryAction::Enter);
    }

    #[test]
    fn resolve__owner_controls_follow_round_state_and_in_flight() {
        // given
        let closed = snapshot(RoundState::Closed, false, me());
        let open = snapshot(RoundState::Open, false, me());
        let in_flight = TxPhase::Dispatching(PendingAction::new(LotteryAction::StartRound, FEE));

        // when
        let idle_closed = resolve(Some(me()), Some(&closed), &TxPhase::Idle, FEE);
        let idle_open = resolve(Some(me()), Some(&open), &TxPhase::Idle, FEE);
        let busy_closed = resolve(Some(me()), Some(&closed), &in_flight, FEE);

        // then
        assert!(idle_closed.is_owner);
        assert!(idle_closed.can_start_round);
        assert!(!idle_closed.can_end_round);
        assert!(idle_open.can_end_round);
        assert!(!idle_open.can_start_round);
        assert!(!busy_closed.can_start_round);
        assert!(!busy_closed.can_toggle_connection);
    }

    #[test]
    fn resolve__owner_controls_stay_locked_until_settlement_is_resynced() {
        // given
        let open = snapshot(RoundState::Open, false, me());
        let settled = TxPhase::Settled(Settlement::Success {
            action: LotteryAction::StartRound,
            tx_hash: TxHash::new([3; 32]),
        });

        // when
        let view = resolve(Some(me()), Some(&open), &settled, FEE);

        // then
        assert!(!settled.is_in_flight());
        assert!(!view.can_end_round);
        assert!(!view.can_toggle_connection);
        assert!(!view.entry_allowed);
    }

    fn arb_phase() -> impl Strategy<Value = TxPhase> {
        prop_oneof![
            Just(TxPhase::Idle),
            Just(TxPhase::Dispatching(PendingAction::new(
                LotteryAction::Enter,
                FEE
            ))),
        ]
    }

    proptest! {
        #[test]
        fn resolve__entry_is_never_allowed_once_entered(
            connected in any::<bool>(),
            open in any::<bool>(),
            owner_is_me in any::<bool>(),
            phase in arb_phase(),
        ) {
            // given
            let state = if open { RoundState::Open } else { RoundState::Closed };
            let owner = if owner_is_me { me() } else { Address::ZERO };
            let snapshot = snapshot(state, true, owner);
            let session = connected.then(me);

            // when
            let view = resolve(session, Some(&snapshot), &phase, FEE);

            // then
            prop_assert!(!view.entry_allowed);
            prop_assert_eq!(view.is_owner, connected && owner_is_me);
            prop_assert_eq!(view.is_round_open, open);
            prop_assert_eq!(view.is_round_closed, !open);
            if connected {
                prop_assert_eq!(view.primary_action, PrimaryAction::AlreadyEntered);
            } else {
                prop_assert_eq!(view.primary_action, PrimaryAction::ConnectToEnter);
            }
        }

        #[test]
        fn resolve__is_owner_requires_a_session(
            owner_bytes in any::<[u8; 20]>(),
            has_entered in any::<bool>(),
        ) {
            let owner = Address::new(owner_bytes);
            let snapshot = snapshot(RoundState::Open, has_entered, owner);

            let view = resolve(None, Some(&snapshot), &TxPhase::Idle, FEE);

            prop_assert!(!view.is_owner);
            prop_assert!(!view.can_start_round);
            prop_assert!(!view.can_end_round);
        }
    }
}
