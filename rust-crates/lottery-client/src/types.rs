use std::{
    fmt,
    str::FromStr,
};

/// One ether in wei.
pub const ETHER: u128 = 1_000_000_000_000_000_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidHex {
    pub input: String,
    pub expected_bytes: usize,
}

impl fmt::Display for InvalidHex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected 0x-prefixed hex of {} bytes, got {:?}",
            self.expected_bytes, self.input
        )
    }
}

impl std::error::Error for InvalidHex {}

fn parse_fixed<const N: usize>(raw: &str) -> Result<[u8; N], InvalidHex> {
    let invalid = || InvalidHex {
        input: raw.to_string(),
        expected_bytes: N,
    };
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    let mut out = [0u8; N];
    hex::decode_to_slice(digits, &mut out).map_err(|_| invalid())?;
    Ok(out)
}

/// A 20-byte account identifier. Comparison is on bytes, so two hex renderings
/// that differ only in letter case are the same address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// `0x1234...`, the form used in compact displays.
    pub fn short(&self) -> String {
        let full = self.to_string();
        format!("{}...", &full[..6])
    }
}

impl FromStr for Address {
    type Err = InvalidHex;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed::<20>(s.trim()).map(Address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TxHash([u8; 32]);

impl TxHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn short(&self) -> String {
        let full = self.to_string();
        format!("{}...{}", &full[..10], &full[full.len() - 6..])
    }
}

impl FromStr for TxHash {
    type Err = InvalidHex;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed::<32>(s.trim()).map(TxHash)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoundState {
    Open,
    Closed,
}

impl RoundState {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RoundState::Open),
            1 => Some(RoundState::Closed),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RoundState::Open => "OPEN",
            RoundState::Closed => "CLOSED",
        }
    }
}

/// The state-changing calls a user can ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LotteryAction {
    Enter,
    StartRound,
    EndRound,
}

impl LotteryAction {
    pub const ALL: [LotteryAction; 3] = [
        LotteryAction::Enter,
        LotteryAction::StartRound,
        LotteryAction::EndRound,
    ];

    /// Name of the contract function this action calls.
    pub fn function_name(self) -> &'static str {
        match self {
            LotteryAction::Enter => "enter",
            LotteryAction::StartRound => "startLottery",
            LotteryAction::EndRound => "endLottery",
        }
    }

    pub fn is_payable(self) -> bool {
        matches!(self, LotteryAction::Enter)
    }
}

impl fmt::Display for LotteryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.function_name())
    }
}

impl FromStr for LotteryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LotteryAction::ALL
            .into_iter()
            .find(|action| action.function_name() == s)
            .ok_or_else(|| format!("unknown lottery action {s:?}"))
    }
}

/// A write between dispatch and settlement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAction {
    pub action: LotteryAction,
    pub attached_value: Option<u128>,
}

impl PendingAction {
    /// `enter` always carries the fixed entry fee; the owner calls carry nothing.
    pub fn new(action: LotteryAction, entry_fee: u128) -> Self {
        let attached_value = action.is_payable().then_some(entry_fee);
        Self {
            action,
            attached_value,
        }
    }
}

/// A complete read of the contract, published as a unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractSnapshot {
    pub round_id: u64,
    pub player_count: u64,
    pub owner: Address,
    pub round_state: RoundState,
    pub last_winner: Address,
    pub caller_has_entered: bool,
    /// The account `caller_has_entered` was evaluated for.
    pub caller: Option<Address>,
}

impl ContractSnapshot {
    /// Entrant data only describes the account it was fetched for.
    pub fn entrant_data_for(&self, address: Address) -> Option<bool> {
        (self.caller == Some(address)).then_some(self.caller_has_entered)
    }
}

/// Renders a wei amount in ether without trailing zeros, e.g. `0.01`.
pub fn format_ether(wei: u128) -> String {
    let whole = wei / ETHER;
    let fractional = wei % ETHER;
    if fractional == 0 {
        format!("{whole}")
    } else {
        format!(
            "{whole}.{}",
            format!("{fractional:018}").trim_end_matches('0')
        )
    }
}
