//! Codec for the fixed lottery contract surface.
//!
//! Only the handful of shapes the contract uses are supported: static 32-byte
//! words for `uint256`, `uint8`, `bool` and `address`, plus the standard
//! `Error(string)` / `Panic(uint256)` revert payloads.

use crate::{
    error::{
        Result,
        SyncError,
    },
    types::{
        Address,
        LotteryAction,
        RoundState,
    },
};
use sha3::{
    Digest,
    Keccak256,
};

pub type Selector = [u8; 4];
pub type Word = [u8; 32];

pub const CURRENT_ROUND: &str = "currentRound()";
pub const PLAYERS_COUNT: &str = "getPlayersCount()";
pub const OWNER: &str = "owner()";
pub const LOTTERY_STATE: &str = "lotteryState()";
pub const RECENT_WINNER: &str = "recentWinner()";
pub const HAS_ENTERED: &str = "hasEntered(address)";
pub const ENTER: &str = "enter()";
pub const START_LOTTERY: &str = "startLottery()";
pub const END_LOTTERY: &str = "endLottery()";

const ERROR_STRING: &str = "Error(string)";
const PANIC_UINT: &str = "Panic(uint256)";

pub fn selector(signature: &str) -> Selector {
    let digest = Keccak256::digest(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

pub fn action_signature(action: LotteryAction) -> &'static str {
    match action {
        LotteryAction::Enter => ENTER,
        LotteryAction::StartRound => START_LOTTERY,
        LotteryAction::EndRound => END_LOTTERY,
    }
}

pub fn encode_call(signature: &str, args: &[Word]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * args.len());
    data.extend_from_slice(&selector(signature));
    for arg in args {
        data.extend_from_slice(arg);
    }
    data
}

pub fn address_word(address: &Address) -> Word {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

pub fn u64_word(value: u64) -> Word {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

pub fn bool_word(value: bool) -> Word {
    u64_word(u64::from(value))
}

fn first_word(data: &[u8], what: &str) -> Result<Word> {
    if data.len() < 32 {
        return Err(SyncError::rpc(format!(
            "{what}: expected a 32-byte word, got {} bytes",
            data.len()
        )));
    }
    let mut word = [0u8; 32];
    word.copy_from_slice(&data[..32]);
    Ok(word)
}

pub fn decode_u64(data: &[u8]) -> Result<u64> {
    let word = first_word(data, "uint256")?;
    if word[..24].iter().any(|b| *b != 0) {
        return Err(SyncError::rpc("uint256 value does not fit in 64 bits"));
    }
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&word[24..]);
    Ok(u64::from_be_bytes(tail))
}

pub fn decode_address(data: &[u8]) -> Result<Address> {
    let word = first_word(data, "address")?;
    if word[..12].iter().any(|b| *b != 0) {
        return Err(SyncError::rpc("address word has non-zero padding"));
    }
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&word[12..]);
    Ok(Address::new(bytes))
}

pub fn decode_bool(data: &[u8]) -> Result<bool> {
    match decode_u64(data)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(SyncError::rpc(format!("invalid bool word {other}"))),
    }
}

pub fn decode_round_state(data: &[u8]) -> Result<RoundState> {
    let raw = decode_u64(data)?;
    u8::try_from(raw)
        .ok()
        .and_then(RoundState::from_raw)
        .ok_or_else(|| SyncError::rpc(format!("unknown lottery state {raw}")))
}

/// Extracts a human readable reason from revert data, if it is one of the
/// standard payloads.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    let (head, body) = data.split_at_checked(4)?;
    if head == selector(ERROR_STRING) {
        let offset = usize::try_from(decode_u64(body).ok()?).ok()?;
        let len_word = body.get(offset..)?;
        let len = usize::try_from(decode_u64(len_word).ok()?).ok()?;
        let start = offset.checked_add(32)?;
        let bytes = body.get(start..start.checked_add(len)?)?;
        return Some(String::from_utf8_lossy(bytes).into_owned());
    }
    if head == selector(PANIC_UINT) {
        let code = decode_u64(body).ok()?;
        return Some(format!("panic code {code:#04x}"));
    }
    None
}

#[cfg(any(test, feature = "test-helpers"))]
pub fn encode_revert_reason(reason: &str) -> Vec<u8> {
    let bytes = reason.as_bytes();
    let mut data = Vec::new();
    data.extend_from_slice(&selector(ERROR_STRING));
    data.extend_from_slice(&u64_word(32));
    data.extend_from_slice(&u64_word(bytes.len() as u64));
    data.extend_from_slice(bytes);
    let padding = (32 - bytes.len() % 32) % 32;
    data.extend(std::iter::repeat_n(0u8, padding));
    data
}
