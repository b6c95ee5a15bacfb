//! In-memory wallet and lottery contract for tests.

use crate::{
    abi,
    config::EngineConfig,
    engine::{
        Engine,
        EngineView,
    },
    rpc::{
        EXECUTION_REVERTED_CODE,
        RpcError,
        RpcTransport,
        USER_REJECTED_CODE,
        decode_hex,
        encode_hex,
        quantity,
    },
    types::{
        Address,
        RoundState,
        TxHash,
    },
};
use serde_json::{
    Value,
    json,
};
use sha3::{
    Digest,
    Keccak256,
};
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
    time::Duration,
};

pub const SEPOLIA_CHAIN_ID: u64 = 11_155_111;

/// Config with short intervals so timer driven behavior shows up quickly.
pub fn test_config() -> EngineConfig {
    EngineConfig::new(FakeChain::CONTRACT, FakeChain::ENTRY_FEE)
        .with_refresh_interval(Duration::from_millis(20))
        .with_wallet_watch_interval(Duration::from_millis(5))
        .with_receipt_poll_interval(Duration::from_millis(5))
        .with_confirmation_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_millis(200))
}

/// Waits until `predicate` holds for the engine's view and returns that view.
pub async fn wait_until<T: RpcTransport>(
    engine: &Engine<T>,
    mut predicate: impl FnMut(&EngineView) -> bool,
) -> EngineView {
    let mut watcher = engine.watch();
    let wait = async {
        loop {
            let view = engine.view();
            if predicate(&view) {
                return view;
            }
            if !watcher.changed().await {
                panic!("engine dropped while waiting");
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("engine never reached the expected state")
}

#[derive(Debug)]
struct PendingTx {
    from: Address,
    selector: abi::Selector,
    value: u128,
}

#[derive(Debug)]
struct ChainState {
    chain_id: u64,
    wallet_accounts: Vec<Address>,
    authorized: bool,
    reject_access: bool,
    reject_signatures: bool,
    wallet_unreachable: bool,
    failing_read: Option<abi::Selector>,
    stalled_reads: bool,
    failing_receipt_polls: usize,
    chain_on_next_access: Option<u64>,
    auto_mine: bool,
    revert_on_mine: bool,

    owner: Address,
    round: u64,
    state: RoundState,
    players: Vec<Address>,
    entered: HashSet<(u64, Address)>,
    winner: Address,

    nonce: u64,
    mempool: Vec<(TxHash, PendingTx)>,
    receipts: HashMap<TxHash, bool>,
    block: u64,
    calls: HashMap<&'static str, usize>,
}

/// Wallet plus lottery contract in one process. Clones share state, so the
/// same chain can serve as wallet endpoint and fallback reader.
#[derive(Clone, Debug)]
pub struct FakeChain {
    state: Arc<Mutex<ChainState>>,
}

impl FakeChain {
    pub const CONTRACT: Address = Address::new([0xc0; 20]);
    pub const ENTRY_FEE: u128 = 10_000_000_000_000_000;

    /// A closed lottery at round 0 owned by `owner`, with an empty wallet.
    pub fn new(owner: Address) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState {
                chain_id: SEPOLIA_CHAIN_ID,
                wallet_accounts: Vec::new(),
                authorized: false,
                reject_access: false,
                reject_signatures: false,
                wallet_unreachable: false,
                failing_read: None,
                stalled_reads: false,
                failing_receipt_polls: 0,
                chain_on_next_access: None,
                auto_mine: true,
                revert_on_mine: false,
                owner,
                round: 0,
                state: RoundState::Closed,
                players: Vec::new(),
                entered: HashSet::new(),
                winner: Address::ZERO,
                nonce: 0,
                mempool: Vec::new(),
                receipts: HashMap::new(),
                block: 0,
                calls: HashMap::new(),
            })),
        }
    }

    pub fn with_accounts(self, accounts: Vec<Address>) -> Self {
        self.lock().wallet_accounts = accounts;
        self
    }

    /// Wallet accounts that were already granted in an earlier run.
    pub fn authorized(self) -> Self {
        self.lock().authorized = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    pub fn chain_id(&self) -> u64 {
        self.lock().chain_id
    }

    pub fn set_accounts(&self, accounts: Vec<Address>) {
        self.lock().wallet_accounts = accounts;
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.lock().chain_id = chain_id;
    }

    pub fn set_reject_access(&self, reject: bool) {
        self.lock().reject_access = reject;
    }

    pub fn set_reject_signatures(&self, reject: bool) {
        self.lock().reject_signatures = reject;
    }

    pub fn set_wallet_unreachable(&self, unreachable: bool) {
        self.lock().wallet_unreachable = unreachable;
    }

    /// Makes every `eth_call` to `signature` fail with a node error.
    pub fn fail_reads_of(&self, signature: Option<&str>) {
        self.lock().failing_read = signature.map(abi::selector);
    }

    /// Leaves every `eth_call` unanswered, like a node that stopped responding.
    pub fn set_stalled_reads(&self, stalled: bool) {
        self.lock().stalled_reads = stalled;
    }

    /// The next `count` receipt lookups fail as dropped requests.
    pub fn fail_next_receipt_polls(&self, count: usize) {
        self.lock().failing_receipt_polls = count;
    }

    /// The wallet switches to `chain_id` while answering the next access request.
    pub fn switch_chain_on_next_access(&self, chain_id: u64) {
        self.lock().chain_on_next_access = Some(chain_id);
    }

    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.lock().auto_mine = auto_mine;
    }

    /// Mined transactions get a failed receipt instead of taking effect.
    pub fn set_revert_on_mine(&self, revert: bool) {
        self.lock().revert_on_mine = revert;
    }

    pub fn open_round(&self) {
        let mut state = self.lock();
        state.round += 1;
        state.state = RoundState::Open;
        state.players.clear();
    }

    pub fn add_entrant(&self, who: Address) {
        let mut state = self.lock();
        let round = state.round;
        state.players.push(who);
        state.entered.insert((round, who));
    }

    pub fn has_entered(&self, who: Address) -> bool {
        let state = self.lock();
        state.entered.contains(&(state.round, who))
    }

    pub fn round_state(&self) -> RoundState {
        self.lock().state
    }

    pub fn pending_transactions(&self) -> usize {
        self.lock().mempool.len()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    /// Mines everything in the mempool.
    pub fn mine(&self) {
        let mut state = self.lock();
        let mempool = std::mem::take(&mut state.mempool);
        for (tx_hash, tx) in mempool {
            mine_one(&mut state, tx_hash, tx);
        }
    }

    fn respond(&self, method: &'static str, params: Value) -> Result<Value, RpcError> {
        let mut state = self.lock();
        *state.calls.entry(method).or_default() += 1;
        let wallet_method = matches!(
            method,
            "eth_accounts" | "eth_requestAccounts" | "eth_sendTransaction"
        );
        if wallet_method && state.wallet_unreachable {
            return Err(RpcError::Transport("connection refused".to_string()));
        }
        match method {
            "eth_chainId" => Ok(json!(quantity(u128::from(state.chain_id)))),
            "eth_accounts" => {
                let accounts = if state.authorized {
                    state.wallet_accounts.clone()
                } else {
                    Vec::new()
                };
                Ok(accounts_json(&accounts))
            }
            "eth_requestAccounts" => {
                if state.reject_access {
                    return Err(response_error(
                        USER_REJECTED_CODE,
                        "User rejected the request.",
                    ));
                }
                state.authorized = true;
                if let Some(chain_id) = state.chain_on_next_access.take() {
                    state.chain_id = chain_id;
                }
                Ok(accounts_json(&state.wallet_accounts))
            }
            "eth_call" => {
                let data = call_data(&params)?;
                let selector = selector_of(&data)?;
                if state.failing_read == Some(selector) {
                    return Err(response_error(-32603, "header not found"));
                }
                read(&state, selector, &data).map(|word| json!(encode_hex(&word)))
            }
            "eth_sendTransaction" => send_transaction(&mut state, &params),
            "eth_getTransactionReceipt" => {
                if state.failing_receipt_polls > 0 {
                    state.failing_receipt_polls -= 1;
                    return Err(RpcError::Transport("connection reset".to_string()));
                }
                let raw = params
                    .get(0)
                    .and_then(Value::as_str)
                    .ok_or_else(|| response_error(-32602, "missing transaction hash"))?;
                let tx_hash: TxHash = raw
                    .parse()
                    .map_err(|_| response_error(-32602, "invalid transaction hash"))?;
                Ok(match state.receipts.get(&tx_hash) {
                    None => Value::Null,
                    Some(success) => {
                        let status = if *success { "0x1" } else { "0x0" };
                        json!({
                            "transactionHash": raw,
                            "blockNumber": quantity(u128::from(state.block)),
                            "status": status,
                        })
                    }
                })
            }
            other => Err(response_error(-32601, &format!("method {other} not found"))),
        }
    }
}

impl RpcTransport for FakeChain {
    async fn request(&self, method: &'static str, params: Value) -> Result<Value, RpcError> {
        let stalled = method == "eth_call" && self.lock().stalled_reads;
        if stalled {
            std::future::pending::<()>().await;
        }
        self.respond(method, params)
    }
}

fn response_error(code: i64, message: &str) -> RpcError {
    RpcError::Response {
        code,
        message: message.to_string(),
        data: None,
    }
}

fn revert(reason: &str) -> RpcError {
    RpcError::Response {
        code: EXECUTION_REVERTED_CODE,
        message: "execution reverted".to_string(),
        data: Some(json!(encode_hex(&abi::encode_revert_reason(reason)))),
    }
}

fn accounts_json(accounts: &[Address]) -> Value {
    Value::Array(accounts.iter().map(|a| json!(a.to_string())).collect())
}

fn call_data(params: &Value) -> Result<Vec<u8>, RpcError> {
    let raw = params
        .get(0)
        .and_then(|call| call.get("data"))
        .and_then(Value::as_str)
        .ok_or_else(|| response_error(-32602, "missing call data"))?;
    decode_hex(raw).map_err(|e| response_error(-32602, &e.reason()))
}

fn selector_of(data: &[u8]) -> Result<abi::Selector, RpcError> {
    data.get(..4)
        .and_then(|head| head.try_into().ok())
        .ok_or_else(|| response_error(-32602, "call data shorter than a selector"))
}

fn read(state: &ChainState, selector: abi::Selector, data: &[u8]) -> Result<abi::Word, RpcError> {
    let word = if selector == abi::selector(abi::CURRENT_ROUND) {
        abi::u64_word(state.round)
    } else if selector == abi::selector(abi::PLAYERS_COUNT) {
        abi::u64_word(state.players.len() as u64)
    } else if selector == abi::selector(abi::OWNER) {
        abi::address_word(&state.owner)
    } else if selector == abi::selector(abi::LOTTERY_STATE) {
        abi::u64_word(match state.state {
            RoundState::Open => 0,
            RoundState::Closed => 1,
        })
    } else if selector == abi::selector(abi::RECENT_WINNER) {
        abi::address_word(&state.winner)
    } else if selector == abi::selector(abi::HAS_ENTERED) {
        let who = abi::decode_address(&data[4..]).map_err(|e| response_error(-32602, &e.reason()))?;
        abi::bool_word(state.entered.contains(&(state.round, who)))
    } else {
        return Err(revert("unknown function"));
    };
    Ok(word)
}

fn send_transaction(state: &mut ChainState, params: &Value) -> Result<Value, RpcError> {
    let tx = params
        .get(0)
        .ok_or_else(|| response_error(-32602, "missing transaction"))?;
    let from: Address = tx
        .get("from")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| response_error(-32602, "missing sender"))?;
    if !state.authorized || !state.wallet_accounts.contains(&from) {
        return Err(response_error(4100, "The requested account has not been authorized."));
    }
    let value = match tx.get("value").and_then(Value::as_str) {
        Some(raw) => u128::from_str_radix(raw.trim_start_matches("0x"), 16)
            .map_err(|_| response_error(-32602, "invalid value"))?,
        None => 0,
    };
    let data = call_data(params)?;
    let selector = selector_of(&data)?;
    let pending = PendingTx {
        from,
        selector,
        value,
    };
    // wallets estimate gas first, which surfaces reverts before signing
    if let Err(reason) = check(state, &pending) {
        return Err(revert(reason));
    }
    if state.reject_signatures {
        return Err(response_error(
            USER_REJECTED_CODE,
            "User denied transaction signature.",
        ));
    }
    state.nonce += 1;
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Keccak256::digest(state.nonce.to_be_bytes()));
    let tx_hash = TxHash::new(hash);
    if state.auto_mine {
        mine_one(state, tx_hash, pending);
    } else {
        state.mempool.push((tx_hash, pending));
    }
    Ok(json!(tx_hash.to_string()))
}

fn check(state: &ChainState, tx: &PendingTx) -> Result<(), &'static str> {
    if tx.selector == abi::selector(abi::ENTER) {
        if state.state != RoundState::Open {
            return Err("Lottery is not open");
        }
        if tx.value != FakeChain::ENTRY_FEE {
            return Err("Incorrect entry fee");
        }
        if state.entered.contains(&(state.round, tx.from)) {
            return Err("Already entered this round");
        }
        Ok(())
    } else if tx.selector == abi::selector(abi::START_LOTTERY) {
        if tx.from != state.owner {
            return Err("Only owner");
        }
        if state.state != RoundState::Closed {
            return Err("Lottery already open");
        }
        Ok(())
    } else if tx.selector == abi::selector(abi::END_LOTTERY) {
        if tx.from != state.owner {
            return Err("Only owner");
        }
        if state.state != RoundState::Open {
            return Err("Lottery is not open");
        }
        Ok(())
    } else {
        Err("unknown function")
    }
}

fn mine_one(state: &mut ChainState, tx_hash: TxHash, tx: PendingTx) {
    state.block += 1;
    let success = !state.revert_on_mine && check(state, &tx).is_ok();
    if success {
        if tx.selector == abi::selector(abi::ENTER) {
            let round = state.round;
            state.players.push(tx.from);
            state.entered.insert((round, tx.from));
        } else if tx.selector == abi::selector(abi::START_LOTTERY) {
            state.round += 1;
            state.state = RoundState::Open;
            state.players.clear();
        } else if tx.selector == abi::selector(abi::END_LOTTERY) {
            state.winner = state.players.first().copied().unwrap_or(Address::ZERO);
            state.state = RoundState::Closed;
        }
    }
    state.receipts.insert(tx_hash, success);
}
