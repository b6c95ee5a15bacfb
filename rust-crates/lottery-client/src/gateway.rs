use crate::{
    abi,
    config::EngineConfig,
    error::{
        Result,
        SyncError,
    },
    rpc::{
        RpcTransport,
        decode_hex,
        encode_hex,
        parse_quantity,
        parse_tx_hash,
        quantity,
    },
    session::{
        Session,
        Signer,
    },
    types::{
        Address,
        PendingAction,
        RoundState,
        TxHash,
    },
};
use serde_json::{
    Map,
    Value,
    json,
};
use std::time::Duration;
use tokio::time::{
    self,
    MissedTickBehavior,
};
use tracing::{
    debug,
    warn,
};

/// The read half of the contract surface.
pub trait LotteryReader: Send + Sync {
    fn current_round(&self) -> impl Future<Output = Result<u64>> + Send;

    fn players_count(&self) -> impl Future<Output = Result<u64>> + Send;

    fn owner(&self) -> impl Future<Output = Result<Address>> + Send;

    fn lottery_state(&self) -> impl Future<Output = Result<RoundState>> + Send;

    fn recent_winner(&self) -> impl Future<Output = Result<Address>> + Send;

    fn has_entered(&self, who: Address) -> impl Future<Output = Result<bool>> + Send;
}

/// The write half of the contract surface, bound to a signing account.
pub trait LotteryWriter: Send + Sync + 'static {
    fn sender(&self) -> Address;

    /// Hands the call to the wallet. Resolves with the transaction hash once
    /// the wallet has accepted and broadcast it.
    fn submit(&self, pending: &PendingAction) -> impl Future<Output = Result<TxHash>> + Send;

    /// Resolves once the transaction is mined, or with the reason it never
    /// will be.
    fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
    ) -> impl Future<Output = Result<Receipt>> + Send;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadSource {
    Wallet,
    Fallback,
}

#[derive(Clone, Debug)]
pub struct ReadHandle<T> {
    transport: T,
    contract: Address,
    source: ReadSource,
}

impl<T: RpcTransport> ReadHandle<T> {
    pub fn new(transport: T, contract: Address, source: ReadSource) -> Self {
        Self {
            transport,
            contract,
            source,
        }
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    async fn call(&self, signature: &str, args: &[abi::Word]) -> Result<Vec<u8>> {
        let data = abi::encode_call(signature, args);
        let params = json!([
            { "to": self.contract.to_string(), "data": encode_hex(&data) },
            "latest",
        ]);
        let value = self.transport.request("eth_call", params).await?;
        let raw = value
            .as_str()
            .ok_or_else(|| SyncError::rpc(format!("{signature}: expected hex result, got {value}")))?;
        decode_hex(raw)
    }
}

impl<T: RpcTransport> LotteryReader for ReadHandle<T> {
    async fn current_round(&self) -> Result<u64> {
        abi::decode_u64(&self.call(abi::CURRENT_ROUND, &[]).await?)
    }

    async fn players_count(&self) -> Result<u64> {
        abi::decode_u64(&self.call(abi::PLAYERS_COUNT, &[]).await?)
    }

    async fn owner(&self) -> Result<Address> {
        abi::decode_address(&self.call(abi::OWNER, &[]).await?)
    }

    async fn lottery_state(&self) -> Result<RoundState> {
        abi::decode_round_state(&self.call(abi::LOTTERY_STATE, &[]).await?)
    }

    async fn recent_winner(&self) -> Result<Address> {
        abi::decode_address(&self.call(abi::RECENT_WINNER, &[]).await?)
    }

    async fn has_entered(&self, who: Address) -> Result<bool> {
        let data = self
            .call(abi::HAS_ENTERED, &[abi::address_word(&who)])
            .await?;
        abi::decode_bool(&data)
    }
}

#[derive(Clone, Debug)]
pub struct WriteHandle<T> {
    signer: Signer<T>,
    contract: Address,
    receipt_poll_interval: Duration,
    confirmation_timeout: Duration,
}

impl<T: RpcTransport> WriteHandle<T> {
    pub fn new(signer: Signer<T>, config: &EngineConfig) -> Self {
        Self {
            signer,
            contract: config.contract,
            receipt_poll_interval: config.receipt_poll_interval,
            confirmation_timeout: config.confirmation_timeout,
        }
    }

    fn transaction(&self, pending: &PendingAction) -> Value {
        let data = abi::encode_call(abi::action_signature(pending.action), &[]);
        let mut tx = Map::new();
        tx.insert("from".into(), json!(self.signer.address().to_string()));
        tx.insert("to".into(), json!(self.contract.to_string()));
        tx.insert("data".into(), json!(encode_hex(&data)));
        if let Some(value) = pending.attached_value {
            tx.insert("value".into(), json!(quantity(value)));
        }
        Value::Object(tx)
    }

    async fn poll_receipt(&self, tx_hash: TxHash) -> Result<Receipt> {
        let mut ticker = time::interval(self.receipt_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let res = self
                .signer
                .transport()
                .request("eth_getTransactionReceipt", json!([tx_hash.to_string()]))
                .await;
            // the confirmation timeout bounds the retries
            let value = match res {
                Ok(value) => value,
                Err(err) => {
                    warn!(%tx_hash, %err, "receipt poll failed, retrying");
                    continue;
                }
            };
            if value.is_null() {
                debug!(%tx_hash, "transaction not mined yet");
                continue;
            }
            return receipt_from_json(tx_hash, &value);
        }
    }
}

fn receipt_from_json(tx_hash: TxHash, value: &Value) -> Result<Receipt> {
    let status = value
        .get("status")
        .map(parse_quantity)
        .transpose()?
        .unwrap_or(1);
    if status == 0 {
        return Err(SyncError::TransactionReverted {
            reason: "execution reverted".to_string(),
            tx_hash: Some(tx_hash),
        });
    }
    let block_number = value
        .get("blockNumber")
        .filter(|v| !v.is_null())
        .map(parse_quantity)
        .transpose()?;
    Ok(Receipt {
        tx_hash,
        block_number,
    })
}

impl<T: RpcTransport> LotteryWriter for WriteHandle<T> {
    fn sender(&self) -> Address {
        self.signer.address()
    }

    async fn submit(&self, pending: &PendingAction) -> Result<TxHash> {
        let params = json!([self.transaction(pending)]);
        tokio::select! {
            res = self.signer.transport().request("eth_sendTransaction", params) => {
                parse_tx_hash(&res?)
            }
            _ = self.signer.closed() => Err(SyncError::SessionClosed),
        }
    }

    async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<Receipt> {
        let timeout = self.confirmation_timeout;
        tokio::select! {
            res = time::timeout(timeout, self.poll_receipt(tx_hash)) => {
                res.map_err(|_| {
                    SyncError::rpc(format!(
                        "transaction {} not confirmed within {timeout:?}",
                        tx_hash.short(),
                    ))
                })?
            }
            _ = self.signer.closed() => Err(SyncError::SessionClosed),
        }
    }
}

/// Handles to the lottery contract for the current session.
///
/// Built fresh whenever the session changes; never mutated in place.
#[derive(Clone, Debug)]
pub struct ContractGateway<T> {
    read: ReadHandle<T>,
    write: Option<WriteHandle<T>>,
}

impl<T: RpcTransport> ContractGateway<T> {
    pub fn bind(config: &EngineConfig, fallback: &T, session: Option<&Session<T>>) -> Self {
        match session {
            Some(session) => Self {
                read: ReadHandle::new(
                    session.transport().clone(),
                    config.contract,
                    ReadSource::Wallet,
                ),
                write: Some(WriteHandle::new(session.signer(), config)),
            },
            None => Self {
                read: ReadHandle::new(fallback.clone(), config.contract, ReadSource::Fallback),
                write: None,
            },
        }
    }

    pub fn read_handle(&self) -> ReadHandle<T> {
        self.read.clone()
    }

    pub fn write_handle(&self) -> Option<WriteHandle<T>> {
        self.write.clone()
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        session::WalletConnector,
        test_helpers::FakeChain,
        types::LotteryAction,
    };

    const FEE: u128 = 10_000_000_000_000_000;

    fn owner() -> Address {
        Address::new([0x0e; 20])
    }

    fn player() -> Address {
        Address::new([0x77; 20])
    }

    fn config() -> EngineConfig {
        EngineConfig::new(FakeChain::CONTRACT, FEE)
            .with_receipt_poll_interval(Duration::from_millis(5))
            .with_confirmation_timeout(Duration::from_millis(200))
    }

    async fn session(chain: &FakeChain) -> Session<FakeChain> {
        WalletConnector::new(Some(chain.clone()), Duration::from_millis(5))
            .connect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn bind__without_session_reads_from_fallback_and_cannot_write() {
        // given
        let chain = FakeChain::new(owner());

        // when
        let gateway = ContractGateway::bind(&config(), &chain, None);

        // then
        assert_eq!(gateway.read_handle().source(), ReadSource::Fallback);
        assert!(gateway.write_handle().is_none());
        assert_eq!(gateway.read_handle().owner().await, Ok(owner()));
    }

    #[tokio::test]
    async fn bind__with_session_exposes_write_handle_for_session_address() {
        let chain = FakeChain::new(owner()).with_accounts(vec![player()]);
        let session = session(&chain).await;

        let gateway = ContractGateway::bind(&config(), &chain, Some(&session));

        assert_eq!(gateway.read_handle().source(), ReadSource::Wallet);
        assert_eq!(gateway.write_handle().map(|w| w.sender()), Some(player()));
    }

    #[tokio::test]
    async fn read_handle__decodes_every_field() {
        // given
        let chain = FakeChain::new(owner()).with_accounts(vec![player()]);
        chain.open_round();
        chain.add_entrant(player());
        let reader = ContractGateway::bind(&config(), &chain, None).read_handle();

        // then
        assert_eq!(reader.current_round().await, Ok(1));
        assert_eq!(reader.players_count().await, Ok(1));
        assert_eq!(reader.lottery_state().await, Ok(RoundState::Open));
        assert_eq!(reader.recent_winner().await, Ok(Address::ZERO));
        assert_eq!(reader.has_entered(player()).await, Ok(true));
        assert_eq!(reader.has_entered(owner()).await, Ok(false));
    }

    #[tokio::test]
    async fn submit__attaches_entry_fee_and_confirms() {
        // given
        let chain = FakeChain::new(owner()).with_accounts(vec![player()]);
        chain.open_round();
        let session = session(&chain).await;
        let writer = ContractGateway::bind(&config(), &chain, Some(&session))
            .write_handle()
            .unwrap();

        // when
        let tx_hash = writer
            .submit(&PendingAction::new(LotteryAction::Enter, FEE))
            .await
            .unwrap();
        let receipt = writer.wait_for_confirmation(tx_hash).await.unwrap();

        // then
        assert_eq!(receipt.tx_hash, tx_hash);
        assert!(chain.has_entered(player()));
    }

    #[tokio::test]
    async fn submit__surfaces_revert_reason() {
        // given
        let chain = FakeChain::new(owner()).with_accounts(vec![player()]);
        let session = session(&chain).await;
        let writer = ContractGateway::bind(&config(), &chain, Some(&session))
            .write_handle()
            .unwrap();

        // when
        let result = writer
            .submit(&PendingAction::new(LotteryAction::Enter, FEE))
            .await;

        // then
        assert_eq!(
            result.map_err(|e| e.reason()),
            Err("Lottery is not open".to_string())
        );
    }

    #[tokio::test]
    async fn wait_for_confirmation__times_out_as_rpc_failure() {
        // given
        let chain = FakeChain::new(owner()).with_accounts(vec![owner()]);
        chain.set_auto_mine(false);
        let session = session(&chain).await;
        let writer = ContractGateway::bind(&config(), &chain, Some(&session))
            .write_handle()
            .unwrap();
        let tx_hash = writer
            .submit(&PendingAction::new(LotteryAction::StartRound, FEE))
            .await
            .unwrap();

        // when
        let result = writer.wait_for_confirmation(tx_hash).await;

        // then
        assert!(matches!(result, Err(SyncError::RpcFailure(_))));
    }

    #[tokio::test]
    async fn wait_for_confirmation__retries_after_a_dropped_receipt_request() {
        // given
        let chain = FakeChain::new(owner()).with_accounts(vec![owner()]);
        let session = session(&chain).await;
        let writer = ContractGateway::bind(&config(), &chain, Some(&session))
            .write_handle()
            .unwrap();
        let tx_hash = writer
            .submit(&PendingAction::new(LotteryAction::StartRound, FEE))
            .await
            .unwrap();
        chain.fail_next_receipt_polls(2);

        // when
        let receipt = writer.wait_for_confirmation(tx_hash).await;

        // then
        assert_eq!(receipt.map(|r| r.tx_hash), Ok(tx_hash));
        assert_eq!(chain.call_count("eth_getTransactionReceipt"), 3);
    }

    #[tokio::test]
    async fn wait_for_confirmation__ends_when_session_closes() {
        // given
        let chain = FakeChain::new(owner()).with_accounts(vec![owner()]);
        chain.set_auto_mine(false);
        let session = session(&chain).await;
        let writer = ContractGateway::bind(&config(), &chain, Some(&session))
            .write_handle()
            .unwrap();
        let tx_hash = writer
            .submit(&PendingAction::new(LotteryAction::StartRound, FEE))
            .await
            .unwrap();

        // when
        session.close();
        let result = writer.wait_for_confirmation(tx_hash).await;

        // then
        assert_eq!(result, Err(SyncError::SessionClosed));
    }

    #[test]
    fn receipt_from_json__failed_status_is_a_revert_with_hash() {
        let tx_hash = TxHash::new([9; 32]);
        let result = receipt_from_json(tx_hash, &json!({ "status": "0x0" }));
        assert_eq!(
            result,
            Err(SyncError::TransactionReverted {
                reason: "execution reverted".to_string(),
                tx_hash: Some(tx_hash),
            })
        );
    }
}
