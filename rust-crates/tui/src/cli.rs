use clap::{
    Parser,
    ValueEnum,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use deployments::{
    DeploymentEnv,
    DeploymentRecord,
    DeploymentStore,
};
use lottery_client::{
    Address,
    EngineConfig,
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "lottery-tui.log";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Network {
    Sepolia,
    Local,
}

impl From<Network> for DeploymentEnv {
    fn from(network: Network) -> Self {
        match network {
            Network::Sepolia => DeploymentEnv::Sepolia,
            Network::Local => DeploymentEnv::Local,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(short, long, value_enum, default_value_t = Network::Sepolia)]
    pub network: Network,

    /// Public endpoint used for reads while no wallet is connected.
    #[arg(long)]
    pub rpc_url: Option<String>,

    /// Wallet endpoint. The local network defaults to the node itself.
    #[arg(short, long)]
    pub wallet_url: Option<String>,

    #[arg(short, long)]
    pub contract: Option<String>,

    #[arg(long)]
    pub entry_fee_wei: Option<u128>,

    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub refresh_secs: u64,

    /// Write logs to a daily rolling file in this directory.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Store the resolved contract, fee and endpoint as the network's record.
    #[arg(long, default_value = "false")]
    pub save: bool,
}

/// Everything the client needs to build an engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub network: DeploymentEnv,
    pub rpc_url: String,
    pub wallet_url: Option<String>,
    pub engine: EngineConfig,
}

impl Args {
    pub fn resolve(&self) -> Result<ClientConfig> {
        let env = DeploymentEnv::from(self.network);
        let store = DeploymentStore::new(env)
            .map_err(|e| eyre!("{e:#}"))
            .wrap_err("opening deployments store")?;
        let record = store
            .load_or_default()
            .map_err(|e| eyre!("{e:#}"))
            .wrap_err_with(|| format!("loading deployment from {}", store.path().display()))?;
        let config = self.resolve_with(record)?;
        if self.save {
            deployments::record_deployment(
                env,
                config.engine.contract.to_string(),
                config.engine.entry_fee,
                &config.rpc_url,
            )
            .map_err(|e| eyre!("{e:#}"))
            .wrap_err("saving deployment record")?;
            tracing::info!("Saved deployment record to {}", store.path().display());
        }
        Ok(config)
    }

    /// Command line values win over the record.
    pub fn resolve_with(&self, record: DeploymentRecord) -> Result<ClientConfig> {
        let network = DeploymentEnv::from(self.network);
        if !record.is_for_chain(network.chain_id()) {
            tracing::warn!(
                "Deployment record targets chain {} but {} is chain {}",
                record.chain_id,
                network,
                network.chain_id()
            );
        }
        let raw_contract = self
            .contract
            .as_deref()
            .unwrap_or(&record.contract_address)
            .trim();
        let contract: Address = raw_contract
            .parse()
            .map_err(|e| eyre!("Failed to parse contract address '{raw_contract}': {e}"))?;
        let entry_fee = self.entry_fee_wei.unwrap_or(record.entry_fee_wei);
        let rpc_url = self.rpc_url.clone().unwrap_or(record.rpc_url);
        let wallet_url = self.wallet_url.clone().or_else(|| match network {
            DeploymentEnv::Local => Some(rpc_url.clone()),
            DeploymentEnv::Sepolia => None,
        });
        let engine = EngineConfig::new(contract, entry_fee)
            .with_refresh_interval(Duration::from_secs(self.refresh_secs));
        Ok(ClientConfig {
            network,
            rpc_url,
            wallet_url,
            engine,
        })
    }
}

/// Keep the guard alive for as long as logs should be flushed.
pub fn init_tracing(log_dir: &Path) -> WorkerGuard {
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    guard
}
