use anyhow::{
    Context,
    Result,
    anyhow,
};
use chrono::Utc;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    fs,
    path::{
        Path,
        PathBuf,
    },
    str::FromStr,
};

pub const DEPLOYMENTS_ROOT: &str = ".deployments";
const DEPLOYMENTS_FILE: &str = "deployments.json";

pub const SEPOLIA_CHAIN_ID: u64 = 11_155_111;
pub const LOCAL_CHAIN_ID: u64 = 31_337;
pub const DEFAULT_SEPOLIA_RPC_URL: &str = "https://ethereum-sepolia-rpc.publicnode.com";
pub const DEFAULT_LOCAL_RPC_URL: &str = "http://127.0.0.1:8545";
/// 0.01 ether.
pub const DEFAULT_ENTRY_FEE_WEI: u128 = 10_000_000_000_000_000;

const SEPOLIA_LOTTERY_ADDRESS: &str = "0x9E8C9d5d8C27A0D3b9Ad96889E64d0eb0722Bd64";
// first contract deployed by the default dev account of a fresh local node
const LOCAL_LOTTERY_ADDRESS: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeploymentEnv {
    Sepolia,
    Local,
}

impl DeploymentEnv {
    pub const ALL: [DeploymentEnv; 2] = [DeploymentEnv::Sepolia, DeploymentEnv::Local];

    pub fn dir_name(self) -> &'static str {
        match self {
            DeploymentEnv::Sepolia => "sepolia",
            DeploymentEnv::Local => "local",
        }
    }

    pub fn chain_id(self) -> u64 {
        match self {
            DeploymentEnv::Sepolia => SEPOLIA_CHAIN_ID,
            DeploymentEnv::Local => LOCAL_CHAIN_ID,
        }
    }

    pub fn default_rpc_url(self) -> &'static str {
        match self {
            DeploymentEnv::Sepolia => DEFAULT_SEPOLIA_RPC_URL,
            DeploymentEnv::Local => DEFAULT_LOCAL_RPC_URL,
        }
    }

    /// The record used when nothing has been saved for this network.
    pub fn default_record(self) -> DeploymentRecord {
        let contract_address = match self {
            DeploymentEnv::Sepolia => SEPOLIA_LOTTERY_ADDRESS,
            DeploymentEnv::Local => LOCAL_LOTTERY_ADDRESS,
        };
        DeploymentRecord {
            recorded_at: None,
            contract_address: contract_address.to_string(),
            chain_id: self.chain_id(),
            entry_fee_wei: DEFAULT_ENTRY_FEE_WEI,
            rpc_url: self.default_rpc_url().to_string(),
        }
    }
}

impl fmt::Display for DeploymentEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentEnv::Sepolia => "Sepolia",
            DeploymentEnv::Local => "Local",
        };
        write!(f, "{name}")
    }
}

impl FromStr for DeploymentEnv {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        DeploymentEnv::ALL
            .into_iter()
            .find(|env| env.dir_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow!("Unknown network {s:?}; expected sepolia or local"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    #[serde(default)]
    pub recorded_at: Option<String>,
    pub contract_address: String,
    pub chain_id: u64,
    #[serde(default = "default_entry_fee")]
    pub entry_fee_wei: u128,
    pub rpc_url: String,
}

fn default_entry_fee() -> u128 {
    DEFAULT_ENTRY_FEE_WEI
}

impl DeploymentRecord {
    pub fn is_for_chain(&self, chain_id: u64) -> bool {
        self.chain_id == chain_id
    }
}

#[derive(Debug)]
pub struct DeploymentStore {
    env: DeploymentEnv,
    path: PathBuf,
}

impl DeploymentStore {
    pub fn new(env: DeploymentEnv) -> Result<Self> {
        Self::at(DEPLOYMENTS_ROOT, env)
    }

    /// A store rooted somewhere other than the working directory.
    pub fn at(root: impl AsRef<Path>, env: DeploymentEnv) -> Result<Self> {
        let path = ensure_store(root.as_ref(), env)?;
        Ok(Self { env, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<DeploymentRecord>> {
        read_record(&self.path)
    }

    /// The saved record, or the network's built-in default.
    pub fn load_or_default(&self) -> Result<DeploymentRecord> {
        Ok(self
            .load()?
            .unwrap_or_else(|| self.env.default_record()))
    }

    pub fn save(&self, record: &DeploymentRecord) -> Result<()> {
        write_record(&self.path, record)
    }
}

fn ensure_store(root: &Path, env: DeploymentEnv) -> Result<PathBuf> {
    let env_dir = root.join(env.dir_name());
    if !env_dir.exists() {
        fs::create_dir_all(&env_dir).with_context(|| {
            format!(
                "Failed to create deployment directory {}",
                env_dir.display()
            )
        })?;
    }

    let file_path = env_dir.join(DEPLOYMENTS_FILE);
    if !file_path.exists() {
        fs::write(&file_path, b"").with_context(|| {
            format!(
                "Failed to create deployment record file for {} at {:?}",
                env, file_path
            )
        })?;
    }

    Ok(file_path)
}

fn read_record(path: impl AsRef<Path>) -> Result<Option<DeploymentRecord>> {
    let data = fs::read(path.as_ref()).context("Failed to read deployment records")?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    if let Ok(record) = serde_json::from_slice::<DeploymentRecord>(&data) {
        return Ok(Some(record));
    }
    if let Ok(mut records) = serde_json::from_slice::<Vec<DeploymentRecord>>(&data) {
        return Ok(records.pop());
    }
    Err(anyhow!(
        "Failed to parse deployment record JSON; expected a single deployment object"
    ))
}

fn write_record(path: impl AsRef<Path>, record: &DeploymentRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)
        .context("Failed to serialize deployment record")?;
    fs::write(path.as_ref(), json).context("Failed to write deployment record")?;
    Ok(())
}

/// Stamps and saves a record for `env` under the default root.
pub fn record_deployment(
    env: DeploymentEnv,
    contract_address: impl AsRef<str>,
    entry_fee_wei: u128,
    rpc_url: impl AsRef<str>,
) -> Result<DeploymentRecord> {
    let store = DeploymentStore::new(env)?;
    let record = DeploymentRecord {
        recorded_at: Some(Utc::now().to_rfc3339()),
        contract_address: contract_address.as_ref().to_string(),
        chain_id: env.chain_id(),
        entry_fee_wei,
        rpc_url: rpc_url.as_ref().to_string(),
    };
    store.save(&record)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn load__empty_store_has_no_record() {
        // given
        let dir = TempDir::new("deployments").unwrap();
        let store = DeploymentStore::at(dir.path(), DeploymentEnv::Local).unwrap();

        // when
        let record = store.load().unwrap();

        // then
        assert_eq!(record, None);
        assert!(store.path().ends_with("local/deployments.json"));
    }

    #[test]
    fn save__round_trips_through_json() {
        // given
        let dir = TempDir::new("deployments").unwrap();
        let store = DeploymentStore::at(dir.path(), DeploymentEnv::Sepolia).unwrap();
        let record = DeploymentRecord {
            recorded_at: Some(Utc::now().to_rfc3339()),
            ..DeploymentEnv::Sepolia.default_record()
        };

        // when
        store.save(&record).unwrap();

        // then
        assert_eq!(store.load().unwrap(), Some(record));
    }

    #[test]
    fn load_or_default__falls_back_to_builtin_record() {
        let dir = TempDir::new("deployments").unwrap();
        let store = DeploymentStore::at(dir.path(), DeploymentEnv::Sepolia).unwrap();

        let record = store.load_or_default().unwrap();

        assert_eq!(
            record.contract_address,
            "0x9E8C9d5d8C27A0D3b9Ad96889E64d0eb0722Bd64"
        );
        assert_eq!(record.entry_fee_wei, 10_000_000_000_000_000);
        assert!(record.is_for_chain(SEPOLIA_CHAIN_ID));
    }

    #[test]
    fn load__accepts_a_list_and_takes_the_latest() {
        // given
        let dir = TempDir::new("deployments").unwrap();
        let store = DeploymentStore::at(dir.path(), DeploymentEnv::Local).unwrap();
        let older = DeploymentEnv::Local.default_record();
        let newer = DeploymentRecord {
            contract_address: "0x0000000000000000000000000000000000000001".to_string(),
            ..older.clone()
        };
        fs::write(store.path(), serde_json::to_vec(&vec![older, newer.clone()]).unwrap())
            .unwrap();

        // when
        let loaded = store.load().unwrap();

        // then
        assert_eq!(loaded, Some(newer));
    }

    #[test]
    fn load__rejects_garbage() {
        let dir = TempDir::new("deployments").unwrap();
        let store = DeploymentStore::at(dir.path(), DeploymentEnv::Local).unwrap();
        fs::write(store.path(), b"{not json").unwrap();

        assert!(store.load().is_err());
    }

    #[test]
    fn deployment_env_from_str__is_case_insensitive() {
        assert_eq!("Sepolia".parse::<DeploymentEnv>().unwrap(), DeploymentEnv::Sepolia);
        assert_eq!("local".parse::<DeploymentEnv>().unwrap(), DeploymentEnv::Local);
        assert!("mainnet".parse::<DeploymentEnv>().is_err());
    }
}
