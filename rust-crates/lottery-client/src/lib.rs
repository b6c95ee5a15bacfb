pub mod abi;
pub mod config;
pub mod derived;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod rpc;
pub mod session;
pub mod sync;
pub mod types;

mod task;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::EngineConfig;
pub use derived::{
    DerivedView,
    PrimaryAction,
};
pub use engine::{
    Engine,
    EngineStatus,
    EngineView,
    EngineWatcher,
    Notice,
    NoticeLevel,
};
pub use error::{
    Result,
    SyncError,
};
pub use orchestrator::{
    Rejection,
    Settlement,
    TxPhase,
};
pub use rpc::{
    HttpTransport,
    RpcTransport,
};
pub use types::{
    Address,
    ContractSnapshot,
    LotteryAction,
    PendingAction,
    RoundState,
    TxHash,
};
