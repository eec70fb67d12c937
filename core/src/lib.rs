pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod inventory;
pub mod lock;
pub mod manifest;
pub mod objects;
pub mod pipeline;
pub mod remote;
pub mod restore;
pub mod run;
pub mod types;

pub use config::{EngineConfig, KdfParams};
pub use crypto::{EncryptionKey, derive_key};
pub use error::{Error, Result};
pub use identity::{SnapshotIdentity, derive_identity};
pub use lock::{LockCoordinator, LockMode, LockRecord, LockState, LockToken};
pub use manifest::{Manifest, ManifestStore};
pub use objects::ObjectStore;
pub use remote::{BackendType, MemoryStore, RemoteStore};
pub use run::{
    CancelToken, CreateOptions, CreateReport, NoProgress, Phase, Progress, RestoreReport,
    RunController, VerifyProblem, VerifyReport,
};
pub use types::*;
