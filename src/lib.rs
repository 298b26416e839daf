//! Distributed transaction engine for a clustered control plane.
//!
//! Nodes never talk to each other directly: a shared, watchable key-value
//! store carries transaction records, per-node status, step progress, the
//! transaction context and cluster locks. See [`transaction`] for the
//! execution model and [`store`] for what a backing store must provide.

pub mod config;
pub mod error;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod runtime;
pub mod store;
pub mod transaction;
pub mod types;

pub use config::TxnConfig;
pub use error::{Error, Result};
pub use lock::{DistributedMutex, Locks};
pub use runtime::TxnRuntime;
pub use store::{LivenessRegistry, MemoryStore, Session, Store};
pub use transaction::{
    CleanupHandler, Engine, Executor, Step, StepManager, StepRegistry, Txn, TxnCtx, TxnManager,
    TxnState, TxnStatus,
};
pub use types::{NodeId, TxnId};
