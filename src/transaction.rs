//! Cluster-wide transactions coordinated through the store.
//!
//! The initiator publishes a [`Txn`] under `pending-transaction/`; every
//! participant's [`Engine`] picks it up, runs its share of the steps and
//! reports per-node status back through the same namespace. Failures fan out
//! the same way and each node rolls back what it completed.

pub mod cleanup;
pub mod context;
pub mod engine;
pub mod executor;
pub mod keys;
pub mod manager;
pub mod record;
pub mod step;
pub mod step_manager;
pub mod txn;

pub use cleanup::{CleanupHandler, LEADER_KEY};
pub use context::{TxnCtx, TxnCtxConfig};
pub use engine::Engine;
pub use executor::Executor;
pub use keys::PENDING_TXN_PREFIX;
pub use manager::TxnManager;
pub use record::{TxnRecord, TxnState, TxnStatus};
pub use step::{Step, StepFunc, StepFuture, StepRegistry};
pub use step_manager::{LocalStepManager, StepManager, TracingStepManager};
pub use txn::Txn;
