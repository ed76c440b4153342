//! Parallel batch execution engine for the medical-text annotator.
//!
//! Design principles:
//! - Worker threads plus bounded channels; no async runtime. Each worker
//!   holds exactly one instance lease and advances one job at a time.
//! - Every failure funnels through one error type ([`error::JobError`]) and
//!   one retry policy ([`retry::RetryPolicy`]).
//! - Only the pool touches instance bookkeeping; only the invoker touches
//!   child processes; only the state manager touches persistence.

pub mod batch;
pub mod error;
pub mod events;
pub mod invoke;
pub mod mmo;
pub mod output;
pub mod pool;
pub mod retry;
pub mod scan;
pub mod server;

pub use batch::{BatchOutcome, BatchRunner, CancelState};
pub use error::JobError;
pub use events::{ProgressBus, Subscription};
pub use pool::{InstancePool, LeaseOutcome};
pub use retry::RetryPolicy;
pub use server::{DaemonStatus, DaemonSupervisor, SupervisorError};
