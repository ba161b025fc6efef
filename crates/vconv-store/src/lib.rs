//! Persistence for the conversion worker.
//!
//! - [`ledger`]: which videos have been converted
//! - [`error_log`]: structured failure records
//! - [`memory`]: in-process implementations of both

pub mod error;
pub mod error_log;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod pool;

pub use error::{StoreError, StoreResult};
pub use error_log::{ErrorReporter, PgErrorLog};
pub use ledger::{IdempotencyLedger, MarkOutcome, PgLedger};
pub use memory::{MemoryErrorLog, MemoryLedger};
pub use pool::{connect, create_pool, run_migrations, StoreConfig};

pub use sqlx;
pub use sqlx::PgPool;
