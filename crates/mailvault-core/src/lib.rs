pub mod backup;
pub mod config;
pub mod db;
pub mod error;
pub mod gmail;
pub mod message;
pub mod migrations;
pub mod naming;
pub mod rehydrate;
pub mod restore;
pub mod retry;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use backup::{BackupEngine, BackupMode, BackupOptions, BackupStats};
pub use config::Config;
pub use db::Database;
pub use error::{ItemError, RunError};
pub use gmail::{GmailMailboxFactory, MailApi, MailboxFactory};
pub use rehydrate::{RehydrateOptions, RehydrateReport, rehydrate_index};
pub use restore::{RestoreEngine, RestoreOptions, RestoreStats};
pub use retry::RetryPolicy;
pub use state::{RunLock, StateStore};
pub use storage::{FsObjectStore, MemoryObjectStore, ObjectStore, S3ObjectStore};
pub use telemetry::{TelemetryError, init_logging};
