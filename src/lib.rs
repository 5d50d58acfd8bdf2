// src/lib.rs

pub mod batch;
pub mod clock;
pub mod codec;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod error;
pub mod keydir;
pub mod lock;
pub mod log_file;
pub mod recovery;
pub mod snapshot;

pub use batch::{BatchOp, WriteBatch};
pub use compactor::CompactionSummary;
pub use config::{Options, SyncStrategy};
pub use engine::{Engine, EngineStats};
pub use error::{DbError, DbResult};
pub use snapshot::Snapshot;
