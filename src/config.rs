use crate::error::{DbError, DbResult};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Whether single puts and removes are fsynced before returning. Batches are
/// always fsynced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    Always,
    #[default]
    Never,
}

/// Engine options.
///
/// Only `max_file_size`, `dirname`, `read_only` and `sync` change behavior.
/// The merge tuning knobs are accepted and reported so existing configuration
/// files keep parsing, but nothing schedules compaction from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub max_file_size: u64,
    pub dirname: PathBuf,
    pub read_only: bool,
    pub sync: SyncStrategy,

    pub merge_window: String,
    pub frag_merge_trigger: u32,
    pub dead_bytes_merge_trigger: u64,
    pub frag_threshold: u32,
    pub dead_bytes_threshold: u64,
    pub small_file_threshold: u64,
    pub max_fold_age: i64,
    pub max_fold_puts: u64,
    pub expiry_secs: i64,
}

pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

impl Default for Options {
    fn default() -> Self {
        Options {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            dirname: PathBuf::from("medea"),
            read_only: false,
            sync: SyncStrategy::Never,
            merge_window: "always".to_string(),
            frag_merge_trigger: 60,
            dead_bytes_merge_trigger: 512 * 1024 * 1024,
            frag_threshold: 40,
            dead_bytes_threshold: 128 * 1024 * 1024,
            small_file_threshold: 10 * 1024 * 1024,
            max_fold_age: -1,
            max_fold_puts: 0,
            expiry_secs: -1,
        }
    }
}

impl Options {
    /// Defaults, overlaid with an optional TOML file, overlaid with `MEDEA_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> DbResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!("Loading configuration from {:?}", path);
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(Environment::with_prefix("MEDEA").try_parsing(true));

        let options: Options = builder.build()?.try_deserialize()?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.max_file_size == 0 {
            return Err(DbError::Config("max_file_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn with_dirname(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dirname = dir.into();
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_sync(mut self, sync: SyncStrategy) -> Self {
        self.sync = sync;
        self
    }
}
