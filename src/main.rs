// src/main.rs

use clap::{Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn, Level};

use medea::{DbError, Engine, Options, SyncStrategy};

#[derive(ValueEnum, Clone, Debug, Copy)]
enum CliSyncStrategy {
    Always,
    Never,
}

impl From<CliSyncStrategy> for SyncStrategy {
    fn from(cli_strategy: CliSyncStrategy) -> Self {
        match cli_strategy {
            CliSyncStrategy::Always => SyncStrategy::Always,
            CliSyncStrategy::Never => SyncStrategy::Never,
        }
    }
}

#[derive(ValueEnum, Clone, Debug, Copy)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Log-structured key-value store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a configuration file (TOML format)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database directory (overrides config)
    #[arg(short, long, value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Rotate the active file once it would grow past this many bytes (overrides config)
    #[arg(long, value_name = "BYTES")]
    max_file_size: Option<u64>,

    /// Write synchronization strategy (overrides config)
    #[arg(long, value_enum)]
    sync: Option<CliSyncStrategy>,

    /// Open without taking the directory lock; writes are rejected
    #[arg(long)]
    read_only: bool,

    /// Log verbosity on stderr
    #[arg(long, value_enum, default_value = "warn")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store VALUE under KEY
    Put { key: String, value: String },
    /// Print the value stored under KEY
    Get { key: String },
    /// Delete KEY
    Remove { key: String },
    /// List every live key
    Keys,
    /// Merge read-only files and reclaim dead records
    Compact,
    /// Print engine statistics as JSON
    Stats,
    /// Delete every database file in the directory
    Destroy,
    /// Read commands from stdin, one per line
    Shell {
        /// Compact in the background every N seconds (0 disables)
        #[arg(long, value_name = "SECONDS", default_value_t = 0)]
        compact_interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::from(args.log_level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut options = match Options::load(args.config.as_deref()) {
        Ok(options) => options,
        Err(e) => {
            error!("Error loading configuration: {}", e);
            eprintln!("Error: Could not load configuration: {}", e);
            process::exit(1);
        }
    };
    if let Some(dir) = args.dir.clone() {
        options.dirname = dir;
    }
    if let Some(bytes) = args.max_file_size {
        options.max_file_size = bytes;
    }
    if let Some(sync) = args.sync {
        options.sync = sync.into();
    }
    if args.read_only {
        options.read_only = true;
    }

    debug!("--- Final Configuration ---");
    debug!("Directory: {:?}", options.dirname);
    debug!("Max file size: {} bytes", options.max_file_size);
    debug!("Sync strategy: {:?}", options.sync);
    debug!("Read only: {}", options.read_only);
    debug!("---------------------------");

    if let Command::Destroy = args.command {
        match Engine::destroy(&options.dirname) {
            Ok(()) => {
                println!("OK");
                return Ok(());
            }
            Err(e) => fail("Could not destroy database", &e),
        }
    }

    let engine = match Engine::open_with_options(options) {
        Ok(engine) => Arc::new(engine),
        Err(e) => fail("Could not open database", &e),
    };
    info!("Database opened successfully.");

    let status = match args.command {
        Command::Put { key, value } => run_step(engine.put(key.as_bytes(), value.as_bytes()), |_| {
            println!("OK");
            0
        }),
        Command::Get { key } => run_step(engine.get(key.as_bytes()), |value| match value {
            Some(value) => {
                println!("{}", String::from_utf8_lossy(&value));
                0
            }
            None => {
                println!("(nil)");
                1
            }
        }),
        Command::Remove { key } => run_step(engine.remove(key.as_bytes()), |_| {
            println!("OK");
            0
        }),
        Command::Keys => run_step(engine.list_keys(), |keys| {
            print_keys(keys);
            0
        }),
        Command::Compact => run_step(engine.compact(), |summary| {
            print_json(&summary);
            0
        }),
        Command::Stats => run_step(engine.stats(), |stats| {
            print_json(&stats);
            0
        }),
        Command::Shell {
            compact_interval_secs,
        } => {
            let task = if compact_interval_secs > 0 {
                Some(spawn_compaction_task(engine.clone(), compact_interval_secs))
            } else {
                None
            };
            let status = run_shell(&engine).await;
            if let Some(task) = task {
                task.abort();
            }
            status
        }
        Command::Destroy => 0,
    };

    if let Err(e) = engine.close() {
        error!("Error closing database: {}", e);
    }
    info!("Shutdown complete.");
    process::exit(status);
}

fn fail(context: &str, e: &DbError) -> ! {
    error!("{}: {}", context, e);
    match e {
        DbError::AlreadyOpen { path } => {
            eprintln!("Error: {:?} is in use by another process.", path);
        }
        _ => {
            eprintln!("Error: {}: {}", context, e);
        }
    }
    process::exit(2);
}

fn run_step<T>(result: Result<T, DbError>, on_ok: impl FnOnce(T) -> i32) -> i32 {
    match result {
        Ok(value) => on_ok(value),
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("Error: {}", e);
            2
        }
    }
}

fn print_keys(mut keys: Vec<Vec<u8>>) {
    keys.sort();
    for key in keys {
        println!("{}", String::from_utf8_lossy(&key));
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error: could not encode output: {}", e),
    }
}

/// Line protocol: `PUT key value`, `GET key`, `DEL key`, `KEYS`, `COMPACT`,
/// `SYNC`, `STATS`, `EXIT`. The value of `PUT` is the rest of the line.
async fn run_shell(engine: &Engine) -> i32 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                return 2;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(3, ' ');
        let command = parts.next().unwrap_or_default().to_ascii_uppercase();
        let key = parts.next().map(str::trim);
        let rest = parts.next();

        match (command.as_str(), key, rest) {
            ("PUT", Some(key), Some(value)) => {
                shell_reply(engine.put(key.as_bytes(), value.as_bytes()).map(|_| "OK".to_string()))
            }
            ("GET", Some(key), None) => shell_reply(engine.get(key.as_bytes()).map(|v| match v {
                Some(value) => String::from_utf8_lossy(&value).into_owned(),
                None => "(nil)".to_string(),
            })),
            ("DEL", Some(key), None) => {
                shell_reply(engine.remove(key.as_bytes()).map(|_| "OK".to_string()))
            }
            ("KEYS", None, None) => match engine.list_keys() {
                Ok(keys) => print_keys(keys),
                Err(e) => println!("ERR {}", e),
            },
            ("COMPACT", None, None) => match engine.compact() {
                Ok(summary) => print_json(&summary),
                Err(e) => println!("ERR {}", e),
            },
            ("SYNC", None, None) => shell_reply(engine.sync().map(|_| "OK".to_string())),
            ("STATS", None, None) => match engine.stats() {
                Ok(stats) => print_json(&stats),
                Err(e) => println!("ERR {}", e),
            },
            ("EXIT", None, None) | ("QUIT", None, None) => break,
            _ => println!("ERR unrecognized command: {}", line),
        }
    }
    0
}

fn shell_reply(result: Result<String, DbError>) {
    match result {
        Ok(reply) => println!("{}", reply),
        Err(e) => {
            warn!("Shell command failed: {}", e);
            println!("ERR {}", e);
        }
    }
}

// --- Maintenance Task ---

fn spawn_compaction_task(engine: Arc<Engine>, interval_secs: u64) -> JoinHandle<()> {
    let is_compacting = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        // The first tick completes immediately.
        interval.tick().await;
        info!("Compaction task started. Interval: {}s", interval_secs);

        loop {
            interval.tick().await;
            if is_compacting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("Compaction already running, skipping this tick.");
                continue;
            }
            let engine = engine.clone();
            let flag = is_compacting.clone();
            tokio::task::spawn_blocking(move || {
                info!("Starting background compaction...");
                match engine.compact() {
                    Ok(summary) if summary.skipped => debug!("Background compaction had nothing to do."),
                    Ok(_) => info!("Background compaction finished successfully."),
                    Err(DbError::NotOpen) => debug!("Database closed, skipping compaction."),
                    Err(e) => error!("Background compaction failed: {}", e),
                }
                flag.store(false, Ordering::SeqCst);
            });
        }
    })
}
