//! tm: command-line front end for taskmill.
//!
//! ```text
//! tm bootstrap                 install template, merge script and alias
//! tm ingest events.jsonl       aggregate a file of events and index them
//! tm run < events.jsonl        long-running ingest with maintenance loops
//! tm queue status|drain|reset  inspect or manage the failure queue
//! tm config show|check         print or validate the effective config
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use taskmill_core::config::{BackendKind, Config, LogFormat};
use taskmill_core::error::format_error_with_remediation;
use taskmill_core::failure_queue::{FailureQueue, FailureQueueConfig};
use taskmill_core::indexer::{IndexReport, PersistenceStats};
use taskmill_core::logging::{LogConfig, init_logging};
use taskmill_core::{Event, Taskmill};

type InputLines = Lines<Box<dyn AsyncBufRead + Unpin + Send>>;

// =============================================================================
// Arguments
// =============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "tm",
    version,
    about = "Aggregate task lifecycle events and index them resiliently"
)]
struct Cli {
    /// Path to taskmill.toml
    #[arg(long, short = 'c', global = true, env = "TASKMILL_CONFIG")]
    config: Option<PathBuf>,

    /// Override general.env
    #[arg(long, global = true, env = "TASKMILL_ENV")]
    env: Option<String>,

    /// Override general.data_dir
    #[arg(long, global = true, env = "TASKMILL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Override backend.kind
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendArg>,

    /// Override backend.url
    #[arg(long, global = true, env = "TASKMILL_BACKEND_URL")]
    backend_url: Option<String>,

    /// Log level filter; RUST_LOG still wins
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    /// Output format for command results
    #[arg(long, short = 'f', global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Memory,
    Http,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Memory => Self::Memory,
            BackendArg::Http => Self::Http,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Json => Self::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Install the index template and merge script, then create the write alias
    Bootstrap,
    /// Aggregate a JSON Lines file of events, index the tasks and exit
    Ingest(IngestArgs),
    /// Read events from stdin until EOF or Ctrl-C with maintenance running
    Run(RunArgs),
    /// Inspect or manage the durable failure queue
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Print or validate the effective configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// Event file, one JSON event per line; `-` reads stdin
    input: PathBuf,

    /// Events folded before each flush
    #[arg(long, default_value_t = 1000)]
    batch_size: usize,

    /// Fail on the first malformed line instead of skipping it
    #[arg(long)]
    strict: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Flush interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    flush_interval_ms: u64,

    /// Flush early once this many events are pending
    #[arg(long, default_value_t = 1000)]
    batch_size: usize,
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// Pending batches and queue health
    Status,
    /// Redeliver every stored batch now
    Drain,
    /// Delete every stored batch and recreate the schema
    Reset {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration with secrets masked
    Show,
    /// Validate the effective configuration
    Check,
}

// =============================================================================
// Entry point
// =============================================================================

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", render_error(&err));
            ExitCode::FAILURE
        }
    }
}

fn render_error(err: &anyhow::Error) -> String {
    match err.downcast_ref::<taskmill_core::Error>() {
        Some(core) => format_error_with_remediation(core),
        None => format!("Error: {err:#}"),
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    if let Commands::Config(command) = &cli.command {
        return config_command(command, &config, cli.format);
    }

    init_logging(&log_config(&cli, &config))?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(dispatch(cli.command, config, cli.format))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::default(),
    };
    if let Some(env) = &cli.env {
        config.general.env.clone_from(env);
    }
    if let Some(dir) = &cli.data_dir {
        config.general.data_dir.clone_from(dir);
    }
    if let Some(kind) = cli.backend {
        config.backend.kind = kind.into();
    }
    if let Some(url) = &cli.backend_url {
        config.backend.url.clone_from(url);
    }
    Ok(config)
}

fn log_config(cli: &Cli, config: &Config) -> LogConfig {
    let mut log = config.logging.clone();
    if let Some(level) = &cli.log_level {
        log.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        log.format = format.into();
    }
    log
}

async fn dispatch(command: Commands, config: Config, format: OutputFormat) -> Result<()> {
    match command {
        Commands::Bootstrap => bootstrap(config, format).await,
        Commands::Ingest(args) => ingest(args, config, format).await,
        Commands::Run(args) => serve(args, config, format).await,
        Commands::Queue(command) => queue_command(command, config, format).await,
        Commands::Config(command) => config_command(&command, &config, format),
    }
}

fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => println!("{}", text(value)),
    }
    Ok(())
}

// =============================================================================
// bootstrap
// =============================================================================

#[derive(Debug, Serialize)]
struct BootstrapSummary {
    alias: String,
    write_index: Option<String>,
}

async fn bootstrap(config: Config, format: OutputFormat) -> Result<()> {
    let tm = Taskmill::from_config(config)?;
    let alias = tm.start().await?;
    let summary = BootstrapSummary {
        write_index: tm.lifecycle().current_index(&alias),
        alias,
    };
    tm.close().await?;
    emit(format, &summary, |s| {
        format!(
            "Alias {} ready (write index: {})",
            s.alias,
            s.write_index.as_deref().unwrap_or("unresolved")
        )
    })
}

// =============================================================================
// ingest / run
// =============================================================================

#[derive(Debug, Default, Serialize)]
struct IngestSummary {
    alias: String,
    events: usize,
    invalid_lines: usize,
    operations: usize,
    failed_operations: usize,
    retry_queue: usize,
    persistence: PersistenceStats,
}

impl IngestSummary {
    fn record(&mut self, report: &IndexReport) {
        self.operations += report.operations;
        self.failed_operations += report.failed_operations;
    }

    fn render(&self) -> String {
        let mut out = format!(
            "Ingested {} events into {} ({} operations, {} failed)",
            self.events, self.alias, self.operations, self.failed_operations
        );
        if self.invalid_lines > 0 {
            out.push_str(&format!("\nSkipped {} invalid lines", self.invalid_lines));
        }
        if self.retry_queue > 0 || self.persistence.persisted > 0 {
            out.push_str(&format!(
                "\nRetry queue: {} batches, persisted to failure queue: {}",
                self.retry_queue, self.persistence.persisted
            ));
        }
        out
    }
}

async fn open_input(path: &Path) -> Result<InputLines> {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if path == Path::new("-") {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        Box::new(BufReader::new(file))
    };
    Ok(reader.lines())
}

/// Parse one input line. Blank lines yield `None`; malformed lines are
/// counted and skipped unless `strict`.
fn parse_event(
    line: &str,
    line_no: usize,
    strict: bool,
    summary: &mut IngestSummary,
) -> Result<Option<Event>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<Event>(line) {
        Ok(event) => Ok(Some(event)),
        Err(e) if strict => bail!("line {line_no}: invalid event: {e}"),
        Err(e) => {
            warn!(line = line_no, error = %e, "Skipping invalid event");
            summary.invalid_lines += 1;
            Ok(None)
        }
    }
}

async fn ingest_and_flush(
    tm: &Taskmill,
    events: Vec<Event>,
    summary: &mut IngestSummary,
) -> Result<()> {
    if !events.is_empty() {
        summary.events += events.len();
        tm.ingest().ingest_batch(events).await;
    }
    let report = tm.ingest().flush().await?;
    summary.record(&report);
    Ok(())
}

/// Push anything still in the retry queue through its remaining memory
/// rounds so it reaches the failure queue before exit.
async fn settle_retries(tm: &Taskmill, summary: &mut IngestSummary) -> Result<()> {
    for _ in 0..tm.config().indexing.max_retries {
        if tm.indexer().retry_queue_len() == 0 {
            break;
        }
        tm.indexer().retry_failed_from_memory().await?;
    }
    summary.retry_queue = tm.indexer().retry_queue_len();
    summary.persistence = tm.indexer().persistence_stats();
    Ok(())
}

async fn ingest(args: IngestArgs, config: Config, format: OutputFormat) -> Result<()> {
    let mut lines = open_input(&args.input).await?;
    let tm = Taskmill::from_config(config)?;
    let mut summary = IngestSummary::default();

    let outcome = ingest_lines(&tm, &mut lines, &args, &mut summary).await;
    let closed = tm.close().await;
    outcome?;
    closed?;

    emit(format, &summary, IngestSummary::render)
}

async fn ingest_lines(
    tm: &Taskmill,
    lines: &mut InputLines,
    args: &IngestArgs,
    summary: &mut IngestSummary,
) -> Result<()> {
    summary.alias = tm.start().await?;
    let batch_size = args.batch_size.max(1);
    let mut pending = Vec::with_capacity(batch_size);
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await.context("failed to read input")? {
        line_no += 1;
        if let Some(event) = parse_event(&line, line_no, args.strict, summary)? {
            pending.push(event);
        }
        if pending.len() >= batch_size {
            ingest_and_flush(tm, std::mem::take(&mut pending), summary).await?;
        }
    }
    ingest_and_flush(tm, pending, summary).await?;
    settle_retries(tm, summary).await
}

async fn serve(args: RunArgs, config: Config, format: OutputFormat) -> Result<()> {
    let tm = Taskmill::from_config(config)?;
    let mut summary = IngestSummary::default();
    summary.alias = match tm.start().await {
        Ok(alias) => alias,
        Err(e) => {
            if let Err(close) = tm.close().await {
                warn!(error = %close, "Failed to release resources after startup error");
            }
            return Err(e.into());
        }
    };

    let maintenance = tm.spawn_maintenance();
    let outcome = serve_lines(&tm, &args, &mut summary).await;
    summary.retry_queue = tm.indexer().retry_queue_len();
    summary.persistence = tm.indexer().persistence_stats();
    // Shutdown also closes the indexer and the failure queue.
    let stopped = maintenance.shutdown().await;
    outcome?;
    stopped?;

    emit(format, &summary, IngestSummary::render)
}

async fn serve_lines(tm: &Taskmill, args: &RunArgs, summary: &mut IngestSummary) -> Result<()> {
    let mut lines = open_input(Path::new("-")).await?;
    let batch_size = args.batch_size.max(1);

    let mut flush = tokio::time::interval(Duration::from_millis(args.flush_interval_ms.max(1)));
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut pending = Vec::with_capacity(batch_size);
    let mut line_no = 0usize;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                line_no += 1;
                if let Some(event) = parse_event(&line, line_no, false, summary)? {
                    pending.push(event);
                }
                if pending.len() >= batch_size {
                    ingest_and_flush(tm, std::mem::take(&mut pending), summary).await?;
                }
            }
            _ = flush.tick() => {
                ingest_and_flush(tm, std::mem::take(&mut pending), summary).await?;
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, flushing pending events");
                break;
            }
        }
    }

    ingest_and_flush(tm, pending, summary).await
}

// =============================================================================
// queue
// =============================================================================

#[derive(Debug, Serialize)]
struct QueueStatus {
    path: PathBuf,
    enabled: bool,
    healthy: bool,
    pending: u64,
    oldest_insert_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct DrainSummary {
    rounds: usize,
    remaining: u64,
    persistence: PersistenceStats,
}

fn with_queue<T, F>(config: &Config, f: F) -> taskmill_core::Result<T>
where
    F: FnOnce(&FailureQueue) -> taskmill_core::Result<T>,
{
    let queue = FailureQueue::open(FailureQueueConfig::from(config))?;
    let result = f(&queue);
    queue.close()?;
    result
}

async fn queue_command(command: QueueCommand, config: Config, format: OutputFormat) -> Result<()> {
    match command {
        QueueCommand::Status => {
            let status = tokio::task::spawn_blocking(move || {
                with_queue(&config, |queue| {
                    Ok(QueueStatus {
                        path: queue.path().to_path_buf(),
                        enabled: config.persistence.enabled,
                        healthy: queue.health_check().is_ok(),
                        pending: queue.failed_bulks_amount()?,
                        oldest_insert_time: queue
                            .peek_failed_bulks()?
                            .first()
                            .and_then(|b| b.insert_time),
                    })
                })
            })
            .await
            .context("queue status task failed")??;
            emit(format, &status, |s| {
                let mut out = format!(
                    "Failure queue: {}\nPending batches: {}\nHealthy: {}",
                    s.path.display(),
                    s.pending,
                    if s.healthy { "yes" } else { "no" }
                );
                if !s.enabled {
                    out.push_str("\nPersistence is disabled in the config");
                }
                if let Some(oldest) = s.oldest_insert_time {
                    out.push_str(&format!("\nOldest batch: {}", oldest.to_rfc3339()));
                }
                out
            })
        }
        QueueCommand::Drain => {
            if !config.persistence.enabled {
                bail!("persistence is disabled; there is no failure queue to drain");
            }
            let tm = Taskmill::from_config(config)?;
            let drained = drain_queue(&tm).await;
            let closed = tm.close().await;
            let summary = drained?;
            closed?;
            emit(format, &summary, |s| {
                format!(
                    "Redelivered {} batches in {} rounds, {} still pending",
                    s.persistence.redelivered_from_disk, s.rounds, s.remaining
                )
            })
        }
        QueueCommand::Reset { yes } => {
            if !yes {
                bail!("refusing to delete stored batches without --yes");
            }
            let path = tokio::task::spawn_blocking(move || {
                with_queue(&config, |queue| {
                    queue.reset()?;
                    Ok(queue.path().to_path_buf())
                })
            })
            .await
            .context("queue reset task failed")??;
            info!(path = %path.display(), "Failure queue reset");
            emit(format, &serde_json::json!({ "reset": true, "path": path }), |_| {
                format!("Failure queue at {} reset", path.display())
            })
        }
    }
}

async fn drain_queue(tm: &Taskmill) -> Result<DrainSummary> {
    tm.start().await?;
    let mut rounds = 0usize;
    while tm.indexer().retry_failed_from_disk().await? {
        rounds += 1;
    }
    let remaining = match tm.indexer().failure_queue() {
        Some(queue) => queue.failed_bulks_amount()?,
        None => 0,
    };
    Ok(DrainSummary {
        rounds,
        remaining,
        persistence: tm.indexer().persistence_stats(),
    })
}

// =============================================================================
// config
// =============================================================================

fn config_command(command: &ConfigCommand, config: &Config, format: OutputFormat) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let mut shown = config.clone();
            if shown.backend.password.is_some() {
                shown.backend.password = Some("********".to_string());
            }
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&shown)?),
                OutputFormat::Text => print!("{}", shown.to_toml_string()?),
            }
            Ok(())
        }
        ConfigCommand::Check => {
            config.validate()?;
            emit(
                format,
                &serde_json::json!({ "valid": true, "alias": config.alias_name() }),
                |_| format!("Config OK (write alias: {})", config.alias_name()),
            )
        }
    }
}
