use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use queue_core::config::QueueConfig;
use queue_core::executor::ShellExecutor;
use queue_core::job::{JobId, JobSpec, Priority, State};
use queue_core::metrics::InMemoryMetrics;
use queue_core::pool::WorkerPool;
use queue_core::queue::QueueService;
use queue_core::retry::RetryPolicy;
use queue_core::security::CommandFilter;
use queue_core::store::ListQuery;
use queue_postgres::PgJobStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "queue")]
#[command(about = "Persistent multi-worker background job queue")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a queue.toml config file; falls back to compiled defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a new job.
    Enqueue {
        command: String,
        #[arg(long, value_enum, default_value = "medium")]
        priority: PriorityArg,
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long, help = "timeout in seconds")]
        timeout_secs: Option<i64>,
        #[arg(long, help = "delay in seconds before the job becomes eligible")]
        delay_secs: Option<i64>,
    },
    /// Show one job by id.
    Show { id: Uuid },
    /// Queue-wide counts by state.
    Stats,
    /// List jobs in a given state (read-only over the store).
    List {
        #[arg(long, value_enum, default_value = "pending")]
        state: StateArg,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Dead-letter queue operations.
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
    /// Start a pool of workers and run until SIGINT/SIGTERM.
    Worker {
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
    /// Inspect or edit the file-layer configuration (the `QUEUE__`-prefixed
    /// environment layer always wins at runtime and is never written here).
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print one dotted-path key (e.g. `workers.max`) from the config file.
    Get { key: String },
    /// Write one dotted-path key into the config file.
    Set { key: String, value: String },
    /// Print the full config file, falling back to compiled-in defaults.
    List,
    /// Overwrite the config file with compiled-in defaults.
    Reset,
}

#[derive(Subcommand)]
enum DlqCommands {
    List {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    Retry {
        id: Uuid,
        #[arg(long)]
        reset_attempts: bool,
    },
    Purge {
        #[arg(long, help = "purge only entries older than this many days")]
        older_than_days: Option<i64>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum PriorityArg {
    Low,
    Medium,
    High,
    Critical,
}

impl From<PriorityArg> for Priority {
    fn from(p: PriorityArg) -> Self {
        match p {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::High => Priority::High,
            PriorityArg::Critical => Priority::Critical,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum StateArg {
    Pending,
    Scheduled,
    Processing,
    Completed,
    Dead,
    Cancelled,
}

impl From<StateArg> for State {
    fn from(s: StateArg) -> Self {
        match s {
            StateArg::Pending => State::Pending,
            StateArg::Scheduled => State::Scheduled,
            StateArg::Processing => State::Processing,
            StateArg::Completed => State::Completed,
            StateArg::Dead => State::Dead,
            StateArg::Cancelled => State::Cancelled,
        }
    }
}

/// Path to the config file the `config` subcommand reads/writes — the same
/// file `load_config` layers under the environment, resolved the same way.
fn config_file_path(path: &Option<PathBuf>) -> PathBuf {
    path.clone().unwrap_or_else(|| PathBuf::from("queue.toml"))
}

/// The file layer only — deliberately not merged with environment
/// overrides, so `config get`/`list` reflect what `config set` can actually
/// change.
fn read_file_config(path: &Path) -> Result<toml::Value> {
    match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text).context("parsing configuration file"),
        Err(_) => toml::Value::try_from(QueueConfig::default()).context("serializing default configuration"),
    }
}

fn write_file_config(path: &Path, value: &toml::Value) -> Result<()> {
    let _: QueueConfig = value
        .clone()
        .try_into()
        .context("value does not match the configuration schema")?;
    let text = toml::to_string_pretty(value).context("serializing configuration")?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

fn get_config_key<'a>(value: &'a toml::Value, key: &str) -> Option<&'a toml::Value> {
    let mut current = value;
    for part in key.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn set_config_key(value: &mut toml::Value, key: &str, new_value: toml::Value) -> Result<()> {
    let parts: Vec<&str> = key.split('.').collect();
    let (last, prefix) = parts.split_last().context("config key must not be empty")?;

    let mut current = value;
    for part in prefix {
        if !current.is_table() {
            *current = toml::Value::Table(Default::default());
        }
        current = current
            .as_table_mut()
            .expect("just normalized to a table")
            .entry(part.to_string())
            .or_insert_with(|| toml::Value::Table(Default::default()));
    }
    if !current.is_table() {
        *current = toml::Value::Table(Default::default());
    }
    current
        .as_table_mut()
        .expect("just normalized to a table")
        .insert(last.to_string(), new_value);
    Ok(())
}

/// Best-effort parse of a CLI-supplied value into a TOML scalar: bool, then
/// integer, then float, else a plain string.
fn parse_config_value(raw: &str) -> toml::Value {
    if let Ok(b) = raw.parse::<bool>() {
        toml::Value::Boolean(b)
    } else if let Ok(i) = raw.parse::<i64>() {
        toml::Value::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        toml::Value::Float(f)
    } else {
        toml::Value::String(raw.to_string())
    }
}

/// Layers, lowest to highest precedence: compiled-in defaults (via
/// `#[serde(default)]` on every `QueueConfig` field), an optional
/// `queue.toml`, then `QUEUE__`-prefixed environment variables.
fn load_config(path: Option<PathBuf>) -> Result<QueueConfig> {
    let file_source = match path {
        Some(path) => config::File::from(path).required(false),
        None => config::File::with_name("queue").required(false),
    };

    config::Config::builder()
        .add_source(file_source)
        .add_source(
            config::Environment::with_prefix("QUEUE")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("loading configuration")?
        .try_deserialize()
        .context("deserializing configuration")
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

async fn connect(cfg: &QueueConfig) -> Result<Arc<QueueService>> {
    let _ = cfg;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("connecting to postgres")?;
    let store = Arc::new(PgJobStore::new(pool));
    let retry_policy = RetryPolicy::new(
        chrono::Duration::from_std(cfg.retry.base_delay).unwrap_or(chrono::Duration::seconds(1)),
        chrono::Duration::from_std(cfg.retry.max_delay).unwrap_or(chrono::Duration::minutes(5)),
        cfg.retry.jitter,
    );
    let metrics = Arc::new(InMemoryMetrics::default());
    Ok(Arc::new(QueueService::new(store, retry_policy, metrics)))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone())?;

    match cli.command {
        Commands::Enqueue {
            command,
            priority,
            max_retries,
            timeout_secs,
            delay_secs,
        } => {
            let queue = connect(&cfg).await?;
            let mut spec = JobSpec::new(command)
                .priority(priority.into())
                .max_retries(max_retries.unwrap_or(cfg.retry.max_retries))
                .timeout(chrono::Duration::seconds(
                    timeout_secs.unwrap_or(cfg.jobs.default_timeout.as_secs() as i64),
                ));
            if let Some(delay) = delay_secs {
                spec = spec.run_at(chrono::Utc::now() + chrono::Duration::seconds(delay));
            }
            let job = queue.enqueue(spec).await?;
            println!("enqueued {} (state={})", job.id, job.state);
        }
        Commands::Show { id } => {
            let queue = connect(&cfg).await?;
            let job = queue.get(JobId(id)).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Stats => {
            let queue = connect(&cfg).await?;
            let stats = queue.stats().await?;
            println!(
                "pending={} scheduled={} processing={} completed={} dead={} cancelled={}",
                stats.pending, stats.scheduled, stats.processing, stats.completed, stats.dead, stats.cancelled
            );
        }
        Commands::List { state, limit, offset } => {
            let queue = connect(&cfg).await?;
            let jobs = queue.list(state.into(), ListQuery { limit, offset }).await?;
            for job in jobs {
                println!(
                    "{}  priority={:?}  state={}  attempts={}",
                    job.id, job.priority, job.state, job.attempts
                );
            }
        }
        Commands::Dlq { command } => match command {
            DlqCommands::List { limit } => {
                let queue = connect(&cfg).await?;
                let jobs = queue.dlq_list(limit).await?;
                for job in jobs {
                    println!(
                        "{}  attempts={}  reason={}",
                        job.id,
                        job.attempts,
                        job.error_message.as_deref().unwrap_or("")
                    );
                }
            }
            DlqCommands::Retry { id, reset_attempts } => {
                let queue = connect(&cfg).await?;
                let job = queue.dlq_retry(JobId(id), reset_attempts, None).await?;
                println!("requeued {} (state={})", job.id, job.state);
            }
            DlqCommands::Purge { older_than_days } => {
                let queue = connect(&cfg).await?;
                let purged = match older_than_days {
                    Some(days) => queue.dlq_purge_older_than(chrono::Duration::days(days)).await?,
                    None => queue.dlq_purge_all().await?,
                };
                println!("purged {purged} job(s)");
            }
        },
        Commands::Worker { count } => {
            if count == 0 {
                bail!("worker count must be at least 1");
            }
            let queue = connect(&cfg).await?;
            let recovered = queue.recover().await?;
            info!(recovered, "crash recovery complete");

            let executor = Arc::new(ShellExecutor::default());
            let filter = Arc::new(CommandFilter::default());
            let metrics = Arc::new(InMemoryMetrics::default());
            let pool = Arc::new(WorkerPool::new(
                queue.clone(),
                executor,
                filter,
                metrics,
                cfg.workers.poll_interval,
            ));
            pool.start(count);

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let sweeper_queue = queue.clone();
            tokio::spawn(sweeper_queue.run_sweepers(
                StdDuration::from_secs(10),
                StdDuration::from_secs(30),
                shutdown_rx,
            ));

            tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            pool.stop_graceful(cfg.workers.shutdown_timeout).await;
        }
        Commands::Config { command } => {
            let path = config_file_path(&cli.config);
            match command {
                ConfigCommands::Get { key } => {
                    let value = read_file_config(&path)?;
                    match get_config_key(&value, &key) {
                        Some(v) => println!("{v}"),
                        None => bail!("no such config key: {key}"),
                    }
                }
                ConfigCommands::Set { key, value } => {
                    let mut file_value = read_file_config(&path)?;
                    set_config_key(&mut file_value, &key, parse_config_value(&value))?;
                    write_file_config(&path, &file_value)?;
                    println!("set {key} = {value}");
                }
                ConfigCommands::List => {
                    let value = read_file_config(&path)?;
                    println!("{}", toml::to_string_pretty(&value)?);
                }
                ConfigCommands::Reset => {
                    let value = toml::Value::try_from(QueueConfig::default())?;
                    write_file_config(&path, &value)?;
                    println!("reset configuration to defaults at {}", path.display());
                }
            }
        }
    }

    Ok(())
}
