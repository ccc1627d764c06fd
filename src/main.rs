use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewarden::{
    Clock, CounterStore, LimitKey, LimitingService, MemoryStore, RatewardenConfig, RedisStore,
    StoreBackend, SystemClock,
};
use ratewarden::store::RedisStoreConfig;

/// Operator tool for the Ratewarden throttling engine.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run admission decisions and print one JSON line per decision
    Check {
        /// Client network address
        #[arg(long)]
        address: String,

        /// Access credential, if the request carries one
        #[arg(long, default_value = "")]
        credential: String,

        /// Number of consecutive decisions to run
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Clear the counter of an address or a credential
    Reset(ResetTarget),
    /// Check that the counter store is reachable
    Ping,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct ResetTarget {
    /// Address whose counter to clear
    #[arg(long)]
    address: Option<String>,

    /// Credential whose counter to clear
    #[arg(long)]
    credential: Option<String>,
}

/// One decision, as printed by `check`.
#[derive(Debug, Serialize)]
struct DecisionLine {
    admitted: bool,
    reset_time: Option<chrono::DateTime<chrono::Utc>>,
    error: Option<&'static str>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = RatewardenConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    info!(backend = ?config.store.backend, "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let store = connect_store(&config, clock.clone()).await?;

    let result = run(cli.command, &config, store.clone(), clock).await;
    store.close().await.context("failed to close counter store")?;
    result
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn connect_store(
    config: &RatewardenConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn CounterStore>> {
    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::with_clock(clock)),
        StoreBackend::Redis => {
            let redis_config = RedisStoreConfig {
                key_prefix: config.store.key_prefix.clone(),
            };
            let store = RedisStore::connect_with_config(&config.store.redis_url, redis_config, clock)
                .await
                .with_context(|| format!("failed to connect to {}", config.store.redis_url))?;
            Arc::new(store)
        }
    };

    tokio::time::timeout(config.limits.store_timeout(), store.ping())
        .await
        .context("counter store ping timed out")?
        .context("counter store ping failed")?;

    Ok(store)
}

async fn run(
    command: Command,
    config: &RatewardenConfig,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<()> {
    match command {
        Command::Ping => {
            println!("PONG");
            Ok(())
        }
        Command::Check {
            address,
            credential,
            repeat,
        } => {
            let service = LimitingService::new(config.limits.clone(), store, clock)?;
            for _ in 0..repeat {
                let line = match service.decide(&address, &credential).await {
                    Ok(admission) => DecisionLine {
                        admitted: true,
                        reset_time: admission.reset_time,
                        error: None,
                    },
                    Err(e) => DecisionLine {
                        admitted: false,
                        reset_time: e.reset_time(),
                        error: Some(e.kind()),
                    },
                };
                println!("{}", serde_json::to_string(&line)?);
            }
            Ok(())
        }
        Command::Reset(target) => {
            let service = LimitingService::new(config.limits.clone(), store, clock)?;
            let key = match (target.address, target.credential) {
                (Some(address), _) => LimitKey::address(address),
                (None, Some(credential)) => LimitKey::credential(credential),
                (None, None) => anyhow::bail!("either --address or --credential is required"),
            };
            service.reset(&key).await?;
            info!(class = key.class(), "Counter cleared");
            Ok(())
        }
    }
}
