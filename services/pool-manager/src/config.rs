//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use mc_reconcile::{PoolBounds, DEFAULT_SURGE_THRESHOLD, DEFAULT_TARGET_POOL_SIZE};
use thiserror::Error;

use crate::registry::kubernetes::DEFAULT_NAMESPACE;
use crate::registry::{
    DbConfig, KubernetesConfig, KubernetesRegistry, MemoryRegistry, PostgresRegistry,
    RegistryError, WorkerRegistry, WorkerTemplate,
};
use crate::shutdown::Shutdown;

/// musicalchairs - worker pool manager
#[derive(Debug, Parser)]
#[command(
    name = "musicalchairs",
    version,
    about = "Keep a defined number of workers ready to receive requests and manage task assignment"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server
    Run(RunArgs),
}

/// Flags for `musicalchairs run`.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Postgres connection string; selects the Postgres registry
    #[arg(short = 'c', long, env = "MC_CONNECTION_STRING")]
    pub connection_string: Option<String>,

    /// Keep workers in process memory (development only)
    #[arg(long, env = "MC_IN_MEMORY")]
    pub in_memory: bool,

    /// Number of workers to run
    #[arg(long, env = "MC_WORKER_COUNT", default_value_t = DEFAULT_TARGET_POOL_SIZE)]
    pub worker_count: u32,

    /// Number of additional workers (surge) that may be running
    #[arg(long, env = "MC_THRESHOLD", default_value_t = DEFAULT_SURGE_THRESHOLD)]
    pub threshold: u32,

    /// Address for the HTTP server
    #[arg(long, env = "MC_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Namespace holding worker pods
    #[arg(long, env = "MC_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Container image for worker pods
    #[arg(long, env = "MC_WORKER_IMAGE", default_value = "alpine")]
    pub worker_image: String,

    /// Entry command for worker pods, split on whitespace
    #[arg(long, env = "MC_WORKER_COMMAND", default_value = "sleep 3000")]
    pub worker_command: String,

    /// Seconds between periodic reconcile passes (0 disables)
    #[arg(long, env = "MC_RESYNC_INTERVAL_SECS", default_value_t = 0)]
    pub resync_interval_secs: u64,

    /// Log level when RUST_LOG is unset
    #[arg(long, env = "MC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Maximum Postgres connections
    #[arg(long, env = "MC_DB_MAX_CONNECTIONS", default_value_t = 10)]
    pub db_max_connections: u32,

    /// Apply Postgres migrations at startup
    #[arg(long, env = "MC_RUN_MIGRATIONS")]
    pub run_migrations: bool,
}

/// Startup configuration errors. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address '{value}': {source}")]
    InvalidListenAddr {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("--in-memory and --connection-string are mutually exclusive")]
    ConflictingBackends,

    #[error("connection string cannot be empty")]
    EmptyConnectionString,

    #[error("worker image cannot be empty")]
    EmptyWorkerImage,

    #[error("failed to initialize {backend} registry: {source}")]
    Backend {
        backend: &'static str,
        #[source]
        source: RegistryError,
    },
}

/// Which registry backend to run against.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Pods in a namespace, using ambient cluster credentials.
    Kubernetes(KubernetesConfig),

    /// Rows in a Postgres table.
    Postgres { db: DbConfig, run_migrations: bool },

    /// Process memory.
    Memory,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Kubernetes(_) => "kubernetes",
            Self::Postgres { .. } => "postgres",
            Self::Memory => "memory",
        }
    }

    /// Open the selected registry. Any failure here is fatal to startup.
    pub async fn connect(&self, shutdown: Shutdown) -> Result<Arc<dyn WorkerRegistry>, ConfigError> {
        let backend = self.name();
        let fail = |source: RegistryError| ConfigError::Backend { backend, source };

        let registry: Arc<dyn WorkerRegistry> = match self {
            Self::Kubernetes(config) => Arc::new(
                KubernetesRegistry::connect(config.clone(), shutdown)
                    .await
                    .map_err(fail)?,
            ),
            Self::Postgres { db, run_migrations } => {
                let registry = PostgresRegistry::connect(db).await.map_err(fail)?;
                if *run_migrations {
                    tracing::info!("Running database migrations");
                    registry.run_migrations().await.map_err(fail)?;
                }
                Arc::new(registry)
            }
            Self::Memory => {
                tracing::warn!("Using in-memory registry; workers are not persisted");
                Arc::new(MemoryRegistry::new())
            }
        };
        Ok(registry)
    }
}

/// Validated service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub bounds: PoolBounds,
    pub backend: Backend,
    pub resync_interval: Option<Duration>,
}

impl Config {
    /// Validate parsed flags into a configuration.
    pub fn from_args(args: RunArgs) -> Result<Self, ConfigError> {
        let listen_addr =
            args.listen_addr
                .parse()
                .map_err(|source| ConfigError::InvalidListenAddr {
                    value: args.listen_addr.clone(),
                    source,
                })?;

        let backend = match (args.in_memory, args.connection_string) {
            (true, Some(_)) => return Err(ConfigError::ConflictingBackends),
            (true, None) => Backend::Memory,
            (false, Some(url)) => {
                if url.trim().is_empty() {
                    return Err(ConfigError::EmptyConnectionString);
                }
                Backend::Postgres {
                    db: DbConfig {
                        max_connections: args.db_max_connections,
                        ..DbConfig::for_url(url.trim())
                    },
                    run_migrations: args.run_migrations,
                }
            }
            (false, None) => {
                if args.worker_image.trim().is_empty() {
                    return Err(ConfigError::EmptyWorkerImage);
                }
                Backend::Kubernetes(KubernetesConfig {
                    namespace: args.namespace,
                    template: WorkerTemplate {
                        image: args.worker_image.trim().to_string(),
                        command: args
                            .worker_command
                            .split_whitespace()
                            .map(str::to_string)
                            .collect(),
                    },
                    ..KubernetesConfig::default()
                })
            }
        };

        let resync_interval =
            (args.resync_interval_secs > 0).then(|| Duration::from_secs(args.resync_interval_secs));

        Ok(Self {
            listen_addr,
            log_level: args.log_level,
            bounds: PoolBounds::new(args.worker_count, args.threshold),
            backend,
            resync_interval,
        })
    }
}
