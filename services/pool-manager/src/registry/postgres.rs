//! Postgres-backed worker registry.
//!
//! Workers are rows in `workers(id, status, created_at, updated_at)`.
//! Every operation is a direct round-trip; there is no change feed, so
//! [`WorkerRegistry::on_change`] is a no-op and the pool is only
//! re-evaluated on startup and on scheduled resyncs.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mc_id::WorkerId;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use super::{
    cancellable, ChangeNotify, RegistryError, RegistryResult, Worker, WorkerRegistry,
    WorkerStatus,
};
use crate::shutdown::Shutdown;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/musicalchairs".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Configuration for the given connection string with default pool sizing.
    pub fn for_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }
}

/// Worker registry backed by a Postgres table.
#[derive(Clone)]
pub struct PostgresRegistry {
    pool: PgPool,
}

impl PostgresRegistry {
    /// Create a connection pool and verify the database is reachable.
    pub async fn connect(config: &DbConfig) -> RegistryResult<Self> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    /// Run pending migrations.
    ///
    /// Migrations are loaded at runtime from the first directory that exists.
    pub async fn run_migrations(&self) -> RegistryResult<()> {
        let candidates = vec![
            PathBuf::from("./migrations"),
            PathBuf::from("services/pool-manager/migrations"),
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Running database migrations");
                    migrator
                        .run(&self.pool)
                        .await
                        .map_err(|e| RegistryError::Backend(format!("migration failed: {e}")))?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(RegistryError::Backend(format!(
            "migration directory not found; tried {tried}. Last error: {}",
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string())
        )))
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl WorkerRegistry for PostgresRegistry {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn list_by_status(
        &self,
        cancel: &Shutdown,
        status: WorkerStatus,
    ) -> RegistryResult<Vec<Worker>> {
        cancellable(cancel, async {
            let rows = sqlx::query_as::<_, WorkerRow>(
                r#"
                SELECT id, status, created_at
                FROM workers
                WHERE status = $1
                "#,
            )
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

            let mut workers = Vec::with_capacity(rows.len());
            for row in rows {
                match row.into_worker() {
                    Ok(worker) => workers.push(worker),
                    Err(e) => warn!(error = %e, "Skipping unreadable worker row"),
                }
            }
            Ok(workers)
        })
        .await
    }

    async fn create(&self, cancel: &Shutdown, id: &WorkerId) -> RegistryResult<()> {
        cancellable(cancel, async {
            debug!(worker_id = %id, "Inserting worker record");
            sqlx::query(
                r#"
                INSERT INTO workers (id, status, created_at, updated_at)
                VALUES ($1, $2, now(), now())
                "#,
            )
            .bind(id.as_str())
            .bind(WorkerStatus::Waiting.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    RegistryError::AlreadyExists(id.clone())
                } else {
                    RegistryError::from(e)
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn update_status(
        &self,
        cancel: &Shutdown,
        id: &WorkerId,
        status: WorkerStatus,
    ) -> RegistryResult<()> {
        cancellable(cancel, async {
            let result = sqlx::query(
                r#"
                UPDATE workers
                SET status = $2, updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(id.as_str())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(RegistryError::NotFound(id.clone()));
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, cancel: &Shutdown, id: &WorkerId) -> RegistryResult<()> {
        cancellable(cancel, async {
            let result = sqlx::query("DELETE FROM workers WHERE id = $1")
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;

            if result.rows_affected() == 0 {
                return Err(RegistryError::NotFound(id.clone()));
            }
            Ok(())
        })
        .await
    }

    fn on_change(&self, _notify: ChangeNotify) {
        debug!("Postgres registry has no change feed; relying on explicit triggers");
    }

    async fn health_check(&self, cancel: &Shutdown) -> RegistryResult<()> {
        cancellable(cancel, async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(Debug)]
struct WorkerRow {
    id: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl WorkerRow {
    fn into_worker(self) -> Result<Worker, String> {
        let id = WorkerId::parse(&self.id).map_err(|e| format!("{}: {e}", self.id))?;
        let status = self.status.parse()?;
        Ok(Worker {
            id,
            status,
            created_at: Some(self.created_at),
        })
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for WorkerRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
