use std::path::PathBuf;
use std::str::FromStr;

use dive_core::error::CoreError;

/// Engine configuration loaded from environment variables.
///
/// All fields except the database URL have defaults suitable for local
/// development.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    /// Pool size (default: `20`).
    pub db_max_connections: u32,
    /// Root directory of the local blob store (default: `./data/blobs`).
    pub blob_root: PathBuf,
    /// Concurrent mask decodes during reconciliation (default: `8`).
    pub reconcile_concurrency: usize,
    /// Page size used when a caller passes no limit (default: `1000`).
    pub default_page_limit: i64,
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default        |
    /// |-------------------------|----------------|
    /// | `DATABASE_URL`          | (required)     |
    /// | `DB_MAX_CONNECTIONS`    | `20`           |
    /// | `BLOB_ROOT`             | `./data/blobs` |
    /// | `RECONCILE_CONCURRENCY` | `8`            |
    /// | `DEFAULT_PAGE_LIMIT`    | `1000`         |
    pub fn from_env() -> Result<Self, CoreError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| CoreError::Validation("DATABASE_URL must be set".into()))?;

        let db_max_connections: u32 = parse_var("DB_MAX_CONNECTIONS", "20")?;
        let blob_root = PathBuf::from(
            std::env::var("BLOB_ROOT").unwrap_or_else(|_| "./data/blobs".into()),
        );
        let reconcile_concurrency: usize = parse_var("RECONCILE_CONCURRENCY", "8")?;
        let default_page_limit: i64 = parse_var("DEFAULT_PAGE_LIMIT", "1000")?;

        if reconcile_concurrency == 0 {
            return Err(CoreError::Validation(
                "RECONCILE_CONCURRENCY must be at least 1".into(),
            ));
        }
        if default_page_limit <= 0 {
            return Err(CoreError::Validation(
                "DEFAULT_PAGE_LIMIT must be positive".into(),
            ));
        }

        Ok(Self {
            database_url,
            db_max_connections,
            blob_root,
            reconcile_concurrency,
            default_page_limit,
        })
    }

    /// Settings for an embedded engine with no database (memory backends).
    pub fn embedded(blob_root: impl Into<PathBuf>) -> Self {
        Self {
            database_url: String::new(),
            db_max_connections: 1,
            blob_root: blob_root.into(),
            reconcile_concurrency: 8,
            default_page_limit: 1000,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: &str) -> Result<T, CoreError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.into())
        .parse()
        .map_err(|_| CoreError::Validation(format!("{name} is not a valid value")))
}
