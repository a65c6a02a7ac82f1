//! Database pool creation.
//!
//! Compile-time database selection via feature flags, same idiom as the teacher: concrete
//! pool types instead of `sqlx::AnyPool` so `#[derive(FromRow)]`/typed binds work with
//! chrono and uuid columns.
//!
//! # Feature priority
//!
//! - `sqlite` feature (default): uses `SqlitePool`
//! - `postgres` feature (sqlite disabled): uses `PgPool`

use std::borrow::Cow;

use moonmind_core::error::{Error, Result};
use tracing::info;

/// Database pool type alias, resolved by compiled feature.
#[cfg(feature = "sqlite")]
pub type DbPool = sqlx::SqlitePool;

#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub type DbPool = sqlx::PgPool;

/// The `sqlx::Database` impl backing [`DbPool`], for call sites that need to name a
/// `Transaction<'_, DbBackend>` explicitly.
#[cfg(feature = "sqlite")]
pub type DbBackend = sqlx::Sqlite;

#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub type DbBackend = sqlx::Postgres;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    Sqlite,
    Postgres,
}

impl DatabaseType {
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("sqlite:") {
            return Some(Self::Sqlite);
        }
        if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            return Some(Self::Postgres);
        }
        None
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite => "SQLite",
            Self::Postgres => "PostgreSQL",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub db_type: DatabaseType,
    pub max_connections: u32,
}

impl DbConfig {
    #[cfg(feature = "sqlite")]
    pub fn sqlite(path: impl AsRef<str>) -> Self {
        Self {
            url: format!("sqlite:{}?mode=rwc", path.as_ref()),
            db_type: DatabaseType::Sqlite,
            max_connections: 5,
        }
    }

    #[cfg(feature = "sqlite")]
    pub fn sqlite_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            db_type: DatabaseType::Sqlite,
            max_connections: 1,
        }
    }

    #[cfg(all(feature = "postgres", not(feature = "sqlite")))]
    pub fn postgres(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            db_type: DatabaseType::Postgres,
            max_connections: 10,
        }
    }

    pub fn from_url(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let db_type = DatabaseType::from_url(&url)
            .ok_or_else(|| Error::validation(format!("unrecognized database URL '{url}'")))?;
        let max_connections = match db_type {
            DatabaseType::Sqlite => 5,
            DatabaseType::Postgres => 10,
        };
        Ok(Self {
            url,
            db_type,
            max_connections,
        })
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Create a database pool from configuration, applying sqlite's WAL pragmas when
/// that's the compiled backend.
pub async fn create_pool(config: DbConfig) -> Result<DbPool> {
    #[cfg(feature = "sqlite")]
    {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        apply_sqlite_optimizations(&pool).await?;
        info!("connected to {} database", config.db_type);
        return Ok(pool);
    }

    #[cfg(all(feature = "postgres", not(feature = "sqlite")))]
    {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
        info!("connected to {} database", config.db_type);
        return Ok(pool);
    }

    #[allow(unreachable_code)]
    Err(Error::Internal(anyhow::anyhow!(
        "neither sqlite nor postgres feature compiled in"
    )))
}

#[cfg(feature = "sqlite")]
async fn apply_sqlite_optimizations(pool: &DbPool) -> Result<()> {
    sqlx::query("PRAGMA journal_mode=WAL")
        .execute(pool)
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
    sqlx::query("PRAGMA synchronous=NORMAL")
        .execute(pool)
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
    sqlx::query("PRAGMA foreign_keys=ON")
        .execute(pool)
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?;
    Ok(())
}

/// Rewrite `?` placeholders to `$1, $2, ...` for postgres; passthrough for sqlite.
/// The repository writes every query in sqlite's `?` form and runs it through this
/// single seam, so the SQL text itself never forks per backend.
pub fn bindable(sql: &str) -> Cow<'_, str> {
    #[cfg(all(feature = "postgres", not(feature = "sqlite")))]
    {
        let mut out = String::with_capacity(sql.len() + 8);
        let mut n = 0usize;
        for ch in sql.chars() {
            if ch == '?' {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            } else {
                out.push(ch);
            }
        }
        return Cow::Owned(out);
    }
    #[cfg(feature = "sqlite")]
    {
        return Cow::Borrowed(sql);
    }
    #[allow(unreachable_code)]
    Cow::Borrowed(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(feature = "sqlite")]
    async fn sqlite_memory_pool_connects() {
        let pool = create_pool(DbConfig::sqlite_memory()).await;
        assert!(pool.is_ok());
    }
}
