use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;

/// Session and token store backing. One SQLite file under the data home.
#[derive(Debug, Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
}

impl Database {
    /// Create an in-memory SQLite database for tests, with migrations applied.
    #[cfg(test)]
    pub async fn test_db() -> Self {
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("valid memory URL")
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // critical: multiple connections to :memory: get separate DBs
            .connect_with(options)
            .await
            .expect("connect to in-memory SQLite");

        let db = Self { pool };
        db.migrate().await.expect("run migrations");
        db
    }

    /// Open the store at `path`, creating the file if missing.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open session store at {}", path.display()))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }
}
