use crate::error::Result;
use crate::models::SessionSummary;
use crate::traits::StatsStore;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{debug, info};

pub struct Database {
    pub pool: SqlitePool,
}

/// Totals over every recorded page session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct LifetimeTotals {
    pub sessions: i64,
    pub detected: i64,
    pub upscaled: i64,
    pub failed: i64,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to database: {}", database_url);

        if let Some(path) = database_url.strip_prefix("sqlite:") {
            let path = std::path::Path::new(path.trim_start_matches("//"));
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    debug!("Creating directory: {:?}", parent);
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        info!("Database connected successfully");
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        info!("Initializing database schema...");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                page_url TEXT NOT NULL,
                site TEXT NOT NULL,
                total_detected INTEGER NOT NULL DEFAULT 0,
                total_upscaled INTEGER NOT NULL DEFAULT 0,
                total_failed INTEGER NOT NULL DEFAULT 0,
                average_ms INTEGER,
                started_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions (updated_at)")
            .execute(&self.pool)
            .await?;

        info!("Database schema initialized successfully");
        Ok(())
    }

    /// Inserts the session row, or refreshes it when the queue drains again.
    pub async fn upsert_session(&self, summary: &SessionSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, page_url, site, total_detected, total_upscaled, total_failed,
                                  average_ms, started_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                total_detected = excluded.total_detected,
                total_upscaled = excluded.total_upscaled,
                total_failed = excluded.total_failed,
                average_ms = excluded.average_ms,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&summary.id)
        .bind(&summary.page_url)
        .bind(&summary.site)
        .bind(summary.total_detected)
        .bind(summary.total_upscaled)
        .bind(summary.total_failed)
        .bind(summary.average_ms)
        .bind(summary.started_at)
        .bind(summary.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn recent_sessions(&self, limit: i64) -> Result<Vec<SessionSummary>> {
        let sessions = sqlx::query_as::<_, SessionSummary>(
            "SELECT * FROM sessions ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(sessions)
    }

    pub async fn lifetime_totals(&self) -> Result<LifetimeTotals> {
        let totals = sqlx::query_as::<_, LifetimeTotals>(
            r#"
            SELECT COUNT(*) AS sessions,
                   COALESCE(SUM(total_detected), 0) AS detected,
                   COALESCE(SUM(total_upscaled), 0) AS upscaled,
                   COALESCE(SUM(total_failed), 0) AS failed
            FROM sessions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(totals)
    }
}

#[async_trait::async_trait]
impl StatsStore for Database {
    async fn record_session(&self, summary: &SessionSummary) -> Result<()> {
        self.upsert_session(summary).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PageStats;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn database(dir: &TempDir) -> Database {
        let url = format!("sqlite:{}", dir.path().join("nested/mangalift.db").display());
        let db = Database::new(&url, 2).await.unwrap();
        db.init().await.unwrap();
        db
    }

    #[tokio::test]
    async fn drain_twice_updates_one_row() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir).await;
        let session_id = Uuid::new_v4();
        let mut stats = PageStats::new();
        stats.total_detected = 4;
        stats.record_success(Duration::from_millis(800));

        let first = SessionSummary::from_stats(session_id, "https://reader.example/c/1", "Generic", &stats);
        db.record_session(&first).await.unwrap();

        stats.record_success(Duration::from_millis(1200));
        stats.total_failed = 1;
        let second = SessionSummary::from_stats(session_id, "https://reader.example/c/1", "Generic", &stats);
        db.record_session(&second).await.unwrap();

        let rows = db.recent_sessions(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, session_id.to_string());
        assert_eq!(rows[0].total_upscaled, 2);
        assert_eq!(rows[0].total_failed, 1);
        assert_eq!(rows[0].average_ms, Some(1000));
    }

    #[tokio::test]
    async fn lifetime_totals_sum_sessions() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir).await;
        assert_eq!(db.lifetime_totals().await.unwrap(), LifetimeTotals::default());

        for upscaled in [3u32, 5] {
            let mut stats = PageStats::new();
            stats.total_detected = upscaled + 1;
            stats.total_upscaled = upscaled;
            let summary = SessionSummary::from_stats(Uuid::new_v4(), "https://x/", "Webtoon", &stats);
            db.record_session(&summary).await.unwrap();
        }

        let totals = db.lifetime_totals().await.unwrap();
        assert_eq!(totals.sessions, 2);
        assert_eq!(totals.upscaled, 8);
        assert_eq!(totals.detected, 10);
    }
}
