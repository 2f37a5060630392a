//! PostgreSQL access layer.
//!
//! One [`Db`] per connection; workers open their own. All bulk loads go
//! through `COPY ... FROM STDIN` in CSV form, the fastest path the server
//! offers. The stored procedures `put_lock`/`remove_lock` provide the
//! database-level logical lock; the watermark setter enforces monotonicity
//! server-side with `GREATEST`.

use std::path::Path;

use chrono::{DateTime, Utc};
use futures_util::SinkExt;
use tokio::io::AsyncReadExt;
use tokio_postgres::NoTls;
use tokio_postgres::error::SqlState;

use crate::error::IngestError;
use crate::schema::DdlScript;

/// Outcome of the base-tables check. Anything that is not a clean answer
/// (connection refused, permission denied) is an error, never `Missing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TablesState {
    Present,
    Missing,
}

/// A live database connection.
pub struct Db {
    pub client: tokio_postgres::Client,
}

impl Db {
    /// Connect and drive the connection on a background task.
    pub async fn connect(url: &str) -> Result<Self, IngestError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("postgres connection error: {e}");
            }
        });
        Ok(Db { client })
    }

    /// Execute one shipped DDL script.
    pub async fn run_script(&self, script: DdlScript) -> Result<(), IngestError> {
        tracing::debug!("executing {}", script.name());
        self.client.batch_execute(script.sql()).await?;
        Ok(())
    }

    /// Execute arbitrary SQL (partition DDL with substituted numbers).
    pub async fn batch(&self, sql: &str) -> Result<(), IngestError> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    /// Whether the main tables and the watermark table exist.
    ///
    /// Only a successful query may answer `Missing`; a failed one is
    /// [`IngestError::AmbiguousTablesState`] so base mode is never chosen on
    /// a connection hiccup.
    pub async fn base_tables_state(&self) -> Result<TablesState, IngestError> {
        let row = self
            .client
            .query_one(
                "SELECT to_regclass('notes') IS NOT NULL
                    AND to_regclass('note_comments') IS NOT NULL
                    AND to_regclass('note_comments_text') IS NOT NULL
                    AND to_regclass('max_note_timestamp') IS NOT NULL",
                &[],
            )
            .await
            .map_err(|e| IngestError::AmbiguousTablesState(e.to_string()))?;
        let present: bool = row.get(0);
        Ok(if present {
            TablesState::Present
        } else {
            TablesState::Missing
        })
    }

    // ── Watermark ─────────────────────────────────────────────────────────

    /// Current watermark, `None` when the row does not exist yet.
    pub async fn watermark(&self) -> Result<Option<DateTime<Utc>>, IngestError> {
        let row = self
            .client
            .query_opt("SELECT ts FROM max_note_timestamp WHERE id = 1", &[])
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Advance the watermark. `GREATEST` keeps it monotonic even if a caller
    /// hands in an older instant.
    pub async fn set_watermark(&self, ts: DateTime<Utc>) -> Result<(), IngestError> {
        self.client
            .execute(
                "INSERT INTO max_note_timestamp (id, ts) VALUES (1, $1)
                 ON CONFLICT (id) DO UPDATE
                 SET ts = GREATEST(max_note_timestamp.ts, excluded.ts)",
                &[&ts],
            )
            .await?;
        Ok(())
    }

    // ── Logical lock ──────────────────────────────────────────────────────

    /// Take the database logical lock for `token`. Contention surfaces as
    /// [`IngestError::LogicalLockBusy`].
    pub async fn put_lock(&self, token: &str) -> Result<(), IngestError> {
        match self.client.execute("CALL put_lock($1)", &[&token]).await {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) => {
                Err(IngestError::LogicalLockBusy(
                    e.as_db_error()
                        .map(|d| d.message().to_string())
                        .unwrap_or_else(|| e.to_string()),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_lock(&self, token: &str) -> Result<(), IngestError> {
        self.client.execute("CALL remove_lock($1)", &[&token]).await?;
        Ok(())
    }

    // ── Bulk copy ─────────────────────────────────────────────────────────

    /// Stream a CSV file into a table via `COPY`. `columns` is the column
    /// list matching the CSV field order. Returns rows loaded.
    pub async fn copy_csv(
        &self,
        table: &str,
        columns: &str,
        csv_path: &Path,
    ) -> Result<u64, IngestError> {
        let stmt = format!("COPY {table} ({columns}) FROM STDIN WITH (FORMAT csv)");
        let sink = self.client.copy_in::<_, bytes::Bytes>(&stmt).await?;
        futures_util::pin_mut!(sink);

        let mut file = tokio::fs::File::open(csv_path).await?;
        let mut chunk = vec![0u8; 1 << 16];
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            sink.send(bytes::Bytes::copy_from_slice(&chunk[..n])).await?;
        }
        let rows = sink.finish().await?;
        Ok(rows)
    }

    // ── Maintenance ───────────────────────────────────────────────────────

    pub async fn analyze(&self, tables: &[&str]) -> Result<(), IngestError> {
        for t in tables {
            self.client.batch_execute(&format!("ANALYZE {t}")).await?;
        }
        Ok(())
    }

    pub async fn vacuum_analyze(&self, tables: &[&str]) -> Result<(), IngestError> {
        for t in tables {
            self.client
                .batch_execute(&format!("VACUUM ANALYZE {t}"))
                .await?;
        }
        Ok(())
    }

    pub async fn truncate(&self, tables: &[&str]) -> Result<(), IngestError> {
        if tables.is_empty() {
            return Ok(());
        }
        self.client
            .batch_execute(&format!("TRUNCATE {}", tables.join(", ")))
            .await?;
        Ok(())
    }
}
