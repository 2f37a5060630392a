//! Parallel part loader.
//!
//! Each part file gets one worker: extract to CSV, create/truncate its
//! partition, then `COPY` the three streams inside one transaction. Workers
//! share nothing but the database and the log sink; the pool is bounded by
//! `MAX_THREADS` and fails fast — the first error aborts the remaining
//! workers and surfaces unchanged.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::db::Db;
use crate::error::IngestError;
use crate::extract::{XmlDialect, extract_to_csv};
use crate::schema::{sync_part_tables, sync_staging_part_sql};

/// Column lists matching the extractor's CSV field order.
pub const NOTES_COLUMNS: &str =
    "note_id, latitude, longitude, created_at, closed_at, status, updated_at";
pub const COMMENTS_COLUMNS: &str =
    "note_id, event, created_at, id_user, username, sequence_action";
pub const TEXT_COLUMNS: &str = "note_id, sequence_action, body";

/// Totals across all partitions of one load.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOutcome {
    pub parts: usize,
    pub notes: u64,
    pub comments: u64,
    pub texts: u64,
}

/// Load every part file into its matching sync staging partition.
///
/// Partition `i` receives part `i`; partitions are created (or truncated)
/// by the worker that owns them before the copy begins.
pub async fn load_parts(
    database_url: &str,
    part_files: &[PathBuf],
    max_threads: usize,
    temp_dir: &Path,
) -> Result<LoadOutcome, IngestError> {
    let permits = Arc::new(Semaphore::new(max_threads.max(1)));
    let mut pool: JoinSet<Result<(u64, u64, u64), IngestError>> = JoinSet::new();

    for (part, path) in part_files.iter().enumerate() {
        let permits = Arc::clone(&permits);
        let database_url = database_url.to_string();
        let path = path.clone();
        let temp_dir = temp_dir.to_path_buf();
        pool.spawn(
            async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| IngestError::Internal("worker pool closed".into()))?;
                load_one_part(&database_url, part, &path, &temp_dir).await
            }
            .instrument(tracing::info_span!("worker", part)),
        );
    }

    let mut outcome = LoadOutcome {
        parts: part_files.len(),
        ..LoadOutcome::default()
    };
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(Ok((n, c, t))) => {
                outcome.notes += n;
                outcome.comments += c;
                outcome.texts += t;
            }
            Ok(Err(e)) => {
                // First failure cancels the batch; wait for the rest to
                // observe the abort before surfacing.
                pool.abort_all();
                while pool.join_next().await.is_some() {}
                return Err(e);
            }
            Err(join_err) => {
                pool.abort_all();
                while pool.join_next().await.is_some() {}
                return Err(IngestError::Internal(format!("worker panicked: {join_err}")));
            }
        }
    }

    tracing::info!(
        "loaded {} parts: {} notes, {} comments, {} text rows",
        outcome.parts,
        outcome.notes,
        outcome.comments,
        outcome.texts
    );
    Ok(outcome)
}

/// One worker: extract, stage, copy.
async fn load_one_part(
    database_url: &str,
    part: usize,
    part_file: &Path,
    temp_dir: &Path,
) -> Result<(u64, u64, u64), IngestError> {
    // XML parsing and CSV writing are synchronous and CPU-bound.
    let (bundle, note_count) = {
        let input = part_file.to_path_buf();
        let out = temp_dir.to_path_buf();
        let stem = format!("part{part}");
        tokio::task::spawn_blocking(move || {
            extract_to_csv(&input, XmlDialect::Planet, &out, &stem)
        })
        .await
        .map_err(|e| IngestError::Internal(format!("extract task: {e}")))??
    };

    let mut db = Db::connect(database_url).await?;
    db.batch(&sync_staging_part_sql(part)).await?;

    let [notes_table, comments_table, text_table] = sync_part_tables(part);
    let tx = db.client.transaction().await?;
    let notes = copy_into_tx(&tx, &notes_table, NOTES_COLUMNS, &bundle.notes).await?;
    let comments = copy_into_tx(&tx, &comments_table, COMMENTS_COLUMNS, &bundle.comments).await?;
    let texts = copy_into_tx(&tx, &text_table, TEXT_COLUMNS, &bundle.texts).await?;
    tx.commit().await?;

    tracing::debug!("part {part}: {note_count} notes extracted, {notes} loaded");
    Ok((notes, comments, texts))
}

/// Stream a CSV file into a table within an open transaction.
pub async fn copy_into_tx(
    tx: &tokio_postgres::Transaction<'_>,
    table: &str,
    columns: &str,
    csv_path: &Path,
) -> Result<u64, IngestError> {
    use futures_util::SinkExt;
    use tokio::io::AsyncReadExt;

    let stmt = format!("COPY {table} ({columns}) FROM STDIN WITH (FORMAT csv)");
    let sink = tx.copy_in::<_, bytes::Bytes>(&stmt).await?;
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
    Ok(sink.finish().await?)
}
