//! Consolidation: staging → main tables.
//!
//! One logical unit per cycle, executed under the database logical lock:
//! dedup staging against main into filtered temp tables, upsert notes,
//! insert comments, insert text rows FK-safely, advance the watermark, then
//! analyze. The lock is released whatever happens in between; a post-cycle
//! gap check records notes that arrived without comments.
//!
//! Conflict policy: an incoming note wins only when strictly newer by
//! `updated_at`; an equal timestamp carries no news and keeps the stored row,
//! which is what makes a second run over the same staging a no-op.
//! Coordinates and `created_at` are immutable after insert. Comments never
//! conflict-update: `(note_id, sequence_action)` is append-only.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{GAP_THRESHOLD, GAP_WINDOW_DAYS};
use crate::db::Db;
use crate::error::{IngestError, RetrySpec, retry_fixed};
use crate::model::GapRecord;
use crate::schema::{API_STAGING_TABLES, sync_part_tables};

/// The staging relations feeding one consolidation.
#[derive(Debug, Clone)]
pub struct StagingSet {
    pub notes: Vec<String>,
    pub comments: Vec<String>,
    pub texts: Vec<String>,
}

impl StagingSet {
    /// The API staging tables (small-delta path).
    pub fn api() -> Self {
        Self {
            notes: vec![API_STAGING_TABLES[0].to_string()],
            comments: vec![API_STAGING_TABLES[1].to_string()],
            texts: vec![API_STAGING_TABLES[2].to_string()],
        }
    }

    /// The sync staging partitions 0..count (Planet path).
    pub fn sync_parts(count: usize) -> Self {
        let mut set = Self {
            notes: Vec::with_capacity(count),
            comments: Vec::with_capacity(count),
            texts: Vec::with_capacity(count),
        };
        for part in 0..count {
            let [n, c, t] = sync_part_tables(part);
            set.notes.push(n);
            set.comments.push(c);
            set.texts.push(t);
        }
        set
    }

    fn union(tables: &[String], cols: &str) -> String {
        tables
            .iter()
            .map(|t| format!("SELECT {cols} FROM {t}"))
            .collect::<Vec<_>>()
            .join(" UNION ALL ")
    }
}

/// What one consolidation did.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolidationOutcome {
    pub notes_upserted: u64,
    pub comments_inserted: u64,
    pub texts_inserted: u64,
    pub texts_dropped: u64,
    pub watermark: Option<DateTime<Utc>>,
}

/// Run one consolidation under the logical lock.
///
/// The lock token is unique per invocation so a stuck session is attributable.
/// Scoped release: `remove_lock` runs even when the merge fails partway.
pub async fn consolidate(
    db: &mut Db,
    staging: &StagingSet,
    retry: RetrySpec,
) -> Result<ConsolidationOutcome, IngestError> {
    let token = format!("notetide-{}-{}", std::process::id(), Uuid::new_v4());

    retry_fixed("put_lock", retry, || db.put_lock(&token)).await?;

    let merged = merge(db, staging).await;
    let unlocked = db.remove_lock(&token).await;

    let outcome = merged?;
    unlocked?;

    db.analyze(&["notes", "note_comments", "note_comments_text"])
        .await?;
    gap_check(db).await?;
    Ok(outcome)
}

/// The merge proper, one transaction: filtered temp tables live `ON COMMIT
/// DROP`, and the watermark update commits atomically with the upserts.
async fn merge(db: &mut Db, staging: &StagingSet) -> Result<ConsolidationOutcome, IngestError> {
    let tx = db.client.transaction().await?;

    // Step 1: dedup within staging, then against main. Within staging the
    // newest updated_at wins per note; comments and texts are unique per
    // (note_id, sequence_action).
    tx.batch_execute(&format!(
        "CREATE TEMP TABLE filtered_notes ON COMMIT DROP AS
         SELECT DISTINCT ON (note_id)
                note_id, latitude, longitude, created_at, closed_at, status, updated_at
         FROM ({}) s
         ORDER BY note_id, updated_at DESC",
        StagingSet::union(
            &staging.notes,
            "note_id, latitude, longitude, created_at, closed_at, status, updated_at"
        )
    ))
    .await?;
    tx.execute(
        "DELETE FROM filtered_notes f
         USING notes n
         WHERE n.note_id = f.note_id AND n.updated_at >= f.updated_at",
        &[],
    )
    .await?;

    tx.batch_execute(&format!(
        "CREATE TEMP TABLE filtered_comments ON COMMIT DROP AS
         SELECT DISTINCT ON (note_id, sequence_action)
                note_id, event, created_at, id_user, username, sequence_action
         FROM ({}) s
         ORDER BY note_id, sequence_action",
        StagingSet::union(
            &staging.comments,
            "note_id, event, created_at, id_user, username, sequence_action"
        )
    ))
    .await?;
    tx.execute(
        "DELETE FROM filtered_comments f
         USING note_comments c
         WHERE c.note_id = f.note_id AND c.sequence_action = f.sequence_action",
        &[],
    )
    .await?;

    tx.batch_execute(&format!(
        "CREATE TEMP TABLE filtered_texts ON COMMIT DROP AS
         SELECT DISTINCT ON (note_id, sequence_action)
                note_id, sequence_action, body
         FROM ({}) s
         ORDER BY note_id, sequence_action",
        StagingSet::union(&staging.texts, "note_id, sequence_action, body")
    ))
    .await?;
    tx.execute(
        "DELETE FROM filtered_texts f
         USING note_comments_text t
         WHERE t.note_id = f.note_id AND t.sequence_action = f.sequence_action",
        &[],
    )
    .await?;

    // Step 2: upsert notes. New notes are geotagged at insert through
    // get_country, which may still be the stub. The conflict arm only
    // touches mutable fields, and only for strictly newer rows.
    let notes_upserted = tx
        .execute(
            "INSERT INTO notes
                (note_id, latitude, longitude, created_at, closed_at, status, id_country, updated_at)
             SELECT f.note_id, f.latitude, f.longitude, f.created_at, f.closed_at,
                    f.status::note_status, get_country(f.latitude, f.longitude), f.updated_at
             FROM filtered_notes f
             ON CONFLICT (note_id) DO UPDATE
             SET status = excluded.status,
                 closed_at = excluded.closed_at,
                 updated_at = excluded.updated_at
             WHERE excluded.updated_at > notes.updated_at",
            &[],
        )
        .await?;

    // Step 3: comments are append-only.
    let comments_inserted = tx
        .execute(
            "INSERT INTO note_comments
                (note_id, sequence_action, event, created_at, id_user, username)
             SELECT f.note_id, f.sequence_action, f.event::note_event, f.created_at,
                    f.id_user, f.username
             FROM filtered_comments f
             ON CONFLICT (note_id, sequence_action) DO NOTHING",
            &[],
        )
        .await?;

    // Step 4: text only where the parent comment made it into main, so the
    // FK holds even when dedup dropped the comment.
    let texts_filtered: i64 = tx
        .query_one("SELECT count(*) FROM filtered_texts", &[])
        .await?
        .get(0);
    let texts_inserted = tx
        .execute(
            "INSERT INTO note_comments_text (note_id, sequence_action, body)
             SELECT f.note_id, f.sequence_action, f.body
             FROM filtered_texts f
             JOIN note_comments c
               ON c.note_id = f.note_id AND c.sequence_action = f.sequence_action
             ON CONFLICT (note_id, sequence_action) DO NOTHING",
            &[],
        )
        .await?;

    // Step 5: watermark over the affected rows, committed with them.
    let watermark: Option<DateTime<Utc>> = tx
        .query_one(
            "SELECT GREATEST(
                (SELECT max(updated_at) FROM filtered_notes),
                (SELECT max(created_at) FROM filtered_comments))",
            &[],
        )
        .await?
        .get(0);
    if let Some(ts) = watermark {
        tx.execute(
            "INSERT INTO max_note_timestamp (id, ts) VALUES (1, $1)
             ON CONFLICT (id) DO UPDATE
             SET ts = GREATEST(max_note_timestamp.ts, excluded.ts)",
            &[&ts],
        )
        .await?;
    }

    tx.commit().await?;

    let texts_dropped = (texts_filtered as u64).saturating_sub(texts_inserted);
    if texts_dropped > 0 {
        tracing::warn!("{texts_dropped} text rows dropped for missing parent comments");
    }

    Ok(ConsolidationOutcome {
        notes_upserted,
        comments_inserted,
        texts_inserted,
        texts_dropped,
        watermark,
    })
}

/// Post-cycle integrity check: recent notes with no comments at all.
///
/// Every nonzero count is recorded in `note_gaps`; beyond the threshold the
/// cycle fails hard so an operator looks at the feed.
async fn gap_check(db: &Db) -> Result<(), IngestError> {
    let total: i64 = db
        .client
        .query_one(
            &format!(
                "SELECT count(*) FROM notes
                 WHERE created_at > now() - interval '{GAP_WINDOW_DAYS} days'"
            ),
            &[],
        )
        .await?
        .get(0);
    let affected: i64 = db
        .client
        .query_one(
            &format!(
                "SELECT count(*) FROM notes n
                 WHERE n.created_at > now() - interval '{GAP_WINDOW_DAYS} days'
                   AND NOT EXISTS
                       (SELECT 1 FROM note_comments c WHERE c.note_id = n.note_id)"
            ),
            &[],
        )
        .await?
        .get(0);

    if affected > 0 {
        let gap = GapRecord {
            gap_kind: "notes_without_comments",
            note_count: total,
            affected,
            percentage: if total > 0 {
                affected as f64 * 100.0 / total as f64
            } else {
                0.0
            },
        };
        db.client
            .execute(
                "INSERT INTO note_gaps (gap_kind, note_count, affected, percentage)
                 VALUES ($1, $2, $3, $4)",
                &[&gap.gap_kind, &gap.note_count, &gap.affected, &gap.percentage],
            )
            .await?;
        tracing::warn!(
            "gap check: {} of {} recent notes have no comments ({:.2}%)",
            gap.affected,
            gap.note_count,
            gap.percentage
        );
    }
    if affected > GAP_THRESHOLD {
        return Err(IngestError::GapThresholdExceeded { affected, total });
    }
    Ok(())
}
