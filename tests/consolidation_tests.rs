//! Consolidator tests: dedup, upsert policy, FK-safe text insertion,
//! watermark behavior, idempotence, and the gap check.

mod common;

use common::TestDb;
use notetide::consolidate::{StagingSet, consolidate};
use notetide::error::{IngestError, RetrySpec};

fn fast_retry() -> RetrySpec {
    RetrySpec {
        attempts: 2,
        delay: std::time::Duration::from_millis(50),
    }
}

/// Stage one open note with its opening comment and text.
async fn stage_open_note(db: &TestDb, note_id: i64, created: &str) {
    db.execute(&format!(
        "INSERT INTO notes_api VALUES
           ({note_id}, 39.7, -104.9, '{created}', NULL, 'open', '{created}')"
    ))
    .await;
    db.execute(&format!(
        "INSERT INTO note_comments_api VALUES
           ({note_id}, 1, 'opened', '{created}', 42, 'tester')"
    ))
    .await;
    db.execute(&format!(
        "INSERT INTO note_comments_text_api VALUES ({note_id}, 1, 'hello world')"
    ))
    .await;
}

#[tokio::test]
async fn test_consolidate_inserts_and_sets_watermark() {
    let db = TestDb::with_schema().await;
    stage_open_note(&db, 101, "2023-01-10T08:00:00Z").await;

    let mut client = db.connect().await;
    let outcome = consolidate(&mut client, &StagingSet::api(), fast_retry())
        .await
        .unwrap();

    assert_eq!(outcome.notes_upserted, 1);
    assert_eq!(outcome.comments_inserted, 1);
    assert_eq!(outcome.texts_inserted, 1);
    assert_eq!(db.count("notes").await, 1);
    assert_eq!(db.count("note_comments").await, 1);

    let status: String = db
        .query_scalar("SELECT status::text FROM notes WHERE note_id = 101")
        .await;
    assert_eq!(status, "open");

    let wm: chrono::DateTime<chrono::Utc> =
        db.query_scalar("SELECT ts FROM max_note_timestamp").await;
    assert_eq!(
        wm,
        "2023-01-10T08:00:00Z"
            .parse::<chrono::DateTime<chrono::Utc>>()
            .unwrap()
    );

    // The logical lock is gone afterwards.
    assert_eq!(db.count("execution_lock").await, 0);
}

#[tokio::test]
async fn test_consolidate_twice_is_a_noop() {
    let db = TestDb::with_schema().await;
    stage_open_note(&db, 101, "2023-01-10T08:00:00Z").await;

    let mut client = db.connect().await;
    consolidate(&mut client, &StagingSet::api(), fast_retry())
        .await
        .unwrap();

    let updated_before: chrono::DateTime<chrono::Utc> = db
        .query_scalar("SELECT updated_at FROM notes WHERE note_id = 101")
        .await;

    // Same staging contents again: everything must dedup away.
    let outcome = consolidate(&mut client, &StagingSet::api(), fast_retry())
        .await
        .unwrap();
    assert_eq!(outcome.notes_upserted, 0);
    assert_eq!(outcome.comments_inserted, 0);
    assert_eq!(outcome.texts_inserted, 0);
    assert_eq!(outcome.watermark, None);

    assert_eq!(db.count("notes").await, 1);
    assert_eq!(db.count("note_comments").await, 1);
    assert_eq!(db.count("note_comments_text").await, 1);

    let updated_after: chrono::DateTime<chrono::Utc> = db
        .query_scalar("SELECT updated_at FROM notes WHERE note_id = 101")
        .await;
    assert_eq!(updated_before, updated_after);
}

#[tokio::test]
async fn test_close_event_updates_status_and_watermark() {
    let db = TestDb::with_schema().await;
    stage_open_note(&db, 101, "2023-01-10T08:00:00Z").await;

    let mut client = db.connect().await;
    consolidate(&mut client, &StagingSet::api(), fast_retry())
        .await
        .unwrap();

    // The next delta carries the same note, now closed.
    db.execute("TRUNCATE notes_api, note_comments_api, note_comments_text_api")
        .await;
    db.execute(
        "INSERT INTO notes_api VALUES
           (101, 39.7, -104.9, '2023-01-10T08:00:00Z', '2023-01-11T02:00:00Z',
            'closed', '2023-01-11T02:00:00Z')",
    )
    .await;
    db.execute(
        "INSERT INTO note_comments_api VALUES
           (101, 1, 'opened', '2023-01-10T08:00:00Z', 42, 'tester'),
           (101, 2, 'closed', '2023-01-11T02:00:00Z', NULL, NULL)",
    )
    .await;

    consolidate(&mut client, &StagingSet::api(), fast_retry())
        .await
        .unwrap();

    let status: String = db
        .query_scalar("SELECT status::text FROM notes WHERE note_id = 101")
        .await;
    assert_eq!(status, "closed");
    let closed_at: Option<chrono::DateTime<chrono::Utc>> = db
        .query_scalar("SELECT closed_at FROM notes WHERE note_id = 101")
        .await;
    assert_eq!(
        closed_at,
        Some(
            "2023-01-11T02:00:00Z"
                .parse::<chrono::DateTime<chrono::Utc>>()
                .unwrap()
        )
    );
    assert_eq!(db.count("note_comments").await, 2);

    let wm: chrono::DateTime<chrono::Utc> =
        db.query_scalar("SELECT ts FROM max_note_timestamp").await;
    assert_eq!(
        wm,
        "2023-01-11T02:00:00Z"
            .parse::<chrono::DateTime<chrono::Utc>>()
            .unwrap()
    );
}

#[tokio::test]
async fn test_equal_updated_at_keeps_stored_row() {
    let db = TestDb::with_schema().await;
    stage_open_note(&db, 101, "2023-01-10T08:00:00Z").await;

    let mut client = db.connect().await;
    consolidate(&mut client, &StagingSet::api(), fast_retry())
        .await
        .unwrap();

    // Same updated_at, different status: no news, no update.
    db.execute("TRUNCATE notes_api, note_comments_api, note_comments_text_api")
        .await;
    db.execute(
        "INSERT INTO notes_api VALUES
           (101, 39.7, -104.9, '2023-01-10T08:00:00Z', '2023-01-10T08:00:00Z',
            'closed', '2023-01-10T08:00:00Z')",
    )
    .await;
    consolidate(&mut client, &StagingSet::api(), fast_retry())
        .await
        .unwrap();

    let status: String = db
        .query_scalar("SELECT status::text FROM notes WHERE note_id = 101")
        .await;
    assert_eq!(status, "open");
}

#[tokio::test]
async fn test_text_without_parent_comment_is_dropped() {
    let db = TestDb::with_schema().await;
    stage_open_note(&db, 101, "2023-01-10T08:00:00Z").await;
    // A text row whose comment never arrives.
    db.execute("INSERT INTO note_comments_text_api VALUES (101, 9, 'orphan')")
        .await;

    let mut client = db.connect().await;
    let outcome = consolidate(&mut client, &StagingSet::api(), fast_retry())
        .await
        .unwrap();

    assert_eq!(outcome.texts_inserted, 1);
    assert_eq!(outcome.texts_dropped, 1);
    assert_eq!(db.count("note_comments_text").await, 1);
}

#[tokio::test]
async fn test_staging_dedup_across_partitions() {
    let db = TestDb::with_schema().await;
    let client = db.connect().await;
    // Two sync partitions carrying the same note; the newer wins once.
    client
        .batch(&notetide::schema::sync_staging_part_sql(0))
        .await
        .unwrap();
    client
        .batch(&notetide::schema::sync_staging_part_sql(1))
        .await
        .unwrap();
    db.execute(
        "INSERT INTO notes_sync_part_0 VALUES
           (7, 1.0, 2.0, '2023-01-01T00:00:00Z', NULL, 'open', '2023-01-01T00:00:00Z')",
    )
    .await;
    db.execute(
        "INSERT INTO notes_sync_part_1 VALUES
           (7, 1.0, 2.0, '2023-01-01T00:00:00Z', '2023-01-02T00:00:00Z', 'closed',
            '2023-01-02T00:00:00Z')",
    )
    .await;
    db.execute(
        "INSERT INTO note_comments_sync_part_0 VALUES
           (7, 1, 'opened', '2023-01-01T00:00:00Z', NULL, NULL)",
    )
    .await;
    db.execute(
        "INSERT INTO note_comments_sync_part_1 VALUES
           (7, 1, 'opened', '2023-01-01T00:00:00Z', NULL, NULL),
           (7, 2, 'closed', '2023-01-02T00:00:00Z', NULL, NULL)",
    )
    .await;

    let mut client = db.connect().await;
    let outcome = consolidate(&mut client, &StagingSet::sync_parts(2), fast_retry())
        .await
        .unwrap();

    assert_eq!(outcome.notes_upserted, 1);
    assert_eq!(outcome.comments_inserted, 2);
    let status: String = db
        .query_scalar("SELECT status::text FROM notes WHERE note_id = 7")
        .await;
    assert_eq!(status, "closed");
}

#[tokio::test]
async fn test_gap_check_records_commentless_notes() {
    let db = TestDb::with_schema().await;
    // A freshly created note with no comments at all.
    db.execute(
        "INSERT INTO notes_api VALUES
           (55, 1.0, 2.0, now(), NULL, 'open', now())",
    )
    .await;

    let mut client = db.connect().await;
    consolidate(&mut client, &StagingSet::api(), fast_retry())
        .await
        .unwrap();

    assert_eq!(db.count("note_gaps").await, 1);
    let affected: i64 = db.query_scalar("SELECT affected FROM note_gaps").await;
    assert_eq!(affected, 1);
    let processed: bool = db.query_scalar("SELECT processed FROM note_gaps").await;
    assert!(!processed);
}

#[tokio::test]
async fn test_lock_released_even_when_merge_fails() {
    let db = TestDb::with_schema().await;
    // Poison the staging: a status value outside the enum makes the note
    // upsert fail mid-merge.
    db.execute(
        "INSERT INTO notes_api VALUES
           (99, 1.0, 2.0, '2023-01-01T00:00:00Z', NULL, 'bogus', '2023-01-01T00:00:00Z')",
    )
    .await;

    let mut client = db.connect().await;
    let err = consolidate(&mut client, &StagingSet::api(), fast_retry())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Db(_)));

    // Scoped release: the logical lock must not leak.
    assert_eq!(db.count("execution_lock").await, 0);
    // And the failed transaction left nothing behind.
    assert_eq!(db.count("notes").await, 0);
}
