//! End-to-end pipeline scenarios: cold start from a Planet fixture, an
//! incremental API cycle adding a close, large-delta escalation, and the
//! empty-cycle short-circuit.

mod common;

use common::{TestDb, baseline_json, mount_overpass, test_context};
use notetide::apisync::{CycleWork, run_api_cycle};
use notetide::bootstrap::{run_base_mode, run_sync_mode};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PLANET_ONE: &str = include_str!("fixtures/planet-3450803.xml");
const PLANET_TWO: &str = include_str!("fixtures/planet-two-notes.xml");
const API_CLOSE: &str = include_str!("fixtures/api-close-3450803.xml");
const API_TWO: &str = include_str!("fixtures/api-two-notes.xml");

const US_BOX: (i64, &str, [f64; 4]) =
    (148838, "United States", [-125.0, 24.5, -66.9, 49.4]);

async fn mount_planet(server: &MockServer, body: &str) {
    Mock::given(method("GET"))
        .and(path("/planet.osn"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
        .mount(server)
        .await;
}

/// Scenario: empty database, one-note Planet dump, one-country baseline.
/// Base mode ends with the note present, geotagged, and the watermark at
/// the note's creation instant.
#[tokio::test]
async fn test_cold_start_base_mode() {
    let db = TestDb::new().await;
    let server = MockServer::start().await;
    mount_planet(&server, PLANET_ONE).await;
    mount_overpass(&server, &[(148838, "United States")]).await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(
        &db.url,
        &server.uri(),
        &format!("{}/planet.osn", server.uri()),
        &format!("{}/interpreter", server.uri()),
        dir.path(),
        10_000,
    );
    std::fs::write(
        dir.path().join("data/countries-baseline.geojson"),
        baseline_json(&[US_BOX]),
    )
    .unwrap();

    let mut client = db.connect().await;
    run_base_mode(&ctx, &mut client).await.unwrap();

    assert_eq!(db.count("notes").await, 1);
    let status: String = db
        .query_scalar("SELECT status::text FROM notes WHERE note_id = 3450803")
        .await;
    assert_eq!(status, "open");
    let country: Option<i32> = db
        .query_scalar("SELECT id_country FROM notes WHERE note_id = 3450803")
        .await;
    assert_eq!(country, Some(148838));

    let body: String = db
        .query_scalar("SELECT body FROM note_comments_text WHERE note_id = 3450803")
        .await;
    assert_eq!(body, "Iglesia pentecostal");

    let wm: chrono::DateTime<chrono::Utc> =
        db.query_scalar("SELECT ts FROM max_note_timestamp").await;
    assert_eq!(
        wm,
        "2022-11-21T17:13:10Z"
            .parse::<chrono::DateTime<chrono::Utc>>()
            .unwrap()
    );

    // No failure marker was written anywhere.
    assert!(!ctx.paths.marker_file().exists());
}

/// Scenario: the API returns the scenario-1 note with an added close.
/// The cycle flips the status, appends the comment, and advances the
/// watermark to the closing instant.
#[tokio::test]
async fn test_incremental_sync_adds_close() {
    let db = TestDb::new().await;
    let server = MockServer::start().await;
    mount_planet(&server, PLANET_ONE).await;
    mount_overpass(&server, &[(148838, "United States")]).await;
    Mock::given(method("GET"))
        .and(path("/notes/search"))
        .and(query_param("limit", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<osm version="0.6"><note lat="39.7" lon="-104.9"></note></osm>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/notes/search"))
        .and(query_param("limit", "10000"))
        .respond_with(ResponseTemplate::new(200).set_body_string(API_CLOSE))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(
        &db.url,
        &server.uri(),
        &format!("{}/planet.osn", server.uri()),
        &format!("{}/interpreter", server.uri()),
        dir.path(),
        10_000,
    );
    std::fs::write(
        dir.path().join("data/countries-baseline.geojson"),
        baseline_json(&[US_BOX]),
    )
    .unwrap();

    let mut client = db.connect().await;
    run_base_mode(&ctx, &mut client).await.unwrap();

    let work = run_api_cycle(&ctx, &mut client).await.unwrap();
    assert!(matches!(work, CycleWork::SmallDelta(_)));

    let status: String = db
        .query_scalar("SELECT status::text FROM notes WHERE note_id = 3450803")
        .await;
    assert_eq!(status, "closed");
    let closed_at: Option<chrono::DateTime<chrono::Utc>> = db
        .query_scalar("SELECT closed_at FROM notes WHERE note_id = 3450803")
        .await;
    assert_eq!(
        closed_at,
        Some(
            "2022-11-22T02:06:53Z"
                .parse::<chrono::DateTime<chrono::Utc>>()
                .unwrap()
        )
    );
    assert_eq!(db.count("note_comments").await, 2);

    let wm: chrono::DateTime<chrono::Utc> =
        db.query_scalar("SELECT ts FROM max_note_timestamp").await;
    assert_eq!(
        wm,
        "2022-11-22T02:06:53Z"
            .parse::<chrono::DateTime<chrono::Utc>>()
            .unwrap()
    );

    // API staging is empty at cycle end, whatever happened.
    assert_eq!(db.count("notes_api").await, 0);
    assert_eq!(db.count("note_comments_api").await, 0);
}

/// Scenario: the delta count reaches MAX_NOTES, so the cycle escalates to a
/// Planet reload; the watermark comes from the reload path.
#[tokio::test]
async fn test_large_delta_escalates_to_planet() {
    let db = TestDb::with_schema().await;
    let server = MockServer::start().await;
    mount_planet(&server, PLANET_TWO).await;
    Mock::given(method("GET"))
        .and(path("/notes/search"))
        .and(query_param("limit", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<osm version="0.6"><note lat="52.5" lon="13.4"></note></osm>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/notes/search"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(API_TWO))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut ctx = test_context(
        &db.url,
        &server.uri(),
        &format!("{}/planet.osn", server.uri()),
        &format!("{}/interpreter", server.uri()),
        dir.path(),
        2, // MAX_NOTES: a two-note delta is already "large"
    );
    ctx.config.skip_auto_load_countries = true;

    let client = db.connect().await;
    client
        .set_watermark("2023-01-01T00:00:00Z".parse().unwrap())
        .await
        .unwrap();

    let mut client = db.connect().await;
    let work = run_api_cycle(&ctx, &mut client).await.unwrap();
    assert!(matches!(work, CycleWork::EscalatedToPlanet));

    // Both notes arrived via the reload, not via API staging.
    assert_eq!(db.count("notes").await, 2);
    assert_eq!(db.count("notes_api").await, 0);

    let wm: chrono::DateTime<chrono::Utc> =
        db.query_scalar("SELECT ts FROM max_note_timestamp").await;
    assert_eq!(
        wm,
        "2023-03-01T11:00:00Z"
            .parse::<chrono::DateTime<chrono::Utc>>()
            .unwrap()
    );
}

/// Scenario: the probe finds nothing past the watermark. The cycle
/// short-circuits without touching anything.
#[tokio::test]
async fn test_empty_probe_short_circuits() {
    let db = TestDb::with_schema().await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notes/search"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"<osm version="0.6"></osm>"#),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(
        &db.url,
        &server.uri(),
        &format!("{}/planet.osn", server.uri()),
        &format!("{}/interpreter", server.uri()),
        dir.path(),
        10_000,
    );

    let client = db.connect().await;
    client
        .set_watermark("2023-01-01T00:00:00Z".parse().unwrap())
        .await
        .unwrap();

    let mut client = db.connect().await;
    let work = run_api_cycle(&ctx, &mut client).await.unwrap();
    assert!(matches!(work, CycleWork::NoUpdates));

    // Watermark untouched, no staging rows, no marker.
    let wm: chrono::DateTime<chrono::Utc> =
        db.query_scalar("SELECT ts FROM max_note_timestamp").await;
    assert_eq!(
        wm,
        "2023-01-01T00:00:00Z"
            .parse::<chrono::DateTime<chrono::Utc>>()
            .unwrap()
    );
    assert_eq!(db.count("notes").await, 0);
    assert!(!ctx.paths.marker_file().exists());
}

/// Sync mode on a database that was never bootstrapped must refuse with the
/// "base mode required" code instead of re-creating tables.
#[tokio::test]
async fn test_sync_mode_refuses_missing_schema() {
    let db = TestDb::new().await;
    let server = MockServer::start().await;
    mount_planet(&server, PLANET_ONE).await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(
        &db.url,
        &server.uri(),
        &format!("{}/planet.osn", server.uri()),
        &format!("{}/interpreter", server.uri()),
        dir.path(),
        10_000,
    );

    let mut client = db.connect().await;
    let err = run_sync_mode(&ctx, &mut client).await.unwrap_err();
    assert_eq!(err.exit_code(), 245);

    // Nothing was created behind the operator's back.
    let exists: bool = db.query_scalar("SELECT to_regclass('notes') IS NOT NULL").await;
    assert!(!exists);
}
