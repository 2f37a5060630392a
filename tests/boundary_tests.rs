//! Boundary refresh tests: baseline import, the country update state
//! machine, and the affected-notes-only re-geotag guarantee.

mod common;

use common::{TestDb, baseline_json, mount_overpass, test_context};
use notetide::IngestContext;
use notetide::boundary::{Baseline, GeometryImporter, GeometrySource, refresh_boundaries};
use notetide::db::Db;
use notetide::error::IngestError;
use notetide::model::BoundingBox;
use wiremock::MockServer;

/// Importer that must never run: these tests stay on the baseline path.
struct NoImporter;

impl GeometryImporter for NoImporter {
    async fn import(
        &self,
        _db: &Db,
        boundary: &notetide::boundary::BoundaryRef,
    ) -> Result<GeometrySource, IngestError> {
        panic!(
            "per-id importer invoked for {} though ids match the baseline",
            boundary.relation_id
        );
    }
}

const C_ONE_V1: (i64, &str, [f64; 4]) = (9001, "Cone", [5.0, 45.0, 15.0, 55.0]);
const C_ONE_V2: (i64, &str, [f64; 4]) = (9001, "Cone", [-3.0, -3.0, 3.0, 3.0]);
const C_TWO: (i64, &str, [f64; 4]) = (9002, "Ctwo", [-1.0, -1.0, 1.0, 1.0]);

async fn setup(db: &TestDb) -> (MockServer, IngestContext, tempfile::TempDir) {
    let server = MockServer::start().await;
    mount_overpass(&server, &[(9001, "Cone"), (9002, "Ctwo")]).await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(
        &db.url,
        &server.uri(),
        &format!("{}/planet.osn", server.uri()),
        &format!("{}/interpreter", server.uri()),
        dir.path(),
        10_000,
    );
    (server, ctx, dir)
}

fn write_baseline(dir: &std::path::Path, extra: &[(i64, &str, [f64; 4])]) {
    std::fs::write(
        dir.join("data/countries-baseline.geojson"),
        baseline_json(extra),
    )
    .unwrap();
}

#[tokio::test]
async fn test_initial_import_builds_spatial_lookup() {
    let db = TestDb::with_schema().await;
    let (_server, ctx, dir) = setup(&db).await;
    write_baseline(dir.path(), &[C_ONE_V1, C_TWO]);

    let client = db.connect().await;
    let baseline = Baseline::in_dir(&ctx.config.baseline_dir);
    let outcome = refresh_boundaries(
        &client,
        &ctx.http,
        &NoImporter,
        &baseline,
        ctx.config.retry,
        false,
    )
    .await
    .unwrap();

    // Two scenario countries plus the fixed relations.
    assert_eq!(outcome.imported, 8);
    assert_eq!(db.count("countries").await, 8);

    // The stub is gone: points resolve to their containing polygon.
    let inside_c1: Option<i32> = db.query_scalar("SELECT get_country(50.0, 10.0)").await;
    assert_eq!(inside_c1, Some(9001));
    let inside_c2: Option<i32> = db.query_scalar("SELECT get_country(0.0, 0.0)").await;
    assert_eq!(inside_c2, Some(9002));
    let nowhere: Option<i32> = db.query_scalar("SELECT get_country(50.0, -40.0)").await;
    assert_eq!(nowhere, None);
}

/// Scenario: C1's new geometry no longer covers (50, 10) but now covers
/// (0, 0); C2 is unchanged. Only the note inside the changed boundary moves.
#[tokio::test]
async fn test_refresh_regeotags_only_affected_notes() {
    let db = TestDb::with_schema().await;
    let (_server, ctx, dir) = setup(&db).await;
    write_baseline(dir.path(), &[C_ONE_V1, C_TWO]);

    let client = db.connect().await;
    let baseline = Baseline::in_dir(&ctx.config.baseline_dir);
    refresh_boundaries(&client, &ctx.http, &NoImporter, &baseline, ctx.config.retry, false)
        .await
        .unwrap();

    // Two geotagged notes, one per country.
    db.execute(
        "INSERT INTO notes VALUES
           (1, 50.0, 10.0, '2023-01-01T00:00:00Z', NULL, 'open',
            get_country(50.0, 10.0), '2023-01-01T00:00:00Z'),
           (2, 0.0, 0.0, '2023-01-01T00:00:00Z', NULL, 'open',
            get_country(0.0, 0.0), '2023-01-01T00:00:00Z')",
    )
    .await;
    let a: Option<i32> = db.query_scalar("SELECT id_country FROM notes WHERE note_id = 1").await;
    assert_eq!(a, Some(9001));

    // The boundary set drifts in place: C1 moves across the globe.
    write_baseline(dir.path(), &[C_ONE_V2, C_TWO]);
    let outcome = refresh_boundaries(
        &client,
        &ctx.http,
        &NoImporter,
        &baseline,
        ctx.config.retry,
        true,
    )
    .await
    .unwrap();

    assert_eq!(outcome.changed, vec![9001]);
    assert!(outcome.failed.is_empty());

    // The note C1 abandoned now belongs to nothing.
    let a: Option<i32> = db.query_scalar("SELECT id_country FROM notes WHERE note_id = 1").await;
    assert_eq!(a, None);
    // The note in the untouched country keeps its assignment even though
    // C1's new bbox covers it (the smaller polygon still wins).
    let b: Option<i32> = db.query_scalar("SELECT id_country FROM notes WHERE note_id = 2").await;
    assert_eq!(b, Some(9002));

    // The state machine settled: nothing pending, nothing failed.
    let pending: i64 = db
        .query_scalar("SELECT count(*) FROM countries WHERE updated OR update_failed")
        .await;
    assert_eq!(pending, 0);
}

/// A boundary whose refresh fails stays flagged `update_failed` until the
/// next successful refresh clears it.
#[tokio::test]
async fn test_failed_refresh_flags_country() {
    let db = TestDb::with_schema().await;
    let (_server, ctx, dir) = setup(&db).await;
    write_baseline(dir.path(), &[C_ONE_V1, C_TWO]);

    let client = db.connect().await;
    let baseline = Baseline::in_dir(&ctx.config.baseline_dir);
    refresh_boundaries(&client, &ctx.http, &NoImporter, &baseline, ctx.config.retry, false)
        .await
        .unwrap();

    // Corrupt C1's geometry in the baseline: the update round fails for it.
    let corrupted = baseline_json(&[C_TWO]).replace(
        r#""features":["#,
        r#""features":[{"type":"Feature","properties":{"relation_id":9001,"name_en":"Cone","name":"Cone"},"geometry":{"type":"Bogus"}},"#,
    );
    std::fs::write(dir.path().join("data/countries-baseline.geojson"), corrupted).unwrap();

    let outcome = refresh_boundaries(
        &client,
        &ctx.http,
        &NoImporter,
        &baseline,
        ctx.config.retry,
        true,
    )
    .await
    .unwrap();
    assert_eq!(outcome.failed, vec![9001]);

    let (updated, failed): (bool, bool) = {
        let u: bool = db
            .query_scalar("SELECT updated FROM countries WHERE country_id = 9001")
            .await;
        let f: bool = db
            .query_scalar("SELECT update_failed FROM countries WHERE country_id = 9001")
            .await;
        (u, f)
    };
    assert!(updated);
    assert!(failed);

    // A later successful refresh of the same boundary clears both flags.
    write_baseline(dir.path(), &[C_ONE_V1, C_TWO]);
    refresh_boundaries(&client, &ctx.http, &NoImporter, &baseline, ctx.config.retry, true)
        .await
        .unwrap();
    let failed: bool = db
        .query_scalar("SELECT update_failed FROM countries WHERE country_id = 9001")
        .await;
    assert!(!failed);
}

#[tokio::test]
async fn test_bbox_union_catches_departures() {
    // Pure geometry sanity for the re-geotag prefilter: the union box of an
    // old and new position must cover points in either.
    let old = BoundingBox {
        west: 5.0,
        south: 45.0,
        east: 15.0,
        north: 55.0,
    };
    let merged = BoundingBox {
        west: old.west.min(-3.0),
        south: old.south.min(-3.0),
        east: old.east.max(3.0),
        north: old.north.max(3.0),
    };
    assert!(merged.contains(50.0, 10.0));
    assert!(merged.contains(0.0, 0.0));
}
