//! Boundary manager: country and maritime polygons.
//!
//! Two flows share this module:
//!
//! - **Import**: collect the current relation id sets from Overpass (plus the
//!   fixed disputed/Antarctic list), compare against the shipped GeoJSON
//!   baseline, and import either straight from the baseline (id sets match)
//!   or boundary-by-boundary through the external geometry importer.
//! - **Re-geotag** (update mode): flag every country before the import,
//!   clear the flag per successful refresh, mark leftovers failed, then
//!   re-run the spatial lookup only for notes plausibly affected by a
//!   geometry that actually changed.
//!
//! Change detection is an xxh3 hash of each boundary's source geometry text;
//! an unchanged hash means no note can have moved, so the country is skipped
//! by the re-geotag pass entirely.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::Value;
use xxhash_rust::xxh3::xxh3_64;

use crate::db::Db;
use crate::error::{IngestError, RetrySpec, retry_fixed};
use crate::fetch::HttpClient;
use crate::model::BoundingBox;
use crate::schema::DdlScript;

/// Which boundary family a relation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    Country,
    Maritime,
}

/// Relations that never come back from the admin_level query but must exist
/// in the replica: disputed areas and the Antarctic territories.
pub const FIXED_BOUNDARY_IDS: &[(i64, &str)] = &[
    (449220, "Taiwan"),
    (1703814, "Gaza Strip"),
    (2088990, "Kosovo"),
    (2559126, "Western Sahara"),
    (2186646, "Antarctica"),
    (3394112, "Bir Tawil"),
];

/// Overpass query for sovereign-country relation ids and names.
const COUNTRY_IDS_QUERY: &str = r#"[out:json][timeout:300];
relation["type"="boundary"]["boundary"="administrative"]["admin_level"="2"];
out tags;"#;

/// Overpass query for maritime zones: EEZ, contiguous and fishing zones.
const MARITIME_IDS_QUERY: &str = r#"[out:json][timeout:300];
relation["boundary"="maritime"]["border_type"~"^(eez|contiguous|fishing)$"];
out tags;"#;

/// One boundary to import: id plus display names.
#[derive(Debug, Clone)]
pub struct BoundaryRef {
    pub relation_id: i64,
    pub name_en: String,
    pub name_local: Option<String>,
    pub kind: BoundaryKind,
}

/// What a refresh run did.
#[derive(Debug, Clone, Default)]
pub struct BoundaryRefreshOutcome {
    pub imported: usize,
    /// Ids whose geometry hash changed (or that are new).
    pub changed: Vec<i64>,
    pub failed: Vec<i64>,
    pub notes_regeotagged: u64,
}

// ── Overpass id lists ──────────────────────────────────────────────────────

fn parse_overpass_refs(body: &str, kind: BoundaryKind) -> Result<Vec<BoundaryRef>, IngestError> {
    let doc: Value = serde_json::from_str(body)
        .map_err(|e| IngestError::BoundaryIdsUnavailable(format!("bad overpass JSON: {e}")))?;
    let elements = doc["elements"]
        .as_array()
        .ok_or_else(|| IngestError::BoundaryIdsUnavailable("no elements array".into()))?;

    let mut refs = Vec::with_capacity(elements.len());
    for el in elements {
        let Some(id) = el["id"].as_i64() else { continue };
        let tags = &el["tags"];
        let name_en = tags["name:en"]
            .as_str()
            .or_else(|| tags["name"].as_str())
            .unwrap_or("unnamed")
            .to_string();
        let name_local = tags["name"].as_str().map(str::to_owned);
        refs.push(BoundaryRef {
            relation_id: id,
            name_en,
            name_local,
            kind,
        });
    }
    if refs.is_empty() {
        return Err(IngestError::BoundaryIdsUnavailable(
            "overpass returned zero relations".into(),
        ));
    }
    Ok(refs)
}

/// Fetch the combined boundary list: countries, the fixed additions, and
/// maritime zones.
pub async fn fetch_boundary_refs(http: &HttpClient) -> Result<Vec<BoundaryRef>, IngestError> {
    let countries_body = http.overpass(COUNTRY_IDS_QUERY).await.map_err(|e| {
        IngestError::BoundaryIdsUnavailable(format!("country id query: {e}"))
    })?;
    let mut refs = parse_overpass_refs(&countries_body, BoundaryKind::Country)?;

    let have: BTreeSet<i64> = refs.iter().map(|r| r.relation_id).collect();
    for &(id, name) in FIXED_BOUNDARY_IDS {
        if !have.contains(&id) {
            refs.push(BoundaryRef {
                relation_id: id,
                name_en: name.to_string(),
                name_local: None,
                kind: BoundaryKind::Country,
            });
        }
    }

    let maritime_body = http.overpass(MARITIME_IDS_QUERY).await.map_err(|e| {
        IngestError::BoundaryIdsUnavailable(format!("maritime id query: {e}"))
    })?;
    match parse_overpass_refs(&maritime_body, BoundaryKind::Maritime) {
        Ok(maritime) => refs.extend(maritime),
        // A world with zero maritime zones is implausible but not fatal for
        // the land pipeline.
        Err(e) => tracing::warn!("maritime id list unavailable: {e}"),
    }
    Ok(refs)
}

// ── Baseline ───────────────────────────────────────────────────────────────

/// The shipped GeoJSON baseline: one FeatureCollection per kind.
#[derive(Debug, Clone)]
pub struct Baseline {
    pub countries: PathBuf,
    pub maritime: PathBuf,
}

impl Baseline {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            countries: dir.join("countries-baseline.geojson"),
            maritime: dir.join("maritime-baseline.geojson"),
        }
    }

    /// All features across both files, keyed by relation id.
    pub fn features(&self) -> Result<BTreeMap<i64, BaselineFeature>, IngestError> {
        let mut out = BTreeMap::new();
        for (path, kind) in [
            (&self.countries, BoundaryKind::Country),
            (&self.maritime, BoundaryKind::Maritime),
        ] {
            if !path.exists() {
                continue;
            }
            let raw = std::fs::read_to_string(path)?;
            let doc: Value = serde_json::from_str(&raw)
                .map_err(|e| IngestError::Internal(format!("bad baseline {}: {e}", path.display())))?;
            let Some(features) = doc["features"].as_array() else {
                continue;
            };
            for f in features {
                let props = &f["properties"];
                let Some(id) = props["relation_id"].as_i64() else {
                    continue;
                };
                out.insert(
                    id,
                    BaselineFeature {
                        reference: BoundaryRef {
                            relation_id: id,
                            name_en: props["name_en"]
                                .as_str()
                                .or_else(|| props["name"].as_str())
                                .unwrap_or("unnamed")
                                .to_string(),
                            name_local: props["name"].as_str().map(str::to_owned),
                            kind,
                        },
                        geometry_json: f["geometry"].to_string(),
                    },
                );
            }
        }
        Ok(out)
    }

    /// SHA-256 of both files, for drift logging.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for path in [&self.countries, &self.maritime] {
            if let Ok(bytes) = std::fs::read(path) {
                hasher.update(&bytes);
            }
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>()
    }
}

#[derive(Debug, Clone)]
pub struct BaselineFeature {
    pub reference: BoundaryRef,
    /// The GeoJSON geometry object, serialized. Hashing this is the change
    /// signal; it is also what the SQL import consumes.
    pub geometry_json: String,
}

/// Whether the live Overpass id set differs from the baseline's.
pub fn ids_drifted(refs: &[BoundaryRef], baseline: &BTreeMap<i64, BaselineFeature>) -> bool {
    let live: BTreeSet<i64> = refs.iter().map(|r| r.relation_id).collect();
    let shipped: BTreeSet<i64> = baseline.keys().copied().collect();
    live != shipped
}

// ── Geometry importer seam ─────────────────────────────────────────────────

/// Converts one downloaded relation into the store's geometry type, landing
/// it in `country_import`. The subprocess implementation is the only place
/// the pipeline shells out.
pub trait GeometryImporter {
    fn import(
        &self,
        db: &Db,
        boundary: &BoundaryRef,
    ) -> impl Future<Output = Result<GeometrySource, IngestError>>;
}

/// Where the imported geometry came from, for hashing.
#[derive(Debug, Clone)]
pub struct GeometrySource {
    /// Raw source text of the geometry (GeoJSON); hashed for change
    /// detection.
    pub source_text: String,
}

/// Shells out to `ogr2ogr` after downloading the relation's geometry from
/// Overpass.
pub struct OgrImporter {
    pub command: String,
    pub database_url: String,
    pub http: HttpClient,
    pub temp_dir: PathBuf,
}

impl GeometryImporter for OgrImporter {
    async fn import(
        &self,
        db: &Db,
        boundary: &BoundaryRef,
    ) -> Result<GeometrySource, IngestError> {
        // Full relation with its ways and nodes, as OSM XML; that is the
        // layout the importer's OSM driver assembles multipolygons from.
        let query = format!(
            "[timeout:300];relation({});(._;>;);out body;",
            boundary.relation_id
        );
        let body = self.http.overpass(&query).await.map_err(|e| {
            IngestError::BoundaryFetchFailed {
                relation_id: boundary.relation_id,
                reason: e.to_string(),
            }
        })?;

        let geom_path = self
            .temp_dir
            .join(format!("boundary-{}.osm", boundary.relation_id));
        tokio::fs::write(&geom_path, &body).await?;

        db.truncate(&["country_import"]).await?;
        let status = tokio::process::Command::new(&self.command)
            .arg("-f")
            .arg("PostgreSQL")
            .arg(format!("PG:{}", self.database_url))
            .arg(&geom_path)
            .arg("multipolygons")
            .arg("-nln")
            .arg("country_import")
            .arg("-append")
            .arg("-skipfailures")
            .status()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    IngestError::MissingCommand(self.command.clone())
                } else {
                    e.into()
                }
            })?;
        if !status.success() {
            return Err(IngestError::BoundaryFetchFailed {
                relation_id: boundary.relation_id,
                reason: format!("{} exited with {status}", self.command),
            });
        }
        db.client
            .execute(
                "UPDATE country_import SET relation_id = $1, name_en = $2, name_local = $3,
                        is_maritime = $4",
                &[
                    &(boundary.relation_id as i32),
                    &boundary.name_en,
                    &boundary.name_local,
                    &(boundary.kind == BoundaryKind::Maritime),
                ],
            )
            .await?;
        Ok(GeometrySource { source_text: body })
    }
}

// ── Import + re-geotag flows ───────────────────────────────────────────────

/// Existing per-country state used for change detection.
async fn load_existing(
    db: &Db,
) -> Result<BTreeMap<i64, (i64, BoundingBox)>, IngestError> {
    let rows = db
        .client
        .query(
            "SELECT country_id, geom_hash, bbox_west, bbox_south, bbox_east, bbox_north
             FROM countries",
            &[],
        )
        .await?;
    let mut out = BTreeMap::new();
    for r in rows {
        let id: i32 = r.get(0);
        out.insert(
            id as i64,
            (
                r.get::<_, i64>(1),
                BoundingBox {
                    west: r.get(2),
                    south: r.get(3),
                    east: r.get(4),
                    north: r.get(5),
                },
            ),
        );
    }
    Ok(out)
}

/// Upsert one boundary from a GeoJSON geometry string. Validity is repaired
/// on the way in and the bounding box recomputed server-side.
async fn upsert_from_geojson(
    db: &Db,
    boundary: &BoundaryRef,
    geometry_json: &str,
    geom_hash: i64,
) -> Result<(), IngestError> {
    db.client
        .execute(
            "INSERT INTO countries
                (country_id, name_en, name_local, is_maritime, geom,
                 bbox_west, bbox_south, bbox_east, bbox_north, geom_hash,
                 updated, last_update_attempt, update_failed)
             SELECT $1, $2, $3, $4, g.geom,
                    ST_XMin(g.geom), ST_YMin(g.geom), ST_XMax(g.geom), ST_YMax(g.geom), $6,
                    FALSE, now(), FALSE
             FROM (SELECT ST_Multi(ST_CollectionExtract(
                              ST_MakeValid(ST_SetSRID(ST_GeomFromGeoJSON($5), 4326)), 3))
                          AS geom) g
             ON CONFLICT (country_id) DO UPDATE
             SET name_en = excluded.name_en,
                 name_local = excluded.name_local,
                 is_maritime = excluded.is_maritime,
                 geom = excluded.geom,
                 bbox_west = excluded.bbox_west,
                 bbox_south = excluded.bbox_south,
                 bbox_east = excluded.bbox_east,
                 bbox_north = excluded.bbox_north,
                 geom_hash = excluded.geom_hash,
                 updated = FALSE,
                 last_update_attempt = now(),
                 update_failed = FALSE",
            &[
                &(boundary.relation_id as i32),
                &boundary.name_en,
                &boundary.name_local,
                &(boundary.kind == BoundaryKind::Maritime),
                &geometry_json,
                &geom_hash,
            ],
        )
        .await?;
    Ok(())
}

/// Promote the external importer's `country_import` rows into `countries`.
async fn promote_import_table(
    db: &Db,
    boundary: &BoundaryRef,
    geom_hash: i64,
) -> Result<(), IngestError> {
    let touched = db
        .client
        .execute(
            "INSERT INTO countries
                (country_id, name_en, name_local, is_maritime, geom,
                 bbox_west, bbox_south, bbox_east, bbox_north, geom_hash,
                 updated, last_update_attempt, update_failed)
             SELECT $1, $2, $3, $4, g.geom,
                    ST_XMin(g.geom), ST_YMin(g.geom), ST_XMax(g.geom), ST_YMax(g.geom), $5,
                    FALSE, now(), FALSE
             FROM (SELECT ST_Multi(ST_CollectionExtract(
                              ST_Union(ST_MakeValid(geom)), 3)) AS geom
                   FROM country_import
                   WHERE geom IS NOT NULL) g
             WHERE g.geom IS NOT NULL
             ON CONFLICT (country_id) DO UPDATE
             SET name_en = excluded.name_en,
                 name_local = excluded.name_local,
                 is_maritime = excluded.is_maritime,
                 geom = excluded.geom,
                 bbox_west = excluded.bbox_west,
                 bbox_south = excluded.bbox_south,
                 bbox_east = excluded.bbox_east,
                 bbox_north = excluded.bbox_north,
                 geom_hash = excluded.geom_hash,
                 updated = FALSE,
                 last_update_attempt = now(),
                 update_failed = FALSE",
            &[
                &(boundary.relation_id as i32),
                &boundary.name_en,
                &boundary.name_local,
                &(boundary.kind == BoundaryKind::Maritime),
                &geom_hash,
            ],
        )
        .await?;
    if touched == 0 {
        return Err(IngestError::BoundaryFetchFailed {
            relation_id: boundary.relation_id,
            reason: "importer produced no usable geometry".into(),
        });
    }
    Ok(())
}

/// Full boundary refresh.
///
/// `update_mode` marks all existing countries beforehand and finishes with
/// the affected-notes re-geotag; the initial import (no notes geotagged yet)
/// skips both.
pub async fn refresh_boundaries<I: GeometryImporter>(
    db: &Db,
    http: &HttpClient,
    importer: &I,
    baseline: &Baseline,
    retry: RetrySpec,
    update_mode: bool,
) -> Result<BoundaryRefreshOutcome, IngestError> {
    db.run_script(DdlScript::BoundaryTables).await?;

    let refs = fetch_boundary_refs(http).await?;
    let shipped = baseline.features()?;
    let existing = load_existing(db).await?;
    let mut outcome = BoundaryRefreshOutcome::default();

    if update_mode {
        db.client
            .execute(
                "UPDATE countries SET updated = TRUE, last_update_attempt = now()",
                &[],
            )
            .await?;
    }

    let use_baseline = !ids_drifted(&refs, &shipped);
    if use_baseline {
        tracing::info!(
            "boundary ids match baseline {} ({} relations), importing from baseline",
            &baseline.fingerprint()[..12],
            shipped.len()
        );
    } else {
        tracing::info!(
            "boundary id drift detected ({} live vs {} shipped), forcing per-id downloads",
            refs.len(),
            shipped.len()
        );
    }

    // Track the union of old and new bounding boxes per changed country so
    // the re-geotag pass can catch notes that left as well as notes that
    // arrived.
    let mut changed_boxes: Vec<(i64, BoundingBox)> = Vec::new();

    for r in &refs {
        let result = if use_baseline {
            let feature = shipped.get(&r.relation_id).ok_or_else(|| {
                IngestError::Internal(format!("baseline lost id {}", r.relation_id))
            })?;
            let hash = xxh3_64(feature.geometry_json.as_bytes()) as i64;
            import_one_from_baseline(db, feature, hash, &existing, &mut outcome, &mut changed_boxes)
                .await
        } else {
            import_one_via_importer(db, importer, r, retry, &existing, &mut outcome, &mut changed_boxes)
                .await
        };
        if let Err(e) = result {
            // A single stubborn boundary does not sink the whole refresh;
            // it stays flagged and is retried next round.
            tracing::warn!("boundary {} failed: {e}", r.relation_id);
            outcome.failed.push(r.relation_id);
        }
    }

    if update_mode {
        db.client
            .execute(
                "UPDATE countries SET update_failed = TRUE WHERE updated",
                &[],
            )
            .await?;
    }

    // With polygons in place the stub lookup gives way to the spatial one.
    db.run_script(DdlScript::GetCountrySpatial).await?;

    if update_mode && !changed_boxes.is_empty() {
        outcome.notes_regeotagged = regeotag_affected(db, &changed_boxes).await?;
    }

    // Refusing everything is a refresh failure, not a partial success.
    if outcome.imported == 0 && !refs.is_empty() {
        let first = outcome.failed.first().copied().unwrap_or(0);
        return Err(IngestError::BoundaryFetchFailed {
            relation_id: first,
            reason: "no boundary could be imported".into(),
        });
    }
    Ok(outcome)
}

async fn import_one_from_baseline(
    db: &Db,
    feature: &BaselineFeature,
    hash: i64,
    existing: &BTreeMap<i64, (i64, BoundingBox)>,
    outcome: &mut BoundaryRefreshOutcome,
    changed_boxes: &mut Vec<(i64, BoundingBox)>,
) -> Result<(), IngestError> {
    let id = feature.reference.relation_id;
    let prior = existing.get(&id);
    upsert_from_geojson(db, &feature.reference, &feature.geometry_json, hash).await?;
    outcome.imported += 1;
    record_change(db, id, hash, prior, outcome, changed_boxes).await
}

async fn import_one_via_importer<I: GeometryImporter>(
    db: &Db,
    importer: &I,
    boundary: &BoundaryRef,
    retry: RetrySpec,
    existing: &BTreeMap<i64, (i64, BoundingBox)>,
    outcome: &mut BoundaryRefreshOutcome,
    changed_boxes: &mut Vec<(i64, BoundingBox)>,
) -> Result<(), IngestError> {
    let id = boundary.relation_id;
    let prior = existing.get(&id);
    let source = retry_fixed("boundary import", retry, || importer.import(db, boundary)).await?;
    let hash = xxh3_64(source.source_text.as_bytes()) as i64;
    promote_import_table(db, boundary, hash).await?;
    outcome.imported += 1;
    record_change(db, id, hash, prior, outcome, changed_boxes).await
}

/// Note a changed (or new) geometry and collect its old∪new bounding box.
async fn record_change(
    db: &Db,
    id: i64,
    new_hash: i64,
    prior: Option<&(i64, BoundingBox)>,
    outcome: &mut BoundaryRefreshOutcome,
    changed_boxes: &mut Vec<(i64, BoundingBox)>,
) -> Result<(), IngestError> {
    let unchanged = prior.is_some_and(|(h, _)| *h == new_hash);
    if unchanged {
        return Ok(());
    }
    outcome.changed.push(id);

    let row = db
        .client
        .query_one(
            "SELECT bbox_west, bbox_south, bbox_east, bbox_north
             FROM countries WHERE country_id = $1",
            &[&(id as i32)],
        )
        .await?;
    let mut bbox = BoundingBox {
        west: row.get(0),
        south: row.get(1),
        east: row.get(2),
        north: row.get(3),
    };
    if let Some((_, old)) = prior {
        bbox.west = bbox.west.min(old.west);
        bbox.south = bbox.south.min(old.south);
        bbox.east = bbox.east.max(old.east);
        bbox.north = bbox.north.max(old.north);
    }
    changed_boxes.push((id, bbox));
    Ok(())
}

/// Re-run the spatial lookup for notes affected by the changed boundaries.
async fn regeotag_affected(
    db: &Db,
    changed: &[(i64, BoundingBox)],
) -> Result<u64, IngestError> {
    db.batch(
        "CREATE TEMP TABLE IF NOT EXISTS refreshed_boundaries (
             country_id INTEGER,
             bbox_west DOUBLE PRECISION,
             bbox_south DOUBLE PRECISION,
             bbox_east DOUBLE PRECISION,
             bbox_north DOUBLE PRECISION);
         TRUNCATE refreshed_boundaries",
    )
    .await?;
    for (id, b) in changed {
        db.client
            .execute(
                "INSERT INTO refreshed_boundaries VALUES ($1, $2, $3, $4, $5)",
                &[&(*id as i32), &b.west, &b.south, &b.east, &b.north],
            )
            .await?;
    }
    let updated = db
        .client
        .execute(DdlScript::RegeotagAffected.sql(), &[])
        .await?;
    tracing::info!(
        "re-geotagged {updated} notes across {} changed boundaries",
        changed.len()
    );
    Ok(updated)
}
