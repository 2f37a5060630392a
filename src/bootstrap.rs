//! Planet bootstrap: base mode and sync mode.
//!
//! Base mode builds the replica from nothing: drop and re-create the schema,
//! load the full Planet dump through the parallel pipeline, import
//! boundaries, and give every note a country in one bulk pass. Sync mode
//! reloads the Planet into an existing schema (the large-delta escape hatch)
//! and only touches boundaries when the shipped baseline has drifted.
//!
//! Base mode is destructive, so it is only ever entered on an unambiguous
//! "tables missing" answer; sync mode refuses to run without the schema
//! rather than silently re-bootstrapping over live data.

use std::path::{Path, PathBuf};

use crate::IngestContext;
use crate::boundary::{
    Baseline, OgrImporter, fetch_boundary_refs, ids_drifted, refresh_boundaries,
};
use crate::consolidate::{StagingSet, consolidate};
use crate::db::{Db, TablesState};
use crate::error::IngestError;
use crate::extract::XmlDialect;
use crate::load::load_parts;
use crate::schema::DdlScript;
use crate::split::{plan_parts, split_notes_xml};
use crate::validate::{count_notes, validate};

/// From-scratch bootstrap. Destroys and rebuilds the replica.
pub async fn run_base_mode(ctx: &IngestContext, db: &mut Db) -> Result<(), IngestError> {
    tracing::info!("base mode: rebuilding replica from scratch");

    db.run_script(DdlScript::ApiStagingDrop).await?;
    db.run_script(DdlScript::SyncStagingDrop).await?;
    db.run_script(DdlScript::MainTablesDrop).await?;

    db.run_script(DdlScript::MainTables).await?;
    db.run_script(DdlScript::ApiStaging).await?;
    db.run_script(DdlScript::BoundaryTables).await?;
    db.run_script(DdlScript::LockProcs).await?;
    db.run_script(DdlScript::GetCountryStub).await?;
    db.run_script(DdlScript::MonitorViews).await?;

    planet_pipeline(ctx, db).await?;

    if ctx.config.skip_auto_load_countries {
        tracing::warn!("SKIP_AUTO_LOAD_COUNTRIES set: notes stay without countries");
    } else {
        let importer = importer_for(ctx)?;
        let baseline = Baseline::in_dir(&ctx.config.baseline_dir);
        refresh_boundaries(db, &ctx.http, &importer, &baseline, ctx.config.retry, false).await?;

        // One bulk pass now that get_country is the spatial version. Insert
        // time saw the stub, so every note is still unassigned.
        let assigned = db
            .client
            .execute(
                "UPDATE notes SET id_country = get_country(latitude, longitude)",
                &[],
            )
            .await?;
        tracing::info!("assigned countries to {assigned} notes");
    }

    db.vacuum_analyze(&["notes", "note_comments", "note_comments_text"])
        .await?;
    tracing::info!("base mode complete");
    Ok(())
}

/// Routine Planet reload into an existing schema.
pub async fn run_sync_mode(ctx: &IngestContext, db: &mut Db) -> Result<(), IngestError> {
    match db.base_tables_state().await? {
        TablesState::Present => {}
        // Re-bootstrapping here would destroy data; the operator has to ask
        // for base mode explicitly.
        TablesState::Missing => return Err(IngestError::WatermarkMissing),
    }

    db.run_script(DdlScript::SyncStagingDrop).await?;
    planet_pipeline(ctx, db).await?;

    if !ctx.config.skip_auto_load_countries {
        opportunistic_boundary_refresh(ctx, db).await;
    }
    Ok(())
}

/// Boundary refresh only when the live id set no longer matches the baseline.
/// Best-effort: a failure here is logged and retried on the slow schedule.
async fn opportunistic_boundary_refresh(ctx: &IngestContext, db: &Db) {
    let baseline = Baseline::in_dir(&ctx.config.baseline_dir);
    let drifted = match (fetch_boundary_refs(&ctx.http).await, baseline.features()) {
        (Ok(refs), Ok(shipped)) => ids_drifted(&refs, &shipped),
        (Err(e), _) => {
            tracing::warn!("boundary drift check skipped: {e}");
            return;
        }
        (_, Err(e)) => {
            tracing::warn!("boundary baseline unreadable: {e}");
            return;
        }
    };
    if !drifted {
        return;
    }
    tracing::info!("boundary id drift detected, refreshing boundaries");
    let importer = match importer_for(ctx) {
        Ok(i) => i,
        Err(e) => {
            tracing::warn!("boundary refresh skipped: {e}");
            return;
        }
    };
    if let Err(e) =
        refresh_boundaries(db, &ctx.http, &importer, &baseline, ctx.config.retry, true).await
    {
        tracing::warn!("opportunistic boundary refresh failed: {e}");
    }
}

pub fn importer_for(ctx: &IngestContext) -> Result<OgrImporter, IngestError> {
    Ok(OgrImporter {
        command: ctx.config.geometry_importer.clone(),
        database_url: ctx.config.database_url.clone(),
        http: ctx.http.clone(),
        temp_dir: ctx.paths.temp_dir()?.to_path_buf(),
    })
}

/// Download → decompress → validate → split → load → consolidate.
async fn planet_pipeline(ctx: &IngestContext, db: &mut Db) -> Result<(), IngestError> {
    let temp = ctx.paths.temp_dir()?.to_path_buf();
    let compressed = ctx.config.planet_url.ends_with(".gz");
    let download_path = temp.join(if compressed { "planet.osn.gz" } else { "planet.osn" });

    let bytes = ctx.http.download_planet(&download_path).await?;
    tracing::info!("planet dump downloaded: {bytes} bytes");

    let xml_path = if compressed {
        let out = temp.join("planet.osn");
        gunzip(&download_path, &out).await?;
        out
    } else {
        download_path
    };

    let total = if ctx.config.skip_xml_validation {
        count_notes(&xml_path)?
    } else {
        validate(&xml_path, XmlDialect::Planet)?.note_count
    };
    tracing::info!("planet dump holds {total} notes");

    let plan = plan_parts(total, ctx.config.max_threads);
    let parts_dir = temp.join("parts");
    std::fs::create_dir_all(&parts_dir)?;
    let parts = {
        let xml = xml_path.clone();
        let dir = parts_dir.clone();
        tokio::task::spawn_blocking(move || split_notes_xml(&xml, &dir, plan))
            .await
            .map_err(|e| IngestError::Internal(format!("split task: {e}")))??
    };

    load_parts(&ctx.config.database_url, &parts, ctx.config.max_threads, &parts_dir)
        .await
        .map_err(as_planet_failure)?;

    consolidate(db, &StagingSet::sync_parts(parts.len()), ctx.config.retry)
        .await
        .map_err(as_planet_failure)?;

    // Spent staging is dead weight between reloads.
    db.run_script(DdlScript::SyncStagingDrop).await?;
    Ok(())
}

/// Fold pipeline-internal failures into the Planet exit code while keeping
/// the kinds the daemon treats specially.
fn as_planet_failure(e: IngestError) -> IngestError {
    match e {
        IngestError::Validation(_)
        | IngestError::NetworkUnreachable(_)
        | IngestError::HttpStatus { .. }
        | IngestError::LogicalLockBusy(_)
        | IngestError::GapThresholdExceeded { .. } => e,
        other => IngestError::PlanetLoadFailed(other.to_string()),
    }
}

/// Decompress a gzip file, streaming, off the async runtime.
async fn gunzip(src: &Path, dst: &Path) -> Result<PathBuf, IngestError> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<PathBuf, IngestError> {
        let input = std::fs::File::open(&src)?;
        let mut decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(input));
        let mut out = std::io::BufWriter::new(std::fs::File::create(&dst)?);
        std::io::copy(&mut decoder, &mut out)?;
        Ok(dst)
    })
    .await
    .map_err(|e| IngestError::Internal(format!("gunzip task: {e}")))?
}
