//! API sync orchestrator: one incremental cycle.
//!
//! With the writer lock held by the caller, a cycle probes for update
//! candidates, fetches the delta since the watermark, validates it, and then
//! either runs the small-file path (single-process extraction into API
//! staging, consolidate) or, for deltas at or beyond `MAX_NOTES`, escalates
//! to a full Planet reload whose own path refreshes the watermark.
//!
//! The previous-failure gate lives in the daemon; this orchestrator assumes
//! it is safe to run.

use std::path::Path;

use crate::bootstrap;
use crate::consolidate::{ConsolidationOutcome, StagingSet, consolidate};
use crate::db::Db;
use crate::error::IngestError;
use crate::extract::{XmlDialect, extract_to_csv};
use crate::load::{COMMENTS_COLUMNS, NOTES_COLUMNS, TEXT_COLUMNS};
use crate::schema::{API_STAGING_TABLES, DdlScript};
use crate::validate::{count_notes, validate};
use crate::IngestContext;

/// What one cycle ended up doing.
#[derive(Debug)]
pub enum CycleWork {
    /// The probe found nothing newer than the watermark.
    NoUpdates,
    /// The small-file path ran end to end.
    SmallDelta(ConsolidationOutcome),
    /// The delta met `MAX_NOTES`; the Planet reload path ran instead.
    EscalatedToPlanet,
}

/// Run one API sync cycle.
pub async fn run_api_cycle(
    ctx: &IngestContext,
    db: &mut Db,
) -> Result<CycleWork, IngestError> {
    let Some(watermark) = db.watermark().await? else {
        return Err(IngestError::WatermarkMissing);
    };

    // Step 1: bounded liveness probe; no candidates ends the cycle early.
    if !ctx.http.probe_updates(watermark).await? {
        tracing::debug!("no update candidates past {watermark}");
        return Ok(CycleWork::NoUpdates);
    }

    // Step 2: full incremental fetch since the watermark.
    let temp = ctx.paths.temp_dir()?.to_path_buf();
    let delta_path = temp.join("api-delta.xml");
    let bytes = ctx
        .http
        .fetch_deltas(watermark, ctx.config.max_notes, &delta_path)
        .await?;
    if bytes == 0 {
        return Err(IngestError::NetworkUnreachable(
            "delta fetch produced an empty document".into(),
        ));
    }

    // Steps 3–4: validate and count.
    let note_count = if ctx.config.skip_xml_validation {
        count_notes(&delta_path)?
    } else {
        validate(&delta_path, XmlDialect::Api)?.note_count
    };

    if note_count == 0 {
        // A probe hit with an empty delta: nothing to merge, nothing staged.
        return Ok(CycleWork::NoUpdates);
    }

    // Step 5: large deltas reload from the Planet instead; API staging is
    // never touched on this branch.
    if note_count >= ctx.config.max_notes {
        tracing::warn!(
            "delta of {note_count} notes meets MAX_NOTES={}, escalating to planet reload",
            ctx.config.max_notes
        );
        bootstrap::run_sync_mode(ctx, db).await?;
        return Ok(CycleWork::EscalatedToPlanet);
    }

    // Step 6: small-file path — no split, one extraction, API staging.
    let outcome = small_file_path(ctx, db, &delta_path, &temp).await;

    // Step 7: staging is truncated whatever happened above.
    let truncated = db.truncate(&API_STAGING_TABLES).await;
    let outcome = outcome?;
    truncated?;

    Ok(CycleWork::SmallDelta(outcome))
}

async fn small_file_path(
    ctx: &IngestContext,
    db: &mut Db,
    delta_path: &Path,
    temp: &Path,
) -> Result<ConsolidationOutcome, IngestError> {
    db.run_script(DdlScript::ApiStaging).await?;
    db.truncate(&API_STAGING_TABLES).await?;

    let (bundle, extracted) = {
        let input = delta_path.to_path_buf();
        let out = temp.to_path_buf();
        tokio::task::spawn_blocking(move || {
            extract_to_csv(&input, XmlDialect::Api, &out, "api")
        })
        .await
        .map_err(|e| IngestError::Internal(format!("extract task: {e}")))??
    };

    let [notes_t, comments_t, texts_t] = API_STAGING_TABLES;
    db.copy_csv(notes_t, NOTES_COLUMNS, &bundle.notes).await?;
    db.copy_csv(comments_t, COMMENTS_COLUMNS, &bundle.comments).await?;
    db.copy_csv(texts_t, TEXT_COLUMNS, &bundle.texts).await?;

    let outcome = consolidate(db, &StagingSet::api(), ctx.config.retry).await?;
    tracing::info!(
        "api cycle: {extracted} notes in delta, {} upserted, {} comments, watermark {:?}",
        outcome.notes_upserted,
        outcome.comments_inserted,
        outcome.watermark
    );
    Ok(outcome)
}
