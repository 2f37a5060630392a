//! `notetide-boundaries` — country and maritime boundary refresh.
//!
//! Runs the update-mode flow: every existing boundary is flagged, refreshed
//! from Overpass (or the shipped baseline when the id sets match), and notes
//! affected by changed polygons are re-geotagged.

use clap::Parser;

use notetide::bootstrap::importer_for;
use notetide::boundary::{Baseline, refresh_boundaries};
use notetide::db::Db;
use notetide::error::{EXIT_HELP, IngestError};
use notetide::proclock::ProcessLock;
use notetide::{IngestContext, init_tracing};

#[derive(Parser, Debug)]
#[command(
    name = "notetide-boundaries",
    about = "Refreshes country/maritime boundaries and re-geotags affected notes",
    disable_version_flag = true
)]
struct Cli {}

fn main() {
    if let Err(e) = Cli::try_parse() {
        use clap::error::ErrorKind;
        let code = match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_HELP,
            _ => 242,
        };
        let _ = e.print();
        std::process::exit(code);
    }
    std::process::exit(run());
}

#[tokio::main]
async fn run() -> i32 {
    match boundaries_main().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("notetide-boundaries: {e}");
            e.exit_code()
        }
    }
}

async fn boundaries_main() -> Result<(), IngestError> {
    let ctx = IngestContext::from_env("boundaries")?;
    init_tracing(&ctx.config.log_level)?;
    ctx.marker.gate(false)?;

    let lock = ProcessLock::acquire(
        &ctx.paths.writer_lock_file(),
        "boundaries",
        ctx.paths.temp_dir()?,
    )?;

    let result = async {
        let db = Db::connect(&ctx.config.database_url).await?;
        let importer = importer_for(&ctx)?;
        let baseline = Baseline::in_dir(&ctx.config.baseline_dir);
        let outcome =
            refresh_boundaries(&db, &ctx.http, &importer, &baseline, ctx.config.retry, true)
                .await?;
        tracing::info!(
            "boundary refresh: {} imported, {} changed, {} failed, {} notes re-geotagged",
            outcome.imported,
            outcome.changed.len(),
            outcome.failed.len(),
            outcome.notes_regeotagged
        );
        Ok(())
    }
    .await;

    lock.release()?;

    if let Err(e) = &result {
        let temp = ctx
            .paths
            .temp_dir()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|_| std::env::temp_dir());
        let _ = ctx.marker.write(
            e,
            "boundary refresh",
            "inspect Overpass availability and the log, then remove the marker",
            &temp,
        );
    }
    result
}
