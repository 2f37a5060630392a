//! `notetide-planet` — Planet dump processing.
//!
//! Sync mode by default (reload into an existing schema); `--base` rebuilds
//! the replica from scratch, boundaries included.

use clap::Parser;

use notetide::bootstrap::{run_base_mode, run_sync_mode};
use notetide::db::Db;
use notetide::error::{EXIT_HELP, IngestError};
use notetide::proclock::ProcessLock;
use notetide::{IngestContext, init_tracing};

#[derive(Parser, Debug)]
#[command(
    name = "notetide-planet",
    about = "Loads the OSM Planet notes dump into the replica",
    disable_version_flag = true
)]
struct Cli {
    /// From-scratch bootstrap: drop and re-create the replica schema first.
    #[arg(long)]
    base: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_HELP,
                _ => 242,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    std::process::exit(run(cli.base));
}

#[tokio::main]
async fn run(base: bool) -> i32 {
    match planet_main(base).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("notetide-planet: {e}");
            e.exit_code()
        }
    }
}

async fn planet_main(base: bool) -> Result<(), IngestError> {
    let ctx = IngestContext::from_env("planet")?;
    init_tracing(&ctx.config.log_level)?;

    // Batch entry points never self-heal markers.
    ctx.marker.gate(false)?;

    let mut lock = ProcessLock::acquire(
        &ctx.paths.writer_lock_file(),
        "planet",
        ctx.paths.temp_dir()?,
    )?;
    // The load runs in-process under this same lock scope; the transition is
    // still recorded for operators watching the lock file.
    lock.record_handoff(if base {
        "base mode planet load starting"
    } else {
        "sync mode planet load starting"
    })?;

    let result = async {
        let mut db = Db::connect(&ctx.config.database_url).await?;
        if base {
            run_base_mode(&ctx, &mut db).await
        } else {
            run_sync_mode(&ctx, &mut db).await
        }
    }
    .await;

    lock.release()?;

    match result {
        Ok(()) => {
            if ctx.config.clean {
                ctx.paths.clean_temp();
            }
            Ok(())
        }
        Err(e) => {
            let temp = ctx
                .paths
                .temp_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|_| std::env::temp_dir());
            let _ = ctx.marker.write(
                &e,
                if base { "planet base mode" } else { "planet sync mode" },
                "inspect the log and the temp directory, then remove the marker",
                &temp,
            );
            Err(e)
        }
    }
}
