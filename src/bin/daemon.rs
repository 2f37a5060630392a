//! `notetide-daemon` — the long-running sync daemon.

use clap::Parser;

use notetide::daemon::Daemon;
use notetide::error::{EXIT_HELP, IngestError};
use notetide::{IngestContext, init_tracing};

#[derive(Parser, Debug)]
#[command(
    name = "notetide-daemon",
    about = "Continuously replicates OSM Notes into PostgreSQL/PostGIS",
    disable_version_flag = true
)]
struct Cli {}

fn main() {
    // Help and usage errors exit with their own codes before any setup.
    if let Err(e) = Cli::try_parse() {
        use clap::error::ErrorKind;
        let code = match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                let _ = e.print();
                EXIT_HELP
            }
            _ => {
                let _ = e.print();
                242
            }
        };
        std::process::exit(code);
    }

    std::process::exit(run());
}

#[tokio::main]
async fn run() -> i32 {
    let result = async {
        let ctx = IngestContext::from_env("daemon")?;
        init_tracing(&ctx.config.log_level)?;
        Daemon::new(ctx).run().await
    }
    .await;

    match result {
        Ok(()) => 0,
        Err(e) => {
            report(&e);
            e.exit_code()
        }
    }
}

fn report(e: &IngestError) {
    // One-line summary on stderr; the log carries full context.
    eprintln!("notetide-daemon: {e}");
}
