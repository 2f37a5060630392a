//! The long-lived sync daemon.
//!
//! Single-threaded cooperative supervisor: each cycle runs sequentially end
//! to end, and all concurrency inside a cycle (worker pools) is joined
//! before the cycle returns. Signals are observed between cycles and during
//! the inter-cycle sleep; an in-flight cycle is never killed, it settles.
//!
//! Per iteration: honor the shutdown flag, bootstrap if the schema is
//! missing, otherwise run one API sync cycle (or the boundary track when its
//! cron schedule is due). Success resets the consecutive-error counter;
//! retryable failures feed it; the breaker writes a failure marker and exits
//! after `MAX_CONSECUTIVE_ERRORS`.

use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::signal::unix::{SignalKind, signal};

use crate::IngestContext;
use crate::apisync::{CycleWork, run_api_cycle};
use crate::bootstrap::{importer_for, run_base_mode};
use crate::boundary::{Baseline, refresh_boundaries};
use crate::config::{Config, MAX_CONSECUTIVE_ERRORS};
use crate::db::{Db, TablesState};
use crate::error::IngestError;
use crate::fetch::HttpClient;
use crate::monitor::StatusSnapshot;
use crate::proclock::ProcessLock;

/// Check whether a cron schedule is due.
///
/// Returns `true` if `now >= next_occurrence(last_run, expr)`. A never-run
/// schedule is always due.
fn cron_is_due(expr: &str, last_run_epoch: Option<i64>) -> bool {
    use std::str::FromStr;

    let cron = match croner::Cron::from_str(expr) {
        Ok(c) => c,
        Err(_) => return false,
    };
    match last_run_epoch {
        None => true,
        Some(epoch) => {
            let last = match chrono::DateTime::from_timestamp(epoch, 0) {
                Some(t) => t,
                None => return true,
            };
            match cron.find_next_occurrence(&last, false) {
                Ok(next) => Utc::now() >= next,
                Err(_) => false,
            }
        }
    }
}

/// Detach from the controlling terminal so a hangup there cannot take the
/// daemon down with it. Failure means we already lead a session.
fn new_session() {
    // SAFETY: setsid takes no pointers and only mutates kernel process state.
    unsafe {
        libc::setsid();
    }
}

/// Daemon state carried across cycles.
pub struct Daemon {
    ctx: IngestContext,
    started_at: chrono::DateTime<Utc>,
    consecutive_errors: u32,
    cycles_completed: u64,
    last_cycle_secs: Option<f64>,
    last_watermark: Option<chrono::DateTime<Utc>>,
    /// Epoch seconds of the last boundary-track run.
    last_boundary_run: Option<i64>,
}

/// What one cycle reports back to the scheduler.
enum CycleOutcome {
    /// Real work happened; sleep subtracts the cycle duration.
    Worked,
    /// Probe short-circuit; sleep the full interval.
    Idle,
}

impl Daemon {
    pub fn new(ctx: IngestContext) -> Self {
        Self {
            ctx,
            started_at: Utc::now(),
            consecutive_errors: 0,
            cycles_completed: 0,
            last_cycle_secs: None,
            last_watermark: None,
            // The boundary track waits for its first scheduled tick; the
            // bootstrap path has just imported boundaries anyway.
            last_boundary_run: Some(Utc::now().timestamp()),
        }
    }

    /// Run until shutdown. `Ok(())` means a clean, flag-driven exit.
    pub async fn run(mut self) -> Result<(), IngestError> {
        new_session();

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| IngestError::Internal(format!("signal setup: {e}")))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| IngestError::Internal(format!("signal setup: {e}")))?;
        let mut sighup = signal(SignalKind::hangup())
            .map_err(|e| IngestError::Internal(format!("signal setup: {e}")))?;
        let mut sigusr1 = signal(SignalKind::user_defined1())
            .map_err(|e| IngestError::Internal(format!("signal setup: {e}")))?;

        // Previous-failure gate, with the internet_issue self-heal.
        let network_ok = self.ctx.http.network_ok().await;
        self.ctx.marker.gate(network_ok)?;

        // One writer per host for the daemon's whole lifetime.
        let lock = ProcessLock::acquire(
            &self.ctx.paths.writer_lock_file(),
            "daemon",
            self.ctx.paths.temp_dir()?,
        )?;

        tracing::info!(
            "daemon started (interval {:?}, max {} consecutive errors)",
            self.ctx.config.daemon_sleep_interval,
            MAX_CONSECUTIVE_ERRORS
        );

        let result = self
            .supervise(&mut sigterm, &mut sigint, &mut sighup, &mut sigusr1)
            .await;

        lock.release()?;
        if self.ctx.config.clean && result.is_ok() {
            self.ctx.paths.clean_temp();
        }
        result
    }

    async fn supervise(
        &mut self,
        sigterm: &mut tokio::signal::unix::Signal,
        sigint: &mut tokio::signal::unix::Signal,
        sighup: &mut tokio::signal::unix::Signal,
        sigusr1: &mut tokio::signal::unix::Signal,
    ) -> Result<(), IngestError> {
        loop {
            let flag = self.ctx.paths.shutdown_flag();
            if flag.exists() {
                std::fs::remove_file(&flag)?;
                tracing::info!("shutdown flag honored, exiting");
                return Ok(());
            }

            let cycle_start = Instant::now();
            let outcome = self.one_cycle().await;
            let elapsed = cycle_start.elapsed();

            let sleep_for = match outcome {
                Ok(work) => {
                    self.consecutive_errors = 0;
                    self.cycles_completed += 1;
                    self.last_cycle_secs = Some(elapsed.as_secs_f64());
                    match work {
                        CycleOutcome::Worked => self
                            .ctx
                            .config
                            .daemon_sleep_interval
                            .saturating_sub(elapsed),
                        CycleOutcome::Idle => self.ctx.config.daemon_sleep_interval,
                    }
                }
                Err(e) if !e.is_retryable() => {
                    self.write_marker(&e);
                    return Err(e);
                }
                Err(e) => {
                    self.consecutive_errors += 1;
                    tracing::error!(
                        "cycle failed ({}/{MAX_CONSECUTIVE_ERRORS}): {e}",
                        self.consecutive_errors
                    );
                    if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        self.write_marker(&e);
                        return Err(e);
                    }
                    self.ctx.config.daemon_sleep_interval
                }
            };

            self.interruptible_sleep(sleep_for, sigterm, sigint, sighup, sigusr1)
                .await?;
        }
    }

    /// One cycle: bootstrap when the schema is gone, else boundary track
    /// when due, else API sync.
    async fn one_cycle(&mut self) -> Result<CycleOutcome, IngestError> {
        let mut db = Db::connect(&self.ctx.config.database_url).await?;

        // Only a clean Missing/absent answer may trigger base mode; a query
        // error propagates instead of destroying a reachable replica.
        let schema_ready = match db.base_tables_state().await? {
            TablesState::Missing => false,
            TablesState::Present => db.watermark().await?.is_some(),
        };
        if !schema_ready {
            tracing::info!("schema or watermark missing, running base mode");
            run_base_mode(&self.ctx, &mut db).await?;
            self.last_watermark = db.watermark().await?;
            return Ok(CycleOutcome::Worked);
        }

        if cron_is_due(&self.ctx.config.boundary_schedule, self.last_boundary_run)
            && !self.ctx.config.skip_auto_load_countries
        {
            tracing::info!("boundary refresh schedule due");
            let importer = importer_for(&self.ctx)?;
            let baseline = Baseline::in_dir(&self.ctx.config.baseline_dir);
            refresh_boundaries(
                &db,
                &self.ctx.http,
                &importer,
                &baseline,
                self.ctx.config.retry,
                true,
            )
            .await?;
            self.last_boundary_run = Some(Utc::now().timestamp());
            return Ok(CycleOutcome::Worked);
        }

        let work = run_api_cycle(&self.ctx, &mut db).await?;
        self.last_watermark = db.watermark().await?;
        Ok(match work {
            CycleWork::NoUpdates => CycleOutcome::Idle,
            CycleWork::SmallDelta(_) | CycleWork::EscalatedToPlanet => CycleOutcome::Worked,
        })
    }

    /// Sleep for `duration`, waking early for signals.
    async fn interruptible_sleep(
        &mut self,
        duration: Duration,
        sigterm: &mut tokio::signal::unix::Signal,
        sigint: &mut tokio::signal::unix::Signal,
        sighup: &mut tokio::signal::unix::Signal,
        sigusr1: &mut tokio::signal::unix::Signal,
    ) -> Result<(), IngestError> {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                _ = sigterm.recv() => {
                    self.request_shutdown()?;
                    return Ok(());
                }
                _ = sigint.recv() => {
                    self.request_shutdown()?;
                    return Ok(());
                }
                _ = sighup.recv() => {
                    self.reload_config();
                }
                _ = sigusr1.recv() => {
                    tracing::info!("status: {}", self.snapshot().render());
                }
            }
        }
    }

    /// Create the shutdown flag; the loop head consumes it.
    fn request_shutdown(&self) -> Result<(), IngestError> {
        std::fs::write(self.ctx.paths.shutdown_flag(), b"")?;
        tracing::info!("shutdown requested");
        Ok(())
    }

    /// Re-read the environment. A broken new config keeps the old one.
    fn reload_config(&mut self) {
        match Config::from_env() {
            Ok(config) => match HttpClient::new(&config) {
                Ok(http) => {
                    tracing::info!("configuration reloaded");
                    self.ctx.config = config;
                    self.ctx.http = http;
                }
                Err(e) => tracing::warn!("config reload kept old client: {e}"),
            },
            Err(e) => tracing::warn!("config reload rejected: {e}"),
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            watermark: self.last_watermark,
            last_cycle_secs: self.last_cycle_secs,
            cycles_completed: self.cycles_completed,
            consecutive_errors: self.consecutive_errors,
        }
    }

    fn write_marker(&self, e: &IngestError) {
        let action = if e.is_retryable() {
            "inspect the log, then remove the marker to resume"
        } else {
            "fix the reported condition, then remove the marker"
        };
        let temp = self
            .ctx
            .paths
            .temp_dir()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|_| std::env::temp_dir());
        if let Err(marker_err) = self.ctx.marker.write(e, "daemon cycle", action, &temp) {
            tracing::error!("failure marker could not be written: {marker_err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_due_never_run() {
        assert!(cron_is_due("0 2 1 * *", None));
    }

    #[test]
    fn test_cron_not_due_right_after_run() {
        let now = Utc::now().timestamp();
        assert!(!cron_is_due("0 2 1 * *", Some(now)));
    }

    #[test]
    fn test_cron_due_after_long_gap() {
        let two_months_ago = Utc::now().timestamp() - 62 * 24 * 3600;
        assert!(cron_is_due("0 2 1 * *", Some(two_months_ago)));
    }

    #[test]
    fn test_bad_cron_never_due() {
        assert!(!cron_is_due("not a cron", Some(0)));
    }
}
