//! Runtime configuration for notetide.
//!
//! All knobs are hydrated from the environment once at process start; no
//! other options are honored. Defaults follow the documented resource
//! envelope: 3 retries at 2 s, 100 000 notes per part, 60 s target cycle
//! interval.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{IngestError, RetrySpec};

/// Per-part note cap for the XML splitter. Bounds peak memory per worker.
pub const PART_NOTE_CAP: u64 = 100_000;

/// Consecutive failed cycles before the daemon writes a marker and exits.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Connect and total timeout for the API liveness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Total timeout for full API delta fetches.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Notes created within this window with zero comments count as gaps.
pub const GAP_WINDOW_DAYS: i64 = 7;

/// More gaps than this in one check is a hard error.
pub const GAP_THRESHOLD: i64 = 100;

/// Earliest instant any note date may carry. OSM Notes launched in 2013;
/// anything older is corrupt input.
pub const DATE_EPOCH: &str = "2013-01-01T00:00:00Z";

/// Files larger than this skip full structural validation and get the
/// streaming well-formedness pass instead.
pub const FULL_VALIDATION_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Runtime configuration, hydrated from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum severity emitted (`LOG_LEVEL`, default `info`).
    pub log_level: String,
    /// Remove temp artifacts on success (`CLEAN`, default true).
    pub clean: bool,
    /// Worker-pool upper bound (`MAX_THREADS`, default: available cores).
    pub max_threads: usize,
    /// Large-delta escalation threshold (`MAX_NOTES`, default 10 000).
    pub max_notes: u64,
    /// Target cycle interval in seconds (`DAEMON_SLEEP_INTERVAL`, default 60).
    pub daemon_sleep_interval: Duration,
    /// Fast path for trusted inputs (`SKIP_XML_VALIDATION`, default false).
    pub skip_xml_validation: bool,
    /// Test affordance; never set in production (`SKIP_AUTO_LOAD_COUNTRIES`).
    pub skip_auto_load_countries: bool,
    /// Enable out-of-band alerting (`SEND_ALERT_EMAIL`, default false).
    pub send_alert_email: bool,

    /// PostgreSQL connection string (`DATABASE_URL`).
    pub database_url: String,
    /// OSM Notes API base (`OSM_API_URL`).
    pub api_url: String,
    /// Planet notes dump URL (`PLANET_URL`).
    pub planet_url: String,
    /// Overpass interpreter endpoint (`OVERPASS_URL`).
    pub overpass_url: String,
    /// Filesystem root for locks, markers, temp and log dirs
    /// (`NOTETIDE_BASE_DIR`, default `/tmp/notetide`).
    pub base_dir: PathBuf,
    /// Directory holding the shipped GeoJSON boundary baselines
    /// (`BOUNDARY_BASELINE_DIR`, default `data`).
    pub baseline_dir: PathBuf,
    /// Cron expression for the slow boundary-refresh track
    /// (`BOUNDARY_REFRESH_SCHEDULE`, default monthly).
    pub boundary_schedule: String,
    /// External geometry importer command (`GEOMETRY_IMPORTER`, default
    /// `ogr2ogr`).
    pub geometry_importer: String,

    /// Fixed-interval retry applied to statements and downloads.
    pub retry: RetrySpec,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            clean: true,
            max_threads: default_threads(),
            max_notes: 10_000,
            daemon_sleep_interval: Duration::from_secs(60),
            skip_xml_validation: false,
            skip_auto_load_countries: false,
            send_alert_email: false,
            database_url: String::new(),
            api_url: "https://api.openstreetmap.org/api/0.6".into(),
            planet_url: "https://planet.openstreetmap.org/notes/planet-notes-latest.osn.gz"
                .into(),
            overpass_url: "https://overpass-api.de/api/interpreter".into(),
            base_dir: PathBuf::from("/tmp/notetide"),
            baseline_dir: PathBuf::from("data"),
            boundary_schedule: "0 2 1 * *".into(),
            geometry_importer: "ogr2ogr".into(),
            retry: RetrySpec::default(),
        }
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn env_bool(name: &str, default: bool) -> Result<bool, IngestError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            other => Err(IngestError::InvalidArgument(format!(
                "{name}={other} is not a boolean"
            ))),
        },
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, IngestError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) => v
            .parse()
            .map_err(|_| IngestError::InvalidArgument(format!("{name}={v} failed to parse"))),
    }
}

impl Config {
    /// Hydrate from the environment. Unset options keep their defaults;
    /// malformed values are an [`IngestError::InvalidArgument`].
    pub fn from_env() -> Result<Self, IngestError> {
        let d = Config::default();
        Ok(Config {
            log_level: env_parse("LOG_LEVEL", d.log_level)?,
            clean: env_bool("CLEAN", d.clean)?,
            max_threads: env_parse("MAX_THREADS", d.max_threads)?.max(1),
            max_notes: env_parse("MAX_NOTES", d.max_notes)?.max(1),
            daemon_sleep_interval: Duration::from_secs(
                env_parse("DAEMON_SLEEP_INTERVAL", d.daemon_sleep_interval.as_secs())?,
            ),
            skip_xml_validation: env_bool("SKIP_XML_VALIDATION", d.skip_xml_validation)?,
            skip_auto_load_countries: env_bool(
                "SKIP_AUTO_LOAD_COUNTRIES",
                d.skip_auto_load_countries,
            )?,
            send_alert_email: env_bool("SEND_ALERT_EMAIL", d.send_alert_email)?,
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| IngestError::InvalidArgument("DATABASE_URL is not set".into()))?,
            api_url: env_parse("OSM_API_URL", d.api_url)?,
            planet_url: env_parse("PLANET_URL", d.planet_url)?,
            overpass_url: env_parse("OVERPASS_URL", d.overpass_url)?,
            base_dir: env_parse("NOTETIDE_BASE_DIR", d.base_dir)?,
            baseline_dir: env_parse("BOUNDARY_BASELINE_DIR", d.baseline_dir)?,
            boundary_schedule: env_parse("BOUNDARY_REFRESH_SCHEDULE", d.boundary_schedule)?,
            geometry_importer: env_parse("GEOMETRY_IMPORTER", d.geometry_importer)?,
            retry: RetrySpec::default(),
        })
    }

    /// User agent sent on every HTTP request.
    pub fn user_agent(&self) -> String {
        format!("notetide/{} (+https://github.com/grove/notetide)", env!("CARGO_PKG_VERSION"))
    }
}

// ── Filesystem layout ──────────────────────────────────────────────────────

/// Well-known paths for one named process, all derived from the base dir.
///
/// Layout under `base_dir`:
/// `locks/writer.lock` (shared by every writer), `markers/<name>.json`,
/// `logs/` (stderr redirect target), `tmp/<name>.<uuid>/`, and `shutdown`
/// (shared flag).
#[derive(Debug, Clone)]
pub struct ProcessPaths {
    pub process_name: String,
    base: PathBuf,
    /// Per-process temp directory with a random suffix. Created lazily.
    temp: PathBuf,
}

impl ProcessPaths {
    pub fn new(base: &Path, process_name: &str) -> Self {
        let temp = base
            .join("tmp")
            .join(format!("{process_name}.{}", uuid::Uuid::new_v4()));
        Self {
            process_name: process_name.to_string(),
            base: base.to_path_buf(),
            temp,
        }
    }

    /// The writer lock shared by every pipeline that mutates the replica.
    /// The daemon, the Planet loader, and the boundary refresher all contend
    /// on this one path, whatever their own process names are.
    pub fn writer_lock_file(&self) -> PathBuf {
        self.base.join("locks").join("writer.lock")
    }

    pub fn marker_file(&self) -> PathBuf {
        self.base.join("markers").join(format!("{}.json", self.process_name))
    }

    /// Fallback marker location used when the primary path is unwritable.
    pub fn marker_fallback(&self) -> PathBuf {
        std::env::temp_dir().join(format!("notetide-{}.marker.json", self.process_name))
    }

    pub fn shutdown_flag(&self) -> PathBuf {
        self.base.join("shutdown")
    }

    /// The per-process temp directory, created on first call.
    pub fn temp_dir(&self) -> std::io::Result<&Path> {
        std::fs::create_dir_all(&self.temp)?;
        Ok(&self.temp)
    }

    /// Ensure the shared directories exist. `logs/` is where service units
    /// are expected to point stderr; the process itself logs to stderr only.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for d in ["locks", "markers", "logs", "tmp"] {
            std::fs::create_dir_all(self.base.join(d))?;
        }
        Ok(())
    }

    /// Remove the per-process temp directory. Honors `CLEAN`.
    pub fn clean_temp(&self) {
        let _ = std::fs::remove_dir_all(&self.temp);
    }
}
