//! Error types for notetide.
//!
//! All failures inside the pipeline are represented by [`IngestError`].
//! Errors are propagated via `Result<T, IngestError>` throughout the codebase
//! and converted to process exit codes and failure markers at the binary
//! boundary.
//!
//! # Error Classification
//!
//! Every error maps onto a closed set of exit codes consumed by the failure
//! marker and the previous-failure gate:
//!
//! | Code | Meaning | Retryable by daemon |
//! |------|---------|---------------------|
//! | 238  | previous execution failed, marker present | no |
//! | 241  | missing library or command | no |
//! | 242  | invalid argument | no |
//! | 243  | logger bootstrap failed | no |
//! | 244  | Overpass id list unavailable | yes |
//! | 245  | no watermark, base mode required | no |
//! | 246  | another writer holds the process lock | yes |
//! | 248  | Planet dump path failed | yes |
//! | 249  | boundary fetch failed | yes |
//! | 250  | XML or CSV content rejected | conditional |
//! | 251  | download path unreachable | yes, with probe |
//! | 255  | unclassified | depends on cause |
//!
//! # Retry
//!
//! The fixed-interval retry helper lives here next to the taxonomy. Database
//! statements, API fetches, and boundary downloads go through [`retry_fixed`]
//! with a [`RetrySpec`]; on exhaustion the last error surfaces unchanged.

use std::time::Duration;

/// Exit code for `--help` (informational).
pub const EXIT_HELP: i32 = 1;

/// Primary error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    // ── Gate errors — operator action required ───────────────────────────
    /// A failure marker from a previous run is present.
    #[error("previous execution failed ({kind}): {message}")]
    PreviousRunFailed { kind: String, message: String },

    // ── Environment errors — never retried ───────────────────────────────
    /// A required external command is not installed.
    #[error("required command not found: {0}")]
    MissingCommand(String),

    /// CLI misuse.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The tracing subscriber could not be installed.
    #[error("logger initialization failed: {0}")]
    LoggerInit(String),

    /// No watermark row exists; base mode must run first.
    #[error("no watermark present; run the Planet base mode first")]
    WatermarkMissing,

    /// The base-tables check returned something other than a clean
    /// present/absent answer. Never interpreted as "missing".
    #[error("ambiguous base-tables state: {0}")]
    AmbiguousTablesState(String),

    // ── Contention — retryable next cycle ────────────────────────────────
    /// Another writer with the same process name is running on this host.
    #[error("process lock busy: {0}")]
    WriterContention(String),

    /// The database logical lock is held by another process id.
    #[error("database logical lock busy: {0}")]
    LogicalLockBusy(String),

    // ── Pipeline errors ──────────────────────────────────────────────────
    /// The Planet download/load path failed.
    #[error("planet dump processing failed: {0}")]
    PlanetLoadFailed(String),

    /// A single boundary could not be fetched or imported.
    #[error("boundary {relation_id} fetch failed: {reason}")]
    BoundaryFetchFailed { relation_id: i64, reason: String },

    /// The Overpass id-list query failed for a boundary kind.
    #[error("boundary id list unavailable: {0}")]
    BoundaryIdsUnavailable(String),

    /// XML or CSV content was rejected by validation.
    #[error("data validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// More notes without comments than the configured gap threshold.
    #[error("gap check failed: {affected} of {total} recent notes have no comments")]
    GapThresholdExceeded { affected: i64, total: i64 },

    // ── Transport errors ─────────────────────────────────────────────────
    /// A download path is unreachable (DNS, connect, timeout).
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// An HTTP request completed with an unexpected status.
    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    // ── Wrapped lower layers ─────────────────────────────────────────────
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    // ── Internal errors — should not happen ──────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Validation sub-kinds, all surfacing as exit code 250.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The document is not well-formed or violates the expected structure.
    #[error("schema error: {0}")]
    Schema(String),

    /// A date failed to parse or lies outside the sane range.
    #[error("date error: {0}")]
    Date(String),

    /// A coordinate is missing or out of range.
    #[error("coordinate error: {0}")]
    Coord(String),

    /// The file to validate does not exist.
    #[error("file not found: {0}")]
    NotFound(String),
}

impl From<quick_xml::Error> for IngestError {
    fn from(e: quick_xml::Error) -> Self {
        IngestError::Validation(ValidationError::Schema(e.to_string()))
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            IngestError::NetworkUnreachable(e.to_string())
        } else {
            IngestError::Internal(format!("http error: {e}"))
        }
    }
}

impl IngestError {
    /// The process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            IngestError::PreviousRunFailed { .. } => 238,
            IngestError::MissingCommand(_) => 241,
            IngestError::InvalidArgument(_) => 242,
            IngestError::LoggerInit(_) => 243,
            IngestError::BoundaryIdsUnavailable(_) => 244,
            IngestError::WatermarkMissing => 245,
            IngestError::WriterContention(_) => 246,
            IngestError::PlanetLoadFailed(_) => 248,
            IngestError::BoundaryFetchFailed { .. } => 249,
            IngestError::Validation(_) | IngestError::GapThresholdExceeded { .. } => 250,
            IngestError::NetworkUnreachable(_) => 251,
            IngestError::LogicalLockBusy(_)
            | IngestError::HttpStatus { .. }
            | IngestError::AmbiguousTablesState(_)
            | IngestError::Db(_)
            | IngestError::Io(_)
            | IngestError::Csv(_)
            | IngestError::Internal(_) => 255,
        }
    }

    /// Whether the daemon may simply try again next cycle.
    ///
    /// Non-retryable errors write a failure marker and stop the daemon;
    /// retryable ones only feed the consecutive-error breaker.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::WriterContention(_)
            | IngestError::LogicalLockBusy(_)
            | IngestError::BoundaryIdsUnavailable(_)
            | IngestError::PlanetLoadFailed(_)
            | IngestError::BoundaryFetchFailed { .. }
            | IngestError::NetworkUnreachable(_)
            | IngestError::HttpStatus { .. }
            | IngestError::Db(_) => true,

            IngestError::PreviousRunFailed { .. }
            | IngestError::MissingCommand(_)
            | IngestError::InvalidArgument(_)
            | IngestError::LoggerInit(_)
            | IngestError::WatermarkMissing
            | IngestError::AmbiguousTablesState(_)
            | IngestError::Validation(_)
            | IngestError::GapThresholdExceeded { .. }
            | IngestError::Io(_)
            | IngestError::Csv(_)
            | IngestError::Internal(_) => false,
        }
    }

    /// Marker kind string recorded in the failure marker.
    ///
    /// The daemon's startup gate treats `internet_issue` specially: the
    /// marker auto-clears if a fresh network probe succeeds.
    pub fn marker_kind(&self) -> &'static str {
        match self {
            IngestError::NetworkUnreachable(_) => "internet_issue",
            IngestError::Validation(_) | IngestError::GapThresholdExceeded { .. } => {
                "data_validation"
            }
            IngestError::WriterContention(_) | IngestError::LogicalLockBusy(_) => "contention",
            IngestError::BoundaryFetchFailed { .. } | IngestError::BoundaryIdsUnavailable(_) => {
                "boundary"
            }
            IngestError::PlanetLoadFailed(_) => "planet",
            _ => "general",
        }
    }
}

// ── Fixed-interval retry ───────────────────────────────────────────────────

/// Bounded fixed-interval retry settings.
///
/// Deliberately not exponential: the callers (statement execution, API
/// fetches, Overpass downloads) deal with short-lived contention where a
/// constant short pause is enough and predictable cycle timing matters more
/// than politeness curves.
#[derive(Debug, Clone, Copy)]
pub struct RetrySpec {
    /// Total number of attempts, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Run `op` up to `spec.attempts` times with a fixed pause between attempts.
///
/// On exhaustion the last error surfaces unchanged. Attempts after the first
/// log at `warn`.
pub async fn retry_fixed<T, F, Fut>(
    what: &str,
    spec: RetrySpec,
    mut op: F,
) -> Result<T, IngestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IngestError>>,
{
    let mut last = None;
    for attempt in 1..=spec.attempts.max(1) {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt < spec.attempts {
                    tracing::warn!(
                        "{what}: attempt {attempt}/{} failed, retrying in {:?}: {e}",
                        spec.attempts,
                        spec.delay
                    );
                    tokio::time::sleep(spec.delay).await;
                }
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| IngestError::Internal(format!("{what}: zero attempts"))))
}
