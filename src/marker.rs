//! Crash-safe failure markers.
//!
//! A marker is a single JSON file recording the last failure of a named
//! process: what failed, with which exit code, and what the operator should
//! do about it. A present marker gates startup; batch entry points and the
//! daemon refuse to run until it is cleared.
//!
//! The one exception is the `internet_issue` kind: the daemon clears it by
//! itself when a fresh network probe succeeds, because a past outage that is
//! over needs no operator.
//!
//! Writes are best-effort crash-safe: the primary path is tried first, then
//! a per-process fallback under the system temp dir, so a full disk or a
//! permissions regression on the base dir does not lose the record.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// The on-disk failure record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub process_name: String,
    /// Classification kind from [`IngestError::marker_kind`].
    pub kind: String,
    pub exit_code: i32,
    pub message: String,
    /// The operation that failed, as reported by the failing call site.
    pub failing_operation: String,
    pub required_action: String,
    pub pid: u32,
    pub temp_dir: PathBuf,
}

/// Gate outcome when checking for a previous failure.
#[derive(Debug)]
pub enum MarkerState {
    Absent,
    Present(FailureRecord),
}

/// Marker file manager for one named process.
#[derive(Debug, Clone)]
pub struct FailureMarker {
    primary: PathBuf,
    fallback: PathBuf,
    process_name: String,
}

impl FailureMarker {
    pub fn new(primary: PathBuf, fallback: PathBuf, process_name: &str) -> Self {
        Self {
            primary,
            fallback,
            process_name: process_name.to_string(),
        }
    }

    /// Persist a failure record. Tries the primary path, falls back to the
    /// per-process temp path; only fails if both are unwritable.
    pub fn write(
        &self,
        err: &IngestError,
        failing_operation: &str,
        required_action: &str,
        temp_dir: &Path,
    ) -> Result<(), IngestError> {
        let record = FailureRecord {
            timestamp: Utc::now(),
            process_name: self.process_name.clone(),
            kind: err.marker_kind().to_string(),
            exit_code: err.exit_code(),
            message: err.to_string(),
            failing_operation: failing_operation.to_string(),
            required_action: required_action.to_string(),
            pid: std::process::id(),
            temp_dir: temp_dir.to_path_buf(),
        };
        let body = serde_json::to_string_pretty(&record)
            .map_err(|e| IngestError::Internal(format!("marker serialization: {e}")))?;

        if let Some(parent) = self.primary.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match fs::write(&self.primary, &body) {
            Ok(()) => Ok(()),
            Err(primary_err) => {
                tracing::warn!(
                    "marker write to {} failed ({primary_err}), using fallback {}",
                    self.primary.display(),
                    self.fallback.display()
                );
                fs::write(&self.fallback, &body).map_err(IngestError::from)
            }
        }
    }

    /// Check both locations for a marker.
    pub fn check(&self) -> Result<MarkerState, IngestError> {
        for path in [&self.primary, &self.fallback] {
            match fs::read_to_string(path) {
                Ok(raw) => {
                    let record: FailureRecord = serde_json::from_str(&raw).map_err(|e| {
                        IngestError::Internal(format!(
                            "corrupt failure marker {}: {e}",
                            path.display()
                        ))
                    })?;
                    return Ok(MarkerState::Present(record));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(MarkerState::Absent)
    }

    /// Remove the marker from both locations.
    pub fn clear(&self) -> Result<(), IngestError> {
        for path in [&self.primary, &self.fallback] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Startup gate. Returns `Ok(())` when no marker blocks the run.
    ///
    /// `network_ok` is the result of a fresh liveness probe; it only matters
    /// for `internet_issue` markers, which self-heal when the network is back.
    pub fn gate(&self, network_ok: bool) -> Result<(), IngestError> {
        match self.check()? {
            MarkerState::Absent => Ok(()),
            MarkerState::Present(record) if record.kind == "internet_issue" && network_ok => {
                tracing::info!(
                    "clearing internet_issue marker from {} (probe succeeded)",
                    record.timestamp
                );
                self.clear()?;
                Ok(())
            }
            MarkerState::Present(record) => Err(IngestError::PreviousRunFailed {
                kind: record.kind,
                message: format!(
                    "{} (at {}, exit {}); {}",
                    record.message, record.timestamp, record.exit_code, record.required_action
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    fn marker_in(dir: &Path) -> FailureMarker {
        FailureMarker::new(
            dir.join("markers/test.json"),
            dir.join("fallback.json"),
            "test",
        )
    }

    #[test]
    fn test_write_check_clear() {
        let dir = tempfile::tempdir().unwrap();
        let m = marker_in(dir.path());

        assert!(matches!(m.check().unwrap(), MarkerState::Absent));

        let err = IngestError::Validation(ValidationError::Coord("latitude 90.0000001".into()));
        m.write(&err, "validate planet dump", "inspect the dump and clear the marker", dir.path())
            .unwrap();

        match m.check().unwrap() {
            MarkerState::Present(rec) => {
                assert_eq!(rec.kind, "data_validation");
                assert_eq!(rec.exit_code, 250);
                assert_eq!(rec.pid, std::process::id());
            }
            MarkerState::Absent => panic!("marker missing after write"),
        }

        m.clear().unwrap();
        assert!(matches!(m.check().unwrap(), MarkerState::Absent));
    }

    #[test]
    fn test_fallback_path_used_when_primary_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        // Primary under a path that is a file, so create_dir_all/write fail.
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, b"").unwrap();
        let m = FailureMarker::new(
            blocked.join("markers/test.json"),
            dir.path().join("fallback.json"),
            "test",
        );

        let err = IngestError::PlanetLoadFailed("copy aborted".into());
        m.write(&err, "planet load", "re-run sync mode", dir.path())
            .unwrap();
        assert!(dir.path().join("fallback.json").exists());
        assert!(matches!(m.check().unwrap(), MarkerState::Present(_)));
    }

    #[test]
    fn test_gate_blocks_without_self_heal() {
        let dir = tempfile::tempdir().unwrap();
        let m = marker_in(dir.path());
        let err = IngestError::Validation(ValidationError::Schema("tag mismatch".into()));
        m.write(&err, "validate", "fix input", dir.path()).unwrap();

        // Even a healthy network does not clear a data_validation marker.
        let gate = m.gate(true).unwrap_err();
        assert_eq!(gate.exit_code(), 238);
        assert!(matches!(m.check().unwrap(), MarkerState::Present(_)));
    }

    #[test]
    fn test_gate_self_heals_internet_issue() {
        let dir = tempfile::tempdir().unwrap();
        let m = marker_in(dir.path());
        let err = IngestError::NetworkUnreachable("dns failure".into());
        m.write(&err, "api probe", "check connectivity", dir.path())
            .unwrap();

        // Probe still failing: gate blocks.
        assert_eq!(m.gate(false).unwrap_err().exit_code(), 238);

        // Probe succeeds: marker clears and the gate opens.
        m.gate(true).unwrap();
        assert!(matches!(m.check().unwrap(), MarkerState::Absent));
    }
}
