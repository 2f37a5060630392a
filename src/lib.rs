//! notetide — a continuously-updated local replica of the OpenStreetMap
//! Notes dataset in PostgreSQL/PostGIS.
//!
//! The pipeline bootstraps from the Planet notes dump, then keeps current by
//! polling the OSM Notes API for deltas, escalating back to a full Planet
//! reload when a delta is too large to trust the incremental path. Every
//! note is geotagged against country and maritime boundaries sourced from
//! Overpass, and boundary refreshes re-geotag only the notes a changed
//! polygon could have affected.
//!
//! # Coordination
//!
//! Three guarantees hold across every entry point:
//! - one writer per host (advisory file lock with stale-pid reclaim),
//! - one consolidator per database (stored-procedure logical lock),
//! - no run while a previous failure marker is standing.
//!
//! # References
//!
//! - OSM Notes API: <https://wiki.openstreetmap.org/wiki/API_v0.6#Map_Notes_API>
//! - Planet notes dump: <https://planet.openstreetmap.org/notes/>
//! - Overpass API: <https://wiki.openstreetmap.org/wiki/Overpass_API>

pub mod apisync;
pub mod bootstrap;
pub mod boundary;
pub mod config;
pub mod consolidate;
pub mod daemon;
pub mod db;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod load;
pub mod marker;
pub mod model;
pub mod monitor;
pub mod proclock;
pub mod schema;
pub mod split;
pub mod validate;

use crate::config::{Config, ProcessPaths};
use crate::error::IngestError;
use crate::fetch::HttpClient;
use crate::marker::FailureMarker;

/// Everything a pipeline run carries instead of global state: configuration,
/// derived filesystem paths, the HTTP client, and the failure marker.
pub struct IngestContext {
    pub config: Config,
    pub paths: ProcessPaths,
    pub http: HttpClient,
    pub marker: FailureMarker,
}

impl IngestContext {
    /// Build a context for the named process from the environment.
    pub fn from_env(process_name: &str) -> Result<Self, IngestError> {
        Self::with_config(Config::from_env()?, process_name)
    }

    pub fn with_config(config: Config, process_name: &str) -> Result<Self, IngestError> {
        let paths = ProcessPaths::new(&config.base_dir, process_name);
        paths.ensure_layout()?;
        let marker = FailureMarker::new(
            paths.marker_file(),
            paths.marker_fallback(),
            process_name,
        );
        let http = HttpClient::new(&config)?;
        Ok(Self {
            config,
            paths,
            http,
            marker,
        })
    }
}

/// Install the tracing subscriber. `LOG_LEVEL` (or a full `RUST_LOG`
/// directive) sets the minimum severity.
pub fn init_tracing(log_level: &str) -> Result<(), IngestError> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| IngestError::LoggerInit(e.to_string()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| IngestError::LoggerInit(e.to_string()))
}
