//! The SQL contract, embedded by stable script name.
//!
//! The DDL lives in `sql/` and is treated as an opaque contract: the code
//! refers to scripts by name and never constructs DDL strings beyond the
//! partition-number substitution for the sync staging scheme.

/// The shipped SQL scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlScript {
    MainTables,
    MainTablesDrop,
    ApiStaging,
    ApiStagingDrop,
    SyncStagingDrop,
    BoundaryTables,
    BoundaryTablesDrop,
    LockProcs,
    GetCountryStub,
    GetCountrySpatial,
    RegeotagAffected,
    MonitorViews,
}

impl DdlScript {
    /// Stable script name, matching the file under `sql/`.
    pub fn name(&self) -> &'static str {
        match self {
            DdlScript::MainTables => "main_tables.sql",
            DdlScript::MainTablesDrop => "main_tables_drop.sql",
            DdlScript::ApiStaging => "api_staging.sql",
            DdlScript::ApiStagingDrop => "api_staging_drop.sql",
            DdlScript::SyncStagingDrop => "sync_staging_drop.sql",
            DdlScript::BoundaryTables => "boundary_tables.sql",
            DdlScript::BoundaryTablesDrop => "boundary_tables_drop.sql",
            DdlScript::LockProcs => "lock_procs.sql",
            DdlScript::GetCountryStub => "get_country_stub.sql",
            DdlScript::GetCountrySpatial => "get_country_spatial.sql",
            DdlScript::RegeotagAffected => "regeotag_affected.sql",
            DdlScript::MonitorViews => "monitor_views.sql",
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            DdlScript::MainTables => include_str!("../sql/main_tables.sql"),
            DdlScript::MainTablesDrop => include_str!("../sql/main_tables_drop.sql"),
            DdlScript::ApiStaging => include_str!("../sql/api_staging.sql"),
            DdlScript::ApiStagingDrop => include_str!("../sql/api_staging_drop.sql"),
            DdlScript::SyncStagingDrop => include_str!("../sql/sync_staging_drop.sql"),
            DdlScript::BoundaryTables => include_str!("../sql/boundary_tables.sql"),
            DdlScript::BoundaryTablesDrop => include_str!("../sql/boundary_tables_drop.sql"),
            DdlScript::LockProcs => include_str!("../sql/lock_procs.sql"),
            DdlScript::GetCountryStub => include_str!("../sql/get_country_stub.sql"),
            DdlScript::GetCountrySpatial => include_str!("../sql/get_country_spatial.sql"),
            DdlScript::RegeotagAffected => include_str!("../sql/regeotag_affected.sql"),
            DdlScript::MonitorViews => include_str!("../sql/monitor_views.sql"),
        }
    }
}

/// DDL for one sync staging partition.
pub fn sync_staging_part_sql(part: usize) -> String {
    include_str!("../sql/sync_staging_part.sql").replace("{part}", &part.to_string())
}

/// Names of the three staging tables of one sync partition.
pub fn sync_part_tables(part: usize) -> [String; 3] {
    [
        format!("notes_sync_part_{part}"),
        format!("note_comments_sync_part_{part}"),
        format!("note_comments_text_sync_part_{part}"),
    ]
}

/// The three API staging tables.
pub const API_STAGING_TABLES: [&str; 3] =
    ["notes_api", "note_comments_api", "note_comments_text_api"];
