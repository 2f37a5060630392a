//! Domain types mirroring the replica tables.
//!
//! These are plain data carriers; all persistence goes through `db` and
//! `consolidate`. Wire parsing (XML attribute strings) happens in `extract`
//! and `validate`, which construct these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a note. `hidden` is a status, not a deletion; hidden
/// notes keep their comment history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteStatus {
    Open,
    Closed,
    Hidden,
}

impl NoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteStatus::Open => "open",
            NoteStatus::Closed => "closed",
            NoteStatus::Hidden => "hidden",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(NoteStatus::Open),
            "closed" => Some(NoteStatus::Closed),
            "hidden" => Some(NoteStatus::Hidden),
            _ => None,
        }
    }
}

/// Event kind carried by a note comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentAction {
    Opened,
    Commented,
    Closed,
    Reopened,
    Hidden,
}

impl CommentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommentAction::Opened => "opened",
            CommentAction::Commented => "commented",
            CommentAction::Closed => "closed",
            CommentAction::Reopened => "reopened",
            CommentAction::Hidden => "hidden",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "opened" => Some(CommentAction::Opened),
            "commented" => Some(CommentAction::Commented),
            "closed" => Some(CommentAction::Closed),
            "reopened" => Some(CommentAction::Reopened),
            "hidden" => Some(CommentAction::Hidden),
            _ => None,
        }
    }
}

/// One note as extracted from Planet or API XML.
///
/// `updated_at` is computed during extraction as the greatest instant seen
/// across the note's own dates and its comments; the consolidator compares
/// it against the stored row to decide whether an upsert carries news.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub note_id: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: NoteStatus,
    pub id_country: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

/// One comment event. `sequence_action` is assigned during extraction and is
/// monotonic within a note, starting at 1.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteComment {
    pub note_id: i32,
    pub sequence_action: i32,
    pub event: CommentAction,
    pub created_at: DateTime<Utc>,
    pub id_user: Option<i32>,
    pub username: Option<String>,
}

/// Free-text body of a comment. Absent for events that carried no text.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteCommentText {
    pub note_id: i32,
    pub sequence_action: i32,
    pub body: String,
}

/// Axis-aligned bounding box in WGS84, `(west, south, east, north)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lon >= self.west && lon <= self.east && lat >= self.south && lat <= self.north
    }
}

/// An observed integrity defect, persisted to `note_gaps` for operators.
#[derive(Debug, Clone)]
pub struct GapRecord {
    pub gap_kind: &'static str,
    pub note_count: i64,
    pub affected: i64,
    pub percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [NoteStatus::Open, NoteStatus::Closed, NoteStatus::Hidden] {
            assert_eq!(NoteStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(NoteStatus::parse("reopened"), None);
    }

    #[test]
    fn test_action_round_trip() {
        for a in [
            CommentAction::Opened,
            CommentAction::Commented,
            CommentAction::Closed,
            CommentAction::Reopened,
            CommentAction::Hidden,
        ] {
            assert_eq!(CommentAction::parse(a.as_str()), Some(a));
        }
        assert_eq!(CommentAction::parse("open"), None);
    }

    #[test]
    fn test_bbox_contains_edges() {
        let b = BoundingBox {
            west: -10.0,
            south: -5.0,
            east: 10.0,
            north: 5.0,
        };
        assert!(b.contains(5.0, 10.0));
        assert!(b.contains(-5.0, -10.0));
        assert!(!b.contains(5.01, 0.0));
    }
}
