//! Size-adaptive XML validation.
//!
//! Small files (below [`FULL_VALIDATION_MAX_BYTES`]) get a full structural
//! pass: every note is parsed with the same reader the extractor uses, so a
//! document that validates is a document that extracts, and the two agree on
//! the note count. Large files get a streaming well-formedness pass with
//! bounded memory: declaration present, root element present, matched
//! open/close tag counts, matched `<note>` counts, plus date and coordinate
//! sanity on sampled notes.
//!
//! Date sanity applies everywhere: instants must parse, must not be in the
//! future, and must not predate the notes epoch.

use std::path::Path;

use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;

use crate::config::{DATE_EPOCH, FULL_VALIDATION_MAX_BYTES};
use crate::error::{IngestError, ValidationError};
use crate::extract::{NoteStream, XmlDialect, parse_instant};
use crate::monitor;

/// Every Nth note gets the detailed attribute checks in streaming mode.
const SAMPLE_EVERY: u64 = 997;

/// Tolerated clock skew, in minutes, before an instant counts as "in the
/// future".
const FUTURE_SKEW_MINUTES: i64 = 10;

/// Outcome of a successful validation.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub note_count: u64,
    pub bytes: u64,
    /// Whether every note was checked (small file) or only samples.
    pub fully_checked: bool,
    /// Peak RSS in kilobytes after the pass, when procfs is available.
    pub peak_rss_kb: Option<u64>,
}

/// Reject instants outside the sane range.
pub fn check_date_sane(dt: DateTime<Utc>, what: &str) -> Result<(), ValidationError> {
    let epoch = parse_instant(DATE_EPOCH).expect("epoch constant parses");
    if dt < epoch {
        return Err(ValidationError::Date(format!("{what}: {dt} predates the epoch {epoch}")));
    }
    if dt > Utc::now() + chrono::Duration::minutes(FUTURE_SKEW_MINUTES) {
        return Err(ValidationError::Date(format!("{what}: {dt} is in the future")));
    }
    Ok(())
}

/// Validate `path` as a notes document in the given dialect.
pub fn validate(path: &Path, dialect: XmlDialect) -> Result<ValidationReport, IngestError> {
    let meta = std::fs::metadata(path)
        .map_err(|_| ValidationError::NotFound(path.display().to_string()))?;
    let bytes = meta.len();

    let report = if bytes <= FULL_VALIDATION_MAX_BYTES {
        validate_full(path, dialect, bytes)?
    } else {
        validate_streaming(path, dialect, bytes)?
    };

    if let Some(kb) = report.peak_rss_kb {
        tracing::debug!(
            "validated {} ({} notes, {} bytes, peak rss {kb} KiB)",
            path.display(),
            report.note_count,
            report.bytes
        );
    }
    Ok(report)
}

/// Full pass: parse every note and sanity-check every instant.
fn validate_full(
    path: &Path,
    dialect: XmlDialect,
    bytes: u64,
) -> Result<ValidationReport, IngestError> {
    let mut stream = NoteStream::from_path(path, dialect)?;
    let mut note_count = 0u64;
    while let Some(parsed) = stream.next_note()? {
        let n = &parsed.note;
        check_date_sane(n.created_at, &format!("note {} created_at", n.note_id))?;
        if let Some(c) = n.closed_at {
            check_date_sane(c, &format!("note {} closed_at", n.note_id))?;
        }
        for c in &parsed.comments {
            check_date_sane(
                c.created_at,
                &format!("note {} comment {}", n.note_id, c.sequence_action),
            )?;
        }
        note_count += 1;
    }
    Ok(ValidationReport {
        note_count,
        bytes,
        fully_checked: true,
        peak_rss_kb: monitor::peak_rss_kb(),
    })
}

/// Streaming pass for large files: structure counters plus sampled checks.
fn validate_streaming(
    path: &Path,
    dialect: XmlDialect,
    bytes: u64,
) -> Result<ValidationReport, IngestError> {
    let file = std::fs::File::open(path)?;
    let mut reader = Reader::from_reader(std::io::BufReader::with_capacity(1 << 20, file));
    let mut buf = Vec::with_capacity(8192);

    let mut saw_decl = false;
    let mut saw_root = false;
    let mut depth: i64 = 0;
    let mut opens = 0u64;
    let mut closes = 0u64;
    let mut note_opens = 0u64;
    let mut note_closes = 0u64;

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Decl(_)) => saw_decl = true,
            Ok(Event::Start(e)) => {
                saw_root = true;
                depth += 1;
                opens += 1;
                if e.name().as_ref() == b"note" {
                    note_opens += 1;
                    if note_opens % SAMPLE_EVERY == 1 && dialect == XmlDialect::Planet {
                        sample_note_attrs(&e)?;
                    }
                }
            }
            Ok(Event::End(e)) => {
                depth -= 1;
                closes += 1;
                if e.name().as_ref() == b"note" {
                    note_closes += 1;
                }
                if depth < 0 {
                    return Err(ValidationError::Schema(
                        "close tag without matching open".into(),
                    )
                    .into());
                }
            }
            Ok(Event::Empty(e)) => {
                saw_root = true;
                if e.name().as_ref() == b"note" {
                    note_opens += 1;
                    note_closes += 1;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ValidationError::Schema(format!(
                    "XML error at byte {}: {e}",
                    reader.buffer_position()
                ))
                .into());
            }
        }
    }

    if !saw_decl {
        return Err(ValidationError::Schema("missing XML declaration".into()).into());
    }
    if !saw_root {
        return Err(ValidationError::Schema("missing root element".into()).into());
    }
    if depth != 0 || opens != closes {
        return Err(ValidationError::Schema(format!(
            "unbalanced tags: {opens} opens vs {closes} closes"
        ))
        .into());
    }
    if note_opens != note_closes {
        return Err(ValidationError::Schema(format!(
            "unbalanced note tags: {note_opens} opens vs {note_closes} closes"
        ))
        .into());
    }

    Ok(ValidationReport {
        note_count: note_opens,
        bytes,
        fully_checked: false,
        peak_rss_kb: monitor::peak_rss_kb(),
    })
}

/// Count `<note>` elements without any sanity checking. The trusted-input
/// fast path still needs the count for the large-delta decision.
pub fn count_notes(path: &Path) -> Result<u64, IngestError> {
    let file = std::fs::File::open(path)
        .map_err(|_| ValidationError::NotFound(path.display().to_string()))?;
    let mut reader = Reader::from_reader(std::io::BufReader::with_capacity(1 << 20, file));
    let mut buf = Vec::with_capacity(8192);
    let mut count = 0u64;
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == b"note" => {
                count += 1;
            }
            Ok(Event::Eof) => return Ok(count),
            Ok(_) => {}
            Err(e) => {
                return Err(ValidationError::Schema(format!("XML error: {e}")).into());
            }
        }
    }
}

/// Check coordinates and dates on one sampled Planet `<note>` start tag.
fn sample_note_attrs(e: &quick_xml::events::BytesStart<'_>) -> Result<(), IngestError> {
    let mut lat: Option<f64> = None;
    let mut lon: Option<f64> = None;
    let mut created: Option<String> = None;

    for attr in e.attributes() {
        let attr = attr.map_err(|err| ValidationError::Schema(format!("bad attribute: {err}")))?;
        let value = attr
            .unescape_value()
            .map_err(|err| ValidationError::Schema(format!("bad attribute value: {err}")))?;
        match attr.key.as_ref() {
            b"lat" => lat = value.parse().ok(),
            b"lon" => lon = value.parse().ok(),
            b"created_at" => created = Some(value.into_owned()),
            _ => {}
        }
    }

    match (lat, lon) {
        (Some(lat), Some(lon)) => {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(ValidationError::Coord(format!(
                    "sampled note has out-of-range coordinates ({lat}, {lon})"
                ))
                .into());
            }
        }
        _ => {
            return Err(
                ValidationError::Coord("sampled note is missing coordinates".into()).into(),
            );
        }
    }
    if let Some(raw) = created {
        check_date_sane(parse_instant(&raw)?, "sampled note created_at")?;
    }
    Ok(())
}
