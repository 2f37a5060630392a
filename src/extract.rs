//! Streaming extraction of notes XML into CSV.
//!
//! Two wire dialects exist for the same data:
//!
//! - **Planet**: attributes on `<note>` (`id`, `lat`, `lon`, `created_at`,
//!   optional `closed_at`), comments as
//!   `<comment action="..." timestamp="..." uid="..." user="...">body</comment>`.
//! - **Api**: child elements under `<note lon=".." lat="..">` (`<id>`,
//!   `<date_created>`, `<status>`, `<date_closed>`), comments as element
//!   groups under `<comments>`, each with `<date>`, `<uid>`, `<user>`,
//!   `<action>`, `<text>`.
//!
//! [`NoteStream`] yields one [`ParsedNote`] at a time with constant memory:
//! only the current note and its comments are ever held. No child ordering
//! is assumed beyond XML well-formedness.
//!
//! The CSV record contracts (consumed by the loader's COPY):
//! - notes: `note_id, latitude, longitude, created_at, closed_at, status, updated_at`
//! - comments: `note_id, event, created_at, id_user, username, sequence_action`
//! - text: `note_id, sequence_action, body` (bodies verbatim, CSV-quoted)

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::{IngestError, ValidationError};
use crate::model::{CommentAction, Note, NoteComment, NoteCommentText, NoteStatus};

/// Which XML layout to expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmlDialect {
    Planet,
    Api,
}

/// A fully parsed note with its ordered comments and text bodies.
#[derive(Debug, Clone)]
pub struct ParsedNote {
    pub note: Note,
    pub comments: Vec<NoteComment>,
    pub texts: Vec<NoteCommentText>,
}

/// Parse either RFC 3339 (`2013-04-24T08:07:02Z`, Planet) or the API's
/// `2019-06-15 08:26:04 UTC` form.
pub fn parse_instant(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw.trim_end_matches(" UTC"), "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .map_err(|_| ValidationError::Date(format!("unparseable instant: {raw}")))
}

fn attr_map(e: &BytesStart<'_>) -> Result<Vec<(String, String)>, IngestError> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr
            .map_err(|err| ValidationError::Schema(format!("bad attribute: {err}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| ValidationError::Schema(format!("bad attribute value: {err}")))?
            .into_owned();
        out.push((key, value));
    }
    Ok(out)
}

fn find<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

/// Streaming note reader over either dialect.
pub struct NoteStream<R: BufRead> {
    reader: Reader<R>,
    dialect: XmlDialect,
    buf: Vec<u8>,
}

impl NoteStream<BufReader<File>> {
    pub fn from_path(path: &Path, dialect: XmlDialect) -> Result<Self, IngestError> {
        if !path.exists() {
            return Err(ValidationError::NotFound(path.display().to_string()).into());
        }
        let file = File::open(path)?;
        Ok(Self::from_reader(BufReader::new(file), dialect))
    }
}

impl<R: BufRead> NoteStream<R> {
    pub fn from_reader(inner: R, dialect: XmlDialect) -> Self {
        let mut reader = Reader::from_reader(inner);
        reader.trim_text(true);
        Self {
            reader,
            dialect,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Advance to the next `<note>` and parse it fully. `Ok(None)` at EOF.
    pub fn next_note(&mut self) -> Result<Option<ParsedNote>, IngestError> {
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(e)) if e.name().as_ref() == b"note" => {
                    let attrs = attr_map(&e)?;
                    return match self.dialect {
                        XmlDialect::Planet => self.parse_planet_note(&attrs).map(Some),
                        XmlDialect::Api => self.parse_api_note(&attrs).map(Some),
                    };
                }
                Ok(Event::Empty(e)) if e.name().as_ref() == b"note" => {
                    // A note with no children has no comments; still surfaced
                    // so the consolidator's gap check can count it.
                    let attrs = attr_map(&e)?;
                    if self.dialect == XmlDialect::Planet {
                        return self.planet_note_from_attrs(&attrs, Vec::new(), Vec::new()).map(Some);
                    }
                    return Err(ValidationError::Schema(
                        "empty <note/> element in API document".into(),
                    )
                    .into());
                }
                Ok(Event::Eof) => return Ok(None),
                Ok(_) => {}
                Err(e) => {
                    return Err(ValidationError::Schema(format!(
                        "XML error at byte {}: {e}",
                        self.reader.buffer_position()
                    ))
                    .into());
                }
            }
        }
    }

    // ── Planet dialect ────────────────────────────────────────────────────

    fn parse_planet_note(
        &mut self,
        note_attrs: &[(String, String)],
    ) -> Result<ParsedNote, IngestError> {
        let mut comments: Vec<NoteComment> = Vec::new();
        let mut texts: Vec<NoteCommentText> = Vec::new();
        let note_id = parse_note_id(note_attrs)?;

        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(e)) if e.name().as_ref() == b"comment" => {
                    let attrs = attr_map(&e)?;
                    let seq = comments.len() as i32 + 1;
                    let body = self.read_text_until(b"comment")?;
                    comments.push(planet_comment(note_id, seq, &attrs)?);
                    if !body.is_empty() {
                        texts.push(NoteCommentText {
                            note_id,
                            sequence_action: seq,
                            body,
                        });
                    }
                }
                Ok(Event::Empty(e)) if e.name().as_ref() == b"comment" => {
                    let attrs = attr_map(&e)?;
                    let seq = comments.len() as i32 + 1;
                    comments.push(planet_comment(note_id, seq, &attrs)?);
                }
                Ok(Event::End(e)) if e.name().as_ref() == b"note" => {
                    return self.planet_note_from_attrs(note_attrs, comments, texts);
                }
                Ok(Event::Eof) => {
                    return Err(ValidationError::Schema(format!(
                        "unexpected EOF inside note {note_id}"
                    ))
                    .into());
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(
                        ValidationError::Schema(format!("XML error in note {note_id}: {e}")).into(),
                    );
                }
            }
        }
    }

    fn planet_note_from_attrs(
        &self,
        attrs: &[(String, String)],
        comments: Vec<NoteComment>,
        texts: Vec<NoteCommentText>,
    ) -> Result<ParsedNote, IngestError> {
        let note_id = parse_note_id(attrs)?;
        let lat = parse_coord(attrs, "lat", note_id)?;
        let lon = parse_coord(attrs, "lon", note_id)?;
        let created_at = parse_instant(
            find(attrs, "created_at").ok_or_else(|| {
                ValidationError::Date(format!("note {note_id}: missing created_at"))
            })?,
        )?;
        let attr_closed = find(attrs, "closed_at").map(parse_instant).transpose()?;

        Ok(assemble(note_id, lat, lon, created_at, attr_closed, comments, texts))
    }

    // ── API dialect ───────────────────────────────────────────────────────

    fn parse_api_note(
        &mut self,
        note_attrs: &[(String, String)],
    ) -> Result<ParsedNote, IngestError> {
        let lat_raw = find(note_attrs, "lat").map(str::to_owned);
        let lon_raw = find(note_attrs, "lon").map(str::to_owned);

        let mut note_id: Option<i32> = None;
        let mut created_at: Option<DateTime<Utc>> = None;
        let mut date_closed: Option<DateTime<Utc>> = None;
        let mut comments: Vec<NoteComment> = Vec::new();
        let mut texts: Vec<NoteCommentText> = Vec::new();

        loop {
            self.buf.clear();
            // The element name is copied out so the event's borrow of the
            // read buffer ends before any nested read below.
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(e)) => {
                    let name = e.name().as_ref().to_vec();
                    match name.as_slice() {
                        b"id" => {
                            let raw = self.read_text_until(b"id")?;
                            note_id = Some(raw.parse().map_err(|_| {
                                ValidationError::Schema(format!("bad note id: {raw}"))
                            })?);
                        }
                        b"date_created" => {
                            created_at =
                                Some(parse_instant(&self.read_text_until(b"date_created")?)?);
                        }
                        b"date_closed" => {
                            date_closed =
                                Some(parse_instant(&self.read_text_until(b"date_closed")?)?);
                        }
                        b"comment" => {
                            let id = note_id.ok_or_else(|| {
                                ValidationError::Schema("comment before <id>".into())
                            })?;
                            let seq = comments.len() as i32 + 1;
                            let (comment, body) = self.parse_api_comment(id, seq)?;
                            comments.push(comment);
                            if let Some(body) = body {
                                texts.push(NoteCommentText {
                                    note_id: id,
                                    sequence_action: seq,
                                    body,
                                });
                            }
                        }
                        // status, url, comments wrapper, and the rest carry
                        // no record data.
                        _ => {}
                    }
                }
                Ok(Event::End(e)) if e.name().as_ref() == b"note" => {
                    let note_id = note_id.ok_or_else(|| {
                        ValidationError::Schema("note without <id>".into())
                    })?;
                    let lat = parse_api_coord(lat_raw.as_deref(), "lat", note_id)?;
                    let lon = parse_api_coord(lon_raw.as_deref(), "lon", note_id)?;
                    let created_at = created_at.ok_or_else(|| {
                        ValidationError::Date(format!("note {note_id}: missing date_created"))
                    })?;
                    return Ok(assemble(
                        note_id, lat, lon, created_at, date_closed, comments, texts,
                    ));
                }
                Ok(Event::Eof) => {
                    return Err(ValidationError::Schema("unexpected EOF inside note".into()).into());
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(ValidationError::Schema(format!("XML error: {e}")).into());
                }
            }
        }
    }

    fn parse_api_comment(
        &mut self,
        note_id: i32,
        seq: i32,
    ) -> Result<(NoteComment, Option<String>), IngestError> {
        let mut instant: Option<DateTime<Utc>> = None;
        let mut uid: Option<i32> = None;
        let mut user: Option<String> = None;
        let mut action: Option<CommentAction> = None;
        let mut body: Option<String> = None;

        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(e)) => {
                    let name = e.name().as_ref().to_vec();
                    match name.as_slice() {
                        b"date" => {
                            instant = Some(parse_instant(&self.read_text_until(b"date")?)?)
                        }
                        b"uid" => {
                            let raw = self.read_text_until(b"uid")?;
                            uid = raw.parse().ok();
                        }
                        b"user" => user = Some(self.read_text_until(b"user")?),
                        b"action" => {
                            let raw = self.read_text_until(b"action")?;
                            action = Some(CommentAction::parse(&raw).ok_or_else(|| {
                                ValidationError::Schema(format!("unknown action: {raw}"))
                            })?);
                        }
                        b"text" => {
                            let t = self.read_text_until(b"text")?;
                            if !t.is_empty() {
                                body = Some(t);
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Event::End(e)) if e.name().as_ref() == b"comment" => {
                    let event = action.ok_or_else(|| {
                        ValidationError::Schema(format!(
                            "note {note_id} comment {seq}: missing action"
                        ))
                    })?;
                    let created_at = instant.ok_or_else(|| {
                        ValidationError::Date(format!(
                            "note {note_id} comment {seq}: missing date"
                        ))
                    })?;
                    return Ok((
                        NoteComment {
                            note_id,
                            sequence_action: seq,
                            event,
                            created_at,
                            id_user: uid,
                            username: user,
                        },
                        body,
                    ));
                }
                Ok(Event::Eof) => {
                    return Err(
                        ValidationError::Schema("unexpected EOF inside comment".into()).into()
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(ValidationError::Schema(format!("XML error: {e}")).into());
                }
            }
        }
    }

    /// Collect text content until the named end tag, preserving the body
    /// verbatim (entities unescaped).
    fn read_text_until(&mut self, end: &[u8]) -> Result<String, IngestError> {
        let mut out = String::new();
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Text(t)) => {
                    let piece = t
                        .unescape()
                        .map_err(|e| ValidationError::Schema(format!("bad text: {e}")))?;
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(&piece);
                }
                Ok(Event::CData(c)) => {
                    out.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
                Ok(Event::End(e)) if e.name().as_ref() == end => return Ok(out),
                Ok(Event::Eof) => {
                    return Err(ValidationError::Schema(format!(
                        "unexpected EOF inside <{}>",
                        String::from_utf8_lossy(end)
                    ))
                    .into());
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(ValidationError::Schema(format!("XML error: {e}")).into());
                }
            }
        }
    }
}

fn parse_note_id(attrs: &[(String, String)]) -> Result<i32, IngestError> {
    let raw = find(attrs, "id")
        .ok_or_else(|| ValidationError::Schema("note without id attribute".into()))?;
    raw.parse()
        .map_err(|_| ValidationError::Schema(format!("bad note id: {raw}")).into())
}

fn parse_coord(attrs: &[(String, String)], key: &str, note_id: i32) -> Result<f64, IngestError> {
    let raw = find(attrs, key).ok_or_else(|| {
        ValidationError::Coord(format!("note {note_id}: missing {key}"))
    })?;
    parse_coord_value(raw, key, note_id)
}

fn parse_api_coord(raw: Option<&str>, key: &str, note_id: i32) -> Result<f64, IngestError> {
    let raw = raw.ok_or_else(|| {
        ValidationError::Coord(format!("note {note_id}: missing {key}"))
    })?;
    parse_coord_value(raw, key, note_id)
}

fn parse_coord_value(raw: &str, key: &str, note_id: i32) -> Result<f64, IngestError> {
    let value: f64 = raw.parse().map_err(|_| {
        ValidationError::Coord(format!("note {note_id}: unparseable {key} {raw}"))
    })?;
    let limit = if key == "lat" { 90.0 } else { 180.0 };
    if !value.is_finite() || value < -limit || value > limit {
        return Err(
            ValidationError::Coord(format!("note {note_id}: {key} {value} out of range")).into(),
        );
    }
    Ok(value)
}

fn planet_comment(
    note_id: i32,
    seq: i32,
    attrs: &[(String, String)],
) -> Result<NoteComment, IngestError> {
    let action_raw = find(attrs, "action").ok_or_else(|| {
        ValidationError::Schema(format!("note {note_id} comment {seq}: missing action"))
    })?;
    let event = CommentAction::parse(action_raw).ok_or_else(|| {
        ValidationError::Schema(format!("unknown action: {action_raw}"))
    })?;
    let created_at = parse_instant(find(attrs, "timestamp").ok_or_else(|| {
        ValidationError::Date(format!("note {note_id} comment {seq}: missing timestamp"))
    })?)?;
    Ok(NoteComment {
        note_id,
        sequence_action: seq,
        event,
        created_at,
        id_user: find(attrs, "uid").and_then(|v| v.parse().ok()),
        username: find(attrs, "user").map(str::to_owned),
    })
}

/// Derive status/closure from the comment sequence and compute `updated_at`.
///
/// The last `closed`/`reopened`/`hidden` event wins; a bare `closed_at`
/// attribute (Planet) backstops dumps whose closing comment was redacted.
fn assemble(
    note_id: i32,
    latitude: f64,
    longitude: f64,
    created_at: DateTime<Utc>,
    attr_closed: Option<DateTime<Utc>>,
    comments: Vec<NoteComment>,
    texts: Vec<NoteCommentText>,
) -> ParsedNote {
    let mut status = NoteStatus::Open;
    let mut closed_at: Option<DateTime<Utc>> = None;
    for c in &comments {
        match c.event {
            CommentAction::Closed => {
                status = NoteStatus::Closed;
                closed_at = Some(c.created_at);
            }
            CommentAction::Reopened => {
                status = NoteStatus::Open;
                closed_at = None;
            }
            CommentAction::Hidden => {
                status = NoteStatus::Hidden;
            }
            CommentAction::Opened | CommentAction::Commented => {}
        }
    }
    if status == NoteStatus::Open && closed_at.is_none() {
        if let Some(attr) = attr_closed {
            status = NoteStatus::Closed;
            closed_at = Some(attr);
        }
    }

    let mut updated_at = created_at;
    if let Some(c) = closed_at {
        updated_at = updated_at.max(c);
    }
    for c in &comments {
        updated_at = updated_at.max(c.created_at);
    }

    ParsedNote {
        note: Note {
            note_id,
            latitude,
            longitude,
            created_at,
            closed_at,
            status,
            id_country: None,
            updated_at,
        },
        comments,
        texts,
    }
}

// ── CSV emission ───────────────────────────────────────────────────────────

/// The three CSV outputs for one extraction run.
#[derive(Debug, Clone)]
pub struct CsvBundle {
    pub notes: std::path::PathBuf,
    pub comments: std::path::PathBuf,
    pub texts: std::path::PathBuf,
}

fn fmt_instant(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Extract one XML file into three CSV files next to `stem`.
///
/// Streaming: one note in memory at a time. Returns the CSV paths and the
/// number of notes written.
pub fn extract_to_csv(
    input: &Path,
    dialect: XmlDialect,
    out_dir: &Path,
    stem: &str,
) -> Result<(CsvBundle, u64), IngestError> {
    let bundle = CsvBundle {
        notes: out_dir.join(format!("{stem}-notes.csv")),
        comments: out_dir.join(format!("{stem}-comments.csv")),
        texts: out_dir.join(format!("{stem}-text.csv")),
    };
    let mut notes_w = csv::Writer::from_path(&bundle.notes)?;
    let mut comments_w = csv::Writer::from_path(&bundle.comments)?;
    let mut texts_w = csv::Writer::from_path(&bundle.texts)?;

    let mut stream = NoteStream::from_path(input, dialect)?;
    let mut count = 0u64;
    while let Some(parsed) = stream.next_note()? {
        let n = &parsed.note;
        notes_w.write_record([
            n.note_id.to_string(),
            n.latitude.to_string(),
            n.longitude.to_string(),
            fmt_instant(&n.created_at),
            n.closed_at.as_ref().map(fmt_instant).unwrap_or_default(),
            n.status.as_str().to_string(),
            fmt_instant(&n.updated_at),
        ])?;
        for c in &parsed.comments {
            comments_w.write_record([
                c.note_id.to_string(),
                c.event.as_str().to_string(),
                fmt_instant(&c.created_at),
                c.id_user.map(|u| u.to_string()).unwrap_or_default(),
                c.username.clone().unwrap_or_default(),
                c.sequence_action.to_string(),
            ])?;
        }
        for t in &parsed.texts {
            texts_w.write_record([
                t.note_id.to_string(),
                t.sequence_action.to_string(),
                t.body.clone(),
            ])?;
        }
        count += 1;
    }
    notes_w.flush()?;
    comments_w.flush()?;
    texts_w.flush()?;
    Ok((bundle, count))
}
