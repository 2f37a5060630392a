//! Planet XML splitter.
//!
//! Streams a notes document into N part files. Each part is well-formed:
//! the original XML declaration and root element wrap a contiguous run of
//! `<note>` elements copied verbatim. Parts are the unit of work for the
//! parallel loader; the per-part note cap bounds each worker's peak memory.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesEnd, Event};
use quick_xml::{Reader, Writer};

use crate::config::PART_NOTE_CAP;
use crate::error::{IngestError, ValidationError};

/// How a document will be split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    /// Number of part files.
    pub parts: u64,
    /// Notes per part (the last part may be short).
    pub notes_per_part: u64,
}

/// Compute the part plan for `total_notes` with a target of `max_threads`
/// parts.
///
/// The target is clamped so no part exceeds [`PART_NOTE_CAP`] notes: when
/// the total spills over `target × cap`, the part count grows (rounded up)
/// and the worker pool simply takes multiple parts per worker.
pub fn plan_parts(total_notes: u64, max_threads: usize) -> PartPlan {
    let target = (max_threads as u64).max(1);
    if total_notes == 0 {
        return PartPlan {
            parts: 1,
            notes_per_part: PART_NOTE_CAP,
        };
    }
    // Start from the pool size, never more parts than notes, then grow the
    // part count whenever a part would exceed the cap.
    let mut parts = target.min(total_notes);
    if total_notes.div_ceil(parts) > PART_NOTE_CAP {
        parts = total_notes.div_ceil(PART_NOTE_CAP);
    }
    PartPlan {
        parts,
        notes_per_part: total_notes.div_ceil(parts),
    }
}

/// Split `input` into part files under `out_dir`, returning their paths in
/// order. Constant memory: one event at a time, one open writer.
pub fn split_notes_xml(
    input: &Path,
    out_dir: &Path,
    plan: PartPlan,
) -> Result<Vec<PathBuf>, IngestError> {
    let file = File::open(input)
        .map_err(|_| ValidationError::NotFound(input.display().to_string()))?;
    let mut reader = Reader::from_reader(std::io::BufReader::with_capacity(1 << 20, file));
    let mut buf = Vec::with_capacity(8192);

    let mut splitter = Splitter {
        out_dir: out_dir.to_path_buf(),
        per_part: plan.notes_per_part.max(1),
        decl: None,
        root: None,
        writer: None,
        notes_in_part: 0,
        parts: Vec::new(),
    };

    // Depth inside the current <note> element; None when between notes.
    let mut note_depth: Option<u32> = None;

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(event) => {
                match &event {
                    Event::Decl(_) if splitter.decl.is_none() => {
                        splitter.decl = Some(event.clone().into_owned());
                        continue;
                    }
                    Event::Start(e) => {
                        if note_depth.is_none() {
                            if e.name().as_ref() == b"note" {
                                note_depth = Some(0);
                                splitter.begin_note(&event)?;
                            } else if splitter.root.is_none() {
                                splitter.root = Some(event.clone().into_owned());
                            }
                            continue;
                        }
                        note_depth = note_depth.map(|d| d + 1);
                        splitter.copy(&event)?;
                    }
                    Event::End(e) => {
                        match note_depth {
                            Some(0) => {
                                // end of the current <note>
                                splitter.copy(&event)?;
                                splitter.end_note()?;
                                note_depth = None;
                            }
                            Some(d) => {
                                note_depth = Some(d - 1);
                                splitter.copy(&event)?;
                            }
                            None => {
                                // root close; remaining parts are finalized
                                // below
                                let _ = e;
                            }
                        }
                        continue;
                    }
                    Event::Empty(e) if note_depth.is_none() => {
                        if e.name().as_ref() == b"note" {
                            splitter.begin_note(&event)?;
                            splitter.end_note()?;
                        }
                        continue;
                    }
                    _ => {
                        if note_depth.is_some() {
                            splitter.copy(&event)?;
                        }
                        continue;
                    }
                }
            }
            Err(e) => {
                return Err(ValidationError::Schema(format!(
                    "XML error at byte {}: {e}",
                    reader.buffer_position()
                ))
                .into());
            }
        }
    }

    if note_depth.is_some() {
        return Err(ValidationError::Schema("unterminated note element".into()).into());
    }
    splitter.finish()
}

struct Splitter {
    out_dir: PathBuf,
    per_part: u64,
    decl: Option<Event<'static>>,
    root: Option<Event<'static>>,
    writer: Option<Writer<BufWriter<File>>>,
    notes_in_part: u64,
    parts: Vec<PathBuf>,
}

impl Splitter {
    /// Open the next part file if none is open, then copy the opening event.
    fn begin_note(&mut self, event: &Event<'_>) -> Result<(), IngestError> {
        if self.writer.is_none() {
            let path = self.out_dir.join(format!("part-{}.xml", self.parts.len()));
            let mut w = Writer::new(BufWriter::new(File::create(&path)?));
            if let Some(decl) = &self.decl {
                write_ev(&mut w, decl.clone())?;
            }
            if let Some(root) = &self.root {
                write_ev(&mut w, root.clone())?;
            }
            self.parts.push(path);
            self.writer = Some(w);
            self.notes_in_part = 0;
        }
        self.copy(event)
    }

    fn copy(&mut self, event: &Event<'_>) -> Result<(), IngestError> {
        let w = self
            .writer
            .as_mut()
            .ok_or_else(|| IngestError::Internal("copy outside part".into()))?;
        write_ev(w, event.clone())
    }

    /// Close the current part if it reached the per-part quota.
    fn end_note(&mut self) -> Result<(), IngestError> {
        self.notes_in_part += 1;
        if self.notes_in_part >= self.per_part {
            self.close_part()?;
        }
        Ok(())
    }

    fn close_part(&mut self) -> Result<(), IngestError> {
        if let Some(mut w) = self.writer.take() {
            if let Some(Event::Start(root)) = &self.root {
                let name = root.name().as_ref().to_vec();
                write_ev(&mut w, Event::End(BytesEnd::new(String::from_utf8_lossy(&name).into_owned())))?;
            }
            use std::io::Write as _;
            w.get_mut().flush()?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<PathBuf>, IngestError> {
        self.close_part()?;
        if self.parts.is_empty() {
            // Zero notes still yields one empty, well-formed part so the
            // rest of the pipeline has something to chew on.
            let path = self.out_dir.join("part-0.xml");
            let mut w = Writer::new(BufWriter::new(File::create(&path)?));
            if let Some(decl) = &self.decl {
                write_ev(&mut w, decl.clone())?;
            }
            if let Some(Event::Start(root)) = &self.root {
                let owned = root.clone();
                let name = String::from_utf8_lossy(owned.name().as_ref()).into_owned();
                write_ev(&mut w, Event::Start(owned))?;
                write_ev(&mut w, Event::End(BytesEnd::new(name)))?;
            }
            use std::io::Write as _;
            w.get_mut().flush()?;
            self.parts.push(path);
        }
        Ok(self.parts)
    }
}

fn write_ev<W: std::io::Write>(w: &mut Writer<W>, event: Event<'_>) -> Result<(), IngestError> {
    w.write_event(event)
        .map_err(|e| IngestError::Internal(format!("part write: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{NoteStream, XmlDialect};

    fn doc(n: usize) -> String {
        let mut s = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<osm-notes>\n");
        for i in 1..=n {
            s.push_str(&format!(
                "<note id=\"{i}\" lat=\"{}\" lon=\"{}\" created_at=\"2023-01-01T00:00:00Z\">\
<comment action=\"opened\" timestamp=\"2023-01-01T00:00:00Z\" uid=\"7\" user=\"u{i}\">body &amp; {i}</comment>\
</note>\n",
                (i % 90) as f64,
                (i % 180) as f64
            ));
        }
        s.push_str("</osm-notes>\n");
        s
    }

    fn notes_in(path: &Path) -> Vec<i32> {
        let mut stream = NoteStream::from_path(path, XmlDialect::Planet).unwrap();
        let mut ids = Vec::new();
        while let Some(p) = stream.next_note().unwrap() {
            ids.push(p.note.note_id);
        }
        ids
    }

    #[test]
    fn test_plan_caps_part_size() {
        let plan = plan_parts(1_000_000, 4);
        assert_eq!(plan.parts, 10);
        assert!(plan.notes_per_part <= PART_NOTE_CAP);

        let plan = plan_parts(250_000, 16);
        assert!(plan.notes_per_part <= PART_NOTE_CAP);
        assert!(plan.parts >= 3);

        let plan = plan_parts(50, 8);
        assert_eq!(plan.parts, 8.min(50));

        let plan = plan_parts(0, 8);
        assert_eq!(plan.parts, 1);
    }

    #[test]
    fn test_split_preserves_all_notes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.xml");
        std::fs::write(&input, doc(10)).unwrap();

        let parts = split_notes_xml(
            &input,
            dir.path(),
            PartPlan {
                parts: 3,
                notes_per_part: 4,
            },
        )
        .unwrap();
        assert_eq!(parts.len(), 3);

        let mut all = Vec::new();
        for p in &parts {
            let ids = notes_in(p);
            assert!(ids.len() <= 4);
            all.extend(ids);
        }
        assert_eq!(all, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_each_part_is_well_formed_with_original_root() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.xml");
        std::fs::write(&input, doc(5)).unwrap();

        let parts = split_notes_xml(
            &input,
            dir.path(),
            PartPlan {
                parts: 2,
                notes_per_part: 3,
            },
        )
        .unwrap();

        for p in &parts {
            let content = std::fs::read_to_string(p).unwrap();
            assert!(content.starts_with("<?xml"));
            assert!(content.contains("<osm-notes>"));
            assert!(content.ends_with("</osm-notes>"));
        }
    }

    #[test]
    fn test_split_preserves_entities_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.xml");
        std::fs::write(&input, doc(1)).unwrap();

        let parts = split_notes_xml(
            &input,
            dir.path(),
            PartPlan {
                parts: 1,
                notes_per_part: 1,
            },
        )
        .unwrap();
        let mut stream = NoteStream::from_path(&parts[0], XmlDialect::Planet).unwrap();
        let parsed = stream.next_note().unwrap().unwrap();
        assert_eq!(parsed.texts[0].body, "body & 1");
    }

    #[test]
    fn test_zero_notes_single_empty_part() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.xml");
        std::fs::write(
            &input,
            "<?xml version=\"1.0\"?>\n<osm-notes>\n</osm-notes>\n",
        )
        .unwrap();

        let parts = split_notes_xml(
            &input,
            dir.path(),
            PartPlan {
                parts: 1,
                notes_per_part: 100,
            },
        )
        .unwrap();
        assert_eq!(parts.len(), 1);
        assert!(notes_in(&parts[0]).is_empty());
    }

    proptest::proptest! {
        /// Splitting then extracting yields exactly the notes of the
        /// unsplit document, in order, for any part geometry.
        #[test]
        fn prop_split_then_extract_equals_unsplit(
            n in 0usize..40,
            per_part in 1u64..10,
        ) {
            let dir = tempfile::tempdir().unwrap();
            let input = dir.path().join("in.xml");
            std::fs::write(&input, doc(n)).unwrap();

            let direct = notes_in(&input);

            let parts = split_notes_xml(
                &input,
                dir.path(),
                PartPlan { parts: 0, notes_per_part: per_part },
            ).unwrap();
            let mut split_ids = Vec::new();
            for p in &parts {
                split_ids.extend(notes_in(p));
            }
            proptest::prop_assert_eq!(direct, split_ids);
        }
    }
}
