//! Reconstructs snapshot records from the delimited text stream.
//!
//! A logical record may span several physical lines. A field shaped like
//! `<digits>/<alnum>` starts a new record once the current one has at least
//! [`MIN_RECORD_FIELDS`] fields; a trailing fragment below that is dropped.

use tracing::debug;

use crate::models::SnapshotRecord;

/// Fields required before a record is flushed.
pub const MIN_RECORD_FIELDS: usize = 10;

/// Default field delimiter of the snapshot export.
pub const DEFAULT_DELIMITER: char = ';';

/// Whether a field looks like a record identifier (`123/AB7`).
pub fn is_record_id(field: &str) -> bool {
    match field.split_once('/') {
        Some((digits, suffix)) => {
            !digits.is_empty()
                && digits.chars().all(|c| c.is_ascii_digit())
                && !suffix.is_empty()
                && suffix.chars().all(|c| c.is_alphanumeric())
        }
        None => false,
    }
}

/// Streaming parser; feed lines, then call [`RecordParser::finish`].
#[derive(Debug)]
pub struct RecordParser {
    delimiter: char,
    fields: Vec<String>,
    records: Vec<SnapshotRecord>,
    dropped: usize,
}

impl Default for RecordParser {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}

impl RecordParser {
    pub fn new(delimiter: char) -> Self {
        Self {
            delimiter,
            fields: Vec::new(),
            records: Vec::new(),
            dropped: 0,
        }
    }

    /// Consume one physical line.
    pub fn push_line(&mut self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return;
        }
        for field in line.split(self.delimiter) {
            self.push_field(field.trim());
        }
    }

    fn push_field(&mut self, field: &str) {
        if is_record_id(field) {
            if self.fields.is_empty() {
                self.fields.push(field.to_string());
                return;
            }
            if self.fields.len() >= MIN_RECORD_FIELDS {
                self.flush();
                self.fields.push(field.to_string());
                return;
            }
        }

        if self.fields.is_empty() {
            // preamble before the first identifier
            self.dropped += 1;
            return;
        }
        self.fields.push(field.to_string());
    }

    fn flush(&mut self) {
        let fields = std::mem::take(&mut self.fields);
        if fields.len() >= MIN_RECORD_FIELDS {
            self.records.push(SnapshotRecord::from_fields(&fields));
        } else if !fields.is_empty() {
            debug!(fields = fields.len(), first = ?fields.first(), "Dropping partial snapshot record");
            self.dropped += 1;
        }
    }

    /// Flush the trailing record (if complete) and return everything parsed.
    pub fn finish(mut self) -> Vec<SnapshotRecord> {
        self.flush();
        if self.dropped > 0 {
            debug!(dropped = self.dropped, "Snapshot parse dropped fragments");
        }
        self.records
    }
}

/// Parse a complete stream of lines.
pub fn parse_records<S: AsRef<str>>(lines: &[S], delimiter: char) -> Vec<SnapshotRecord> {
    let mut parser = RecordParser::new(delimiter);
    for line in lines {
        parser.push_line(line.as_ref());
    }
    parser.finish()
}
