//! Archive reading: a forward-only, date-monotone sequence of `(date,
//! payload)` entries, transparently gzip-decompressed (spec.md §3, §6).

use std::fs::File;
use std::io::{BufRead, BufReader, Lines, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use log::warn;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::message::{payload, Payload};

fn millis_of(date: OffsetDateTime) -> i64 {
    (date.unix_timestamp_nanos() / 1_000_000) as i64
}

/// One archive record: a publish date (milliseconds since the UNIX epoch,
/// matching [`crate::clock::Clock`]'s representation) and its opaque
/// payload.
pub struct ArchiveEntry {
    pub date_millis: i64,
    pub payload: Payload,
}

impl ArchiveEntry {
    pub fn new(date_millis: i64, payload: Payload) -> Self {
        ArchiveEntry { date_millis, payload }
    }

    pub fn shifted(self, delta_millis: i64) -> Self {
        ArchiveEntry {
            date_millis: self.date_millis + delta_millis,
            payload: self.payload,
        }
    }
}

/// A lazy, forward-only sequence of archive entries (spec.md §3: "An
/// ArchiveReader exposes a single lazy, forward-only sequence of entries").
///
/// Implementations enforce date-monotonicity themselves: an out-of-order
/// entry is logged and silently dropped (spec.md §7 `OrderingViolation`:
/// "log; drop entry"), never surfaced to the caller as a malformed read.
pub trait ArchiveReader: Send {
    /// Pull the next entry, or `None` at end of archive. Read failures come
    /// back as `Err` so the caller (the [scheduler](super::scheduler)) can
    /// apply its `max-skip` failure budget (spec.md §4.4 "Failure
    /// semantics").
    fn next_entry(&mut self) -> Result<Option<ArchiveEntry>>;
}

#[derive(Deserialize)]
struct Record {
    date: String,
    payload: serde_json::Value,
}

/// Line-oriented archive: each line is a JSON object `{"date": <rfc3339>,
/// "payload": <json>}`. Transparently gzip-decompressed by file extension,
/// the same way the teacher's CSV importer picks a decoder
/// (`ingest/import/tardis_csv.rs::open_input`: `.gz` => `GzDecoder`,
/// otherwise the raw file).
pub struct JsonLinesArchiveReader {
    lines: Lines<BufReader<Box<dyn Read + Send>>>,
    last_date_millis: Option<i64>,
}

impl JsonLinesArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let reader: Box<dyn Read + Send> =
            if path.extension().and_then(|e| e.to_str()) == Some("gz") {
                Box::new(GzDecoder::new(file))
            } else {
                Box::new(file)
            };
        Ok(JsonLinesArchiveReader {
            lines: BufReader::new(reader).lines(),
            last_date_millis: None,
        })
    }
}

impl ArchiveReader for JsonLinesArchiveReader {
    fn next_entry(&mut self) -> Result<Option<ArchiveEntry>> {
        loop {
            let line = match self.lines.next() {
                None => return Ok(None),
                Some(line) => line?,
            };
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line)
                .map_err(|e| Error::Protocol(format!("malformed archive entry: {e}")))?;
            let date = OffsetDateTime::parse(&record.date, &Rfc3339)
                .map_err(|e| Error::Protocol(format!("malformed archive entry date: {e}")))?;
            let date_millis = millis_of(date);

            if let Some(last) = self.last_date_millis {
                if date_millis < last {
                    warn!(
                        "archive entry dated {date_millis} precedes last published {last}; \
                         dropping (ordering violation)"
                    );
                    continue;
                }
            }
            self.last_date_millis = Some(date_millis);
            return Ok(Some(ArchiveEntry::new(date_millis, payload(record.payload))));
        }
    }
}
