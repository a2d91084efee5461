//! Decoding of the raw event files written by the tracer.
//!
//! Two encodings are understood:
//! - text, one `;`-separated record per line, either
//!   `func;kind;growth;goid;ts` or the older `func;kind;pid;tgid;goid;ts`
//! - binary, a sequence of little-endian `RawEvent` frames
//!
//! Malformed records are yielded as errors so the caller can log and skip
//! them; an I/O failure ends the stream.

use crate::error::RecordError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use gotrace_common::{
    user::{Event, EventKind},
    RawEvent, MAX_TIMESTAMP, RAW_EVENT_SIZE,
};
use log::error;
use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read, Write},
    path::Path,
    str::FromStr,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventFormat {
    #[default]
    Text,
    Binary,
}

pub type EventResult = Result<Event, RecordError>;

/// Open an event file in the given encoding
pub fn open_events<P: AsRef<Path>>(
    path: P,
    format: EventFormat,
) -> io::Result<Box<dyn Iterator<Item = EventResult>>> {
    let reader = BufReader::new(File::open(path)?);
    Ok(match format {
        EventFormat::Text => Box::new(TextEvents::new(reader)),
        EventFormat::Binary => Box::new(BinaryEvents::new(reader)),
    })
}

fn parse_field<T: FromStr>(record: usize, field: &'static str, value: &str) -> Result<T, RecordError> {
    value.parse().map_err(|_| RecordError::BadInteger {
        record,
        field,
        value: value.to_string(),
    })
}

fn parse_flag(record: usize, value: &str) -> Result<bool, RecordError> {
    match parse_field::<u8>(record, "growth", value)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RecordError::InvalidField {
            record,
            reason: format!("growth flag {} is not 0 or 1", other),
        }),
    }
}

/// Parse one text record; blank lines and `#` comments yield `None`
pub fn parse_line(record: usize, line: &str) -> Result<Option<Event>, RecordError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split(';').map(str::trim).collect();
    let (is_growth_frame, goid, ts) = match fields.len() {
        5 => (parse_flag(record, fields[2])?, fields[3], fields[4]),
        // func;kind;pid;tgid;goid;ts carries no growth flag
        6 => (false, fields[4], fields[5]),
        found => return Err(RecordError::FieldCount { record, found }),
    };

    let raw_kind: u8 = parse_field(record, "kind", fields[1])?;
    let kind = EventKind::from_raw(raw_kind).ok_or_else(|| RecordError::InvalidField {
        record,
        reason: format!("event kind {} is neither enter nor exit", raw_kind),
    })?;

    let timestamp: u64 = parse_field(record, "timestamp", ts)?;
    if timestamp > MAX_TIMESTAMP {
        return Err(RecordError::InvalidField {
            record,
            reason: format!("timestamp {} exceeds {}", timestamp, MAX_TIMESTAMP),
        });
    }

    Ok(Some(Event {
        function_index: parse_field(record, "function", fields[0])?,
        kind,
        is_growth_frame,
        goroutine_id: parse_field(record, "goroutine", goid)?,
        timestamp,
    }))
}

/// Line-oriented text event reader
pub struct TextEvents<R> {
    reader: R,
    line: Vec<u8>,
    record: usize,
}

impl<R: BufRead> TextEvents<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
            record: 0,
        }
    }
}

impl<R: BufRead> Iterator for TextEvents<R> {
    type Item = EventResult;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to read event record {}: {}", self.record + 1, e);
                    return None;
                }
            }
            self.record += 1;

            let Ok(line) = std::str::from_utf8(&self.line) else {
                return Some(Err(RecordError::NotUtf8 { record: self.record }));
            };
            match parse_line(self.record, line) {
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Decode one frame; `frame` must hold `RAW_EVENT_SIZE` bytes
fn decode_frame(mut frame: &[u8]) -> io::Result<RawEvent> {
    Ok(RawEvent {
        func_id: frame.read_u32::<LittleEndian>()?,
        kind: frame.read_u8()?,
        growth: frame.read_u8()?,
        pad: frame.read_u16::<LittleEndian>()?,
        goid: frame.read_i64::<LittleEndian>()?,
        timestamp: frame.read_u64::<LittleEndian>()?,
    })
}

/// Encode one frame in the layout `BinaryEvents` reads
pub fn write_frame<W: Write>(writer: &mut W, event: &RawEvent) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(event.func_id)?;
    writer.write_u8(event.kind)?;
    writer.write_u8(event.growth)?;
    writer.write_u16::<LittleEndian>(event.pad)?;
    writer.write_i64::<LittleEndian>(event.goid)?;
    writer.write_u64::<LittleEndian>(event.timestamp)?;
    Ok(())
}

/// Fixed-size binary frame reader
pub struct BinaryEvents<R> {
    reader: R,
    record: usize,
    done: bool,
}

impl<R: Read> BinaryEvents<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            record: 0,
            done: false,
        }
    }

    fn fill(&mut self, frame: &mut [u8; RAW_EVENT_SIZE]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < frame.len() {
            match self.reader.read(&mut frame[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl<R: Read> Iterator for BinaryEvents<R> {
    type Item = EventResult;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut frame = [0u8; RAW_EVENT_SIZE];
        let filled = match self.fill(&mut frame) {
            Ok(filled) => filled,
            Err(e) => {
                error!("Failed to read event frame {}: {}", self.record + 1, e);
                self.done = true;
                return None;
            }
        };
        if filled == 0 {
            self.done = true;
            return None;
        }
        self.record += 1;
        if filled < RAW_EVENT_SIZE {
            self.done = true;
            return Some(Err(RecordError::Truncated {
                record: self.record,
                len: filled,
            }));
        }

        let record = self.record;
        let raw = match decode_frame(&frame) {
            Ok(raw) => raw,
            Err(e) => {
                return Some(Err(RecordError::InvalidField {
                    record,
                    reason: e.to_string(),
                }))
            }
        };
        Some(Event::try_from(raw).map_err(|e| RecordError::InvalidField {
            record,
            reason: e.to_string(),
        }))
    }
}
