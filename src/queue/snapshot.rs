//! Queue snapshot file codec.
//!
//! Layout: magic header + format version, followed by a stream of
//! tagged, length-prefixed records (heap items and in-flight items).
//! A record that cannot be read completely marks a corrupt tail: decode
//! keeps everything before it and reports the truncation. A bad header
//! is corruption beyond recovery.

use crate::constants::{SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
use crate::models::Objective;
use crate::{HephaestusError, Result};

const TAG_HEAP: u8 = 1;
const TAG_IN_FLIGHT: u8 = 2;

#[derive(Debug, Default)]
pub struct SnapshotData {
    pub heap: Vec<Objective>,
    pub in_flight: Vec<Objective>,
}

pub fn encode(data: &SnapshotData) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(SNAPSHOT_MAGIC);
    out.extend_from_slice(&SNAPSHOT_VERSION.to_be_bytes());
    for objective in &data.heap {
        encode_record(&mut out, TAG_HEAP, objective);
    }
    for objective in &data.in_flight {
        encode_record(&mut out, TAG_IN_FLIGHT, objective);
    }
    out
}

/// Decode a snapshot. Returns the recovered data and whether a corrupt
/// tail was truncated.
pub fn decode(bytes: &[u8]) -> Result<(SnapshotData, bool)> {
    if bytes.len() < SNAPSHOT_MAGIC.len() + 2 {
        return Err(HephaestusError::SnapshotCorrupt(
            "file too short for header".to_string(),
        ));
    }
    if bytes[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC[..] {
        return Err(HephaestusError::SnapshotCorrupt(
            "bad magic header".to_string(),
        ));
    }
    let version = u16::from_be_bytes([bytes[5], bytes[6]]);
    if version != SNAPSHOT_VERSION {
        return Err(HephaestusError::SnapshotCorrupt(format!(
            "unsupported snapshot version {version}"
        )));
    }

    let mut reader = Reader {
        bytes,
        pos: SNAPSHOT_MAGIC.len() + 2,
    };
    let mut data = SnapshotData::default();
    let mut truncated = false;

    while !reader.at_end() {
        let record_start = reader.pos;
        match decode_record(&mut reader) {
            Some((TAG_HEAP, objective)) => data.heap.push(objective),
            Some((TAG_IN_FLIGHT, objective)) => data.in_flight.push(objective),
            Some((_, _)) | None => {
                truncated = true;
                tracing::warn!(
                    "Snapshot tail corrupt at byte {}, truncating {} trailing bytes",
                    record_start,
                    bytes.len() - record_start
                );
                break;
            }
        }
    }

    Ok((data, truncated))
}

fn encode_record(out: &mut Vec<u8>, tag: u8, objective: &Objective) {
    out.push(tag);
    let id = objective.id.as_bytes();
    out.extend_from_slice(&(id.len() as u32).to_be_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(&objective.priority.to_be_bytes());
    out.extend_from_slice(&objective.enqueued_at.timestamp_millis().to_be_bytes());
    out.extend_from_slice(&objective.attempts.to_be_bytes());
    out.extend_from_slice(&objective.max_attempts.to_be_bytes());
    let payload = serde_json::to_vec(&objective.payload).unwrap_or_else(|_| b"null".to_vec());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
}

fn decode_record(reader: &mut Reader<'_>) -> Option<(u8, Objective)> {
    let tag = reader.take_u8()?;
    let id_len = reader.take_u32()? as usize;
    let id = String::from_utf8(reader.take_bytes(id_len)?.to_vec()).ok()?;
    let priority = reader.take_i64()?;
    let enqueued_millis = reader.take_i64()?;
    let attempts = reader.take_u32()?;
    let max_attempts = reader.take_u32()?;
    let payload_len = reader.take_u32()? as usize;
    let payload = serde_json::from_slice(reader.take_bytes(payload_len)?).ok()?;

    let enqueued_at = chrono::DateTime::from_timestamp_millis(enqueued_millis)?;
    Some((
        tag,
        Objective {
            id,
            payload,
            priority,
            enqueued_at,
            attempts,
            max_attempts,
        },
    ))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        if end > self.bytes.len() {
            return None;
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn take_u8(&mut self) -> Option<u8> {
        self.take_bytes(1).map(|b| b[0])
    }

    fn take_u32(&mut self) -> Option<u32> {
        self.take_bytes(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_i64(&mut self) -> Option<i64> {
        self.take_bytes(8).map(|b| {
            i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }
}
