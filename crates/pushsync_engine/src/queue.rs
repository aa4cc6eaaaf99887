//! Durable FIFO job queue.
//!
//! The queue is an append-only log of framed records over a
//! [`StorageBackend`]:
//!
//! ```text
//! | magic "PSJQ" (4) | version u16 | type u8 | len u32 | payload | crc32 |
//! ```
//!
//! All integers are little-endian and the CRC covers everything before it.
//! Record types:
//!
//! - `Push`: `seq u64` followed by the CBOR job envelope
//! - `Remove`: `seq u64`
//! - `Clear`: empty payload
//!
//! Opening a queue replays the log. A torn or damaged tail ends the replay
//! and is cut off. A job from a newer schema is dropped with a warning and a
//! `Remove` is logged for it. Once the queue drains the log is truncated to
//! zero bytes. While jobs stay live, a log dominated by dead records is
//! rewritten from the live entries through [`StorageBackend::replace`].

use crate::error::EngineResult;
use pushsync_protocol::{Job, ProtocolError};
use pushsync_storage::StorageBackend;
use std::collections::VecDeque;
use tracing::{debug, error, warn};

/// Magic bytes identifying a queue record.
pub const QUEUE_MAGIC: [u8; 4] = *b"PSJQ";

/// Current queue framing version.
pub const QUEUE_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

/// Dead records tolerated before a rewrite is considered.
const COMPACT_MIN_DEAD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Push = 1,
    Remove = 2,
    Clear = 3,
}

impl RecordType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Push),
            2 => Some(Self::Remove),
            3 => Some(Self::Clear),
            _ => None,
        }
    }
}

/// A live job together with its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Sequence number, unique within the log.
    pub seq: u64,
    /// The job.
    pub job: Job,
}

/// A crash-durable FIFO of [`Job`]s.
///
/// # Example
///
/// ```rust
/// use pushsync_engine::JobQueue;
/// use pushsync_protocol::Job;
/// use pushsync_storage::InMemoryBackend;
///
/// let backend = InMemoryBackend::new();
/// let mut queue = JobQueue::open(Box::new(backend.clone())).unwrap();
/// queue.push(Job::Subscribe { name: "donuts".into() }).unwrap();
///
/// // A second queue over the same bytes sees the job.
/// let reopened = JobQueue::open(Box::new(backend)).unwrap();
/// assert_eq!(reopened.len(), 1);
/// ```
pub struct JobQueue {
    backend: Box<dyn StorageBackend>,
    entries: VecDeque<QueueEntry>,
    next_seq: u64,
    /// Records currently in the log, live or not.
    records: usize,
}

impl JobQueue {
    /// Opens a queue, replaying whatever the backend already holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or repaired.
    pub fn open(mut backend: Box<dyn StorageBackend>) -> EngineResult<Self> {
        let data = backend.read_all()?;
        let replay = replay(&data);

        if replay.valid_len < data.len() {
            warn!(
                valid = replay.valid_len,
                size = data.len(),
                "discarding damaged job queue tail"
            );
            backend.truncate(replay.valid_len as u64)?;
        }

        let mut queue = Self {
            backend,
            entries: replay.entries,
            next_seq: replay.next_seq,
            records: replay.records,
        };

        for seq in replay.unreadable {
            queue.write_record(RecordType::Remove, &seq.to_le_bytes())?;
        }
        queue.compact()?;

        debug!(jobs = queue.entries.len(), "job queue opened");
        Ok(queue)
    }

    /// Appends a job. Returns once the job is durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be encoded or persisted; the queue
    /// is unchanged in that case.
    pub fn push(&mut self, job: Job) -> EngineResult<u64> {
        let seq = self.next_seq;
        self.write_record(RecordType::Push, &push_payload(seq, &job)?)?;

        self.next_seq += 1;
        self.entries.push_back(QueueEntry { seq, job });
        Ok(seq)
    }

    /// Returns the head entry without removing it.
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    /// Removes the head entry. Popping an empty queue does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal cannot be persisted.
    pub fn pop(&mut self) -> EngineResult<Option<QueueEntry>> {
        let Some(seq) = self.entries.front().map(|e| e.seq) else {
            return Ok(None);
        };
        self.write_record(RecordType::Remove, &seq.to_le_bytes())?;
        let entry = self.entries.pop_front();
        self.compact()?;
        Ok(entry)
    }

    /// Removes the entry with sequence number `seq`, wherever it sits.
    ///
    /// Returns false if no such entry is live.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal cannot be persisted.
    pub fn remove(&mut self, seq: u64) -> EngineResult<bool> {
        let Some(index) = self.entries.iter().position(|e| e.seq == seq) else {
            return Ok(false);
        };
        self.write_record(RecordType::Remove, &seq.to_le_bytes())?;
        self.entries.remove(index);
        self.compact()?;
        Ok(true)
    }

    /// Removes every entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be cleared.
    pub fn clear(&mut self) -> EngineResult<()> {
        self.write_record(RecordType::Clear, &[])?;
        self.entries.clear();
        self.compact()
    }

    /// Entry at position `index` from the head.
    pub fn get(&self, index: usize) -> Option<&QueueEntry> {
        self.entries.get(index)
    }

    /// Live entries, head first.
    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries are live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size of the underlying log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn log_size(&self) -> EngineResult<u64> {
        Ok(self.backend.size()?)
    }

    fn write_record(&mut self, record_type: RecordType, payload: &[u8]) -> EngineResult<()> {
        let data = frame_record(record_type, payload)?;

        let before = self.backend.size()?;
        let written = self
            .backend
            .append(&data)
            .and_then(|_| self.backend.sync());
        if let Err(err) = written {
            error!(error = %err, ?record_type, "job queue write failed");
            // A half-written record would hide every later one from replay.
            if let Ok(size) = self.backend.size() {
                if size > before {
                    let _ = self.backend.truncate(before);
                }
            }
            return Err(err.into());
        }
        self.records += 1;
        Ok(())
    }

    fn compact(&mut self) -> EngineResult<()> {
        if self.entries.is_empty() {
            if self.backend.size()? > 0 {
                self.backend.truncate(0)?;
                self.backend.sync()?;
            }
            self.records = 0;
            return Ok(());
        }

        let live = self.entries.len();
        let dead = self.records.saturating_sub(live);
        if dead < COMPACT_MIN_DEAD || dead <= live * 2 {
            return Ok(());
        }

        let (data, records) = self.snapshot()?;
        match self.backend.replace(&data) {
            Ok(()) => {
                debug!(live, dead, size = data.len(), "job queue log rewritten");
                self.records = records;
            }
            // The old log is still intact and replays to the same entries.
            Err(err) => warn!(error = %err, "could not rewrite job queue log"),
        }
        Ok(())
    }

    /// Encodes the live entries as a fresh log.
    ///
    /// A trailing `Remove` for the highest issued seq keeps sequence numbers
    /// growing across a reopen.
    fn snapshot(&self) -> EngineResult<(Vec<u8>, usize)> {
        let mut data = Vec::new();
        let mut records = 0;
        for entry in &self.entries {
            data.extend(frame_record(
                RecordType::Push,
                &push_payload(entry.seq, &entry.job)?,
            )?);
            records += 1;
        }

        let last_issued = self.next_seq.saturating_sub(1);
        if self.entries.back().map(|e| e.seq) != Some(last_issued) {
            data.extend(frame_record(RecordType::Remove, &last_issued.to_le_bytes())?);
            records += 1;
        }
        Ok((data, records))
    }
}

fn push_payload(seq: u64, job: &Job) -> EngineResult<Vec<u8>> {
    let encoded = job.encode()?;
    let mut payload = Vec::with_capacity(8 + encoded.len());
    payload.extend_from_slice(&seq.to_le_bytes());
    payload.extend_from_slice(&encoded);
    Ok(payload)
}

fn frame_record(record_type: RecordType, payload: &[u8]) -> EngineResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::Encode("queue record payload too large".into()))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&QUEUE_MAGIC);
    data.extend_from_slice(&QUEUE_VERSION.to_le_bytes());
    data.push(record_type as u8);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(payload);
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("entries", &self.entries.len())
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}

struct Replay {
    entries: VecDeque<QueueEntry>,
    next_seq: u64,
    valid_len: usize,
    records: usize,
    unreadable: Vec<u64>,
}

fn replay(data: &[u8]) -> Replay {
    let mut entries: VecDeque<QueueEntry> = VecDeque::new();
    let mut unreadable = Vec::new();
    let mut next_seq = 0u64;
    let mut offset = 0usize;
    let mut records = 0usize;

    while let Some((record_type, payload, record_len)) = read_record(&data[offset..]) {
        match record_type {
            RecordType::Push => {
                let Some((seq, body)) = split_seq(payload) else {
                    break;
                };
                next_seq = next_seq.max(seq + 1);
                match Job::decode(body) {
                    Ok(job) => entries.push_back(QueueEntry { seq, job }),
                    Err(err) => {
                        warn!(seq, error = %err, "dropping unreadable queued job");
                        unreadable.push(seq);
                    }
                }
            }
            RecordType::Remove => {
                let Some((seq, _)) = split_seq(payload) else {
                    break;
                };
                next_seq = next_seq.max(seq + 1);
                entries.retain(|e| e.seq != seq);
                unreadable.retain(|s| *s != seq);
            }
            RecordType::Clear => {
                entries.clear();
                unreadable.clear();
            }
        }
        offset += record_len;
        records += 1;
    }

    Replay {
        entries,
        next_seq,
        valid_len: offset,
        records,
        unreadable,
    }
}

/// Parses one record from the front of `data`.
///
/// Returns `None` for a truncated, foreign or damaged record.
fn read_record(data: &[u8]) -> Option<(RecordType, &[u8], usize)> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    if data[0..4] != QUEUE_MAGIC {
        return None;
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != QUEUE_VERSION {
        return None;
    }
    let record_type = RecordType::from_byte(data[6])?;
    let len = u32::from_le_bytes([data[7], data[8], data[9], data[10]]) as usize;

    let total = HEADER_SIZE.checked_add(len)?.checked_add(CRC_SIZE)?;
    if data.len() < total {
        return None;
    }

    let body_end = HEADER_SIZE + len;
    let stored = u32::from_le_bytes([
        data[body_end],
        data[body_end + 1],
        data[body_end + 2],
        data[body_end + 3],
    ]);
    if compute_crc32(&data[..body_end]) != stored {
        return None;
    }

    Some((record_type, &data[HEADER_SIZE..body_end], total))
}

fn split_seq(payload: &[u8]) -> Option<(u64, &[u8])> {
    let (head, rest) = payload.split_first_chunk::<8>()?;
    Some((u64::from_le_bytes(*head), rest))
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
