//! Shared append-only event log.
//!
//! The distributed driver persists every emitted event here so durable
//! consumers in other processes can catch up on events emitted while they
//! were not running. The log is a single file of framed records; positions
//! are byte offsets, which is what cursors point at.
//!
//! Cross-process safety: every append takes an exclusive advisory lock on a
//! sidecar lock file and every read takes a shared one, so readers never
//! observe a half-written record. A record truncated by a crashed writer is
//! treated as the end of the log rather than corruption.

use crate::error::{BusError, Result};
use crate::types::{Event, EventName, Timestamp};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for an event record.
const EVENT_MAGIC: &[u8; 4] = b"EVT\0";

/// Current record format version.
const EVENT_VERSION: u8 = 1;

/// Flag bit: record carries a payload.
const FLAG_HAS_PAYLOAD: u8 = 0b0000_0001;

/// Sentinel in the expiry field for records that never expire. Distinct
/// from any real instant so an epoch-zero expiry round-trips intact.
const NO_EXPIRY: i64 = i64::MIN;

/// Result of a compaction pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactionStats {
    /// Records examined.
    pub examined: u64,
    /// Records kept.
    pub retained: u64,
    /// Expired records dropped.
    pub reclaimed: u64,
    /// File size before compaction.
    pub bytes_before: u64,
    /// File size after compaction.
    pub bytes_after: u64,
}

/// Append-only, TTL-aware event log.
pub struct EventLog {
    path: PathBuf,

    /// Log file handle. The in-process mutex serializes access between
    /// threads; the advisory lock serializes across processes.
    file: Mutex<File>,

    /// Sidecar file carrying the advisory lock.
    lock_file: File,

    /// Number of appends since the last sync.
    writes_since_sync: Mutex<u64>,

    /// Sync every N appends (1 = sync every append).
    sync_interval: u64,
}

impl EventLog {
    /// Open or create the log inside `dir`, syncing on every append.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(dir, 1)
    }

    /// Open or create the log inside `dir`, syncing every `sync_interval`
    /// appends. An interval of 0 or 1 syncs every append; larger intervals
    /// trade crash durability of the most recent appends for throughput.
    pub fn open_with_sync_interval(dir: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let path = dir.join("events.log");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(dir.join("events.lock"))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            lock_file,
            writes_since_sync: Mutex::new(0),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append an event. Returns the offset it was written at.
    ///
    /// The write is synced per the configured sync interval; with the
    /// default interval every append survives a producer crash.
    pub fn append(&self, event: &Event) -> Result<u64> {
        let mut file = self.file.lock();
        self.lock_file.lock_exclusive()?;

        let result = (|| {
            // Another process may have appended since our last write.
            let offset = file.seek(SeekFrom::End(0))?;
            write_record(&mut *file, event)?;

            let mut writes = self.writes_since_sync.lock();
            *writes += 1;
            if *writes >= self.sync_interval {
                file.sync_all()?;
                *writes = 0;
            }
            Ok(offset)
        })();

        let _ = fs2::FileExt::unlock(&self.lock_file);
        result
    }

    /// Flush any appends not yet covered by an interval sync.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        let mut writes = self.writes_since_sync.lock();
        if *writes > 0 {
            file.sync_all()?;
            *writes = 0;
        }
        Ok(())
    }

    /// Read up to `max` events starting at `offset`.
    ///
    /// Returns `(offset, event, next_offset)` triples in append order. An
    /// empty result means the cursor is at the tail.
    pub fn read_from(&self, offset: u64, max: usize) -> Result<Vec<(u64, Event, u64)>> {
        let mut file = self.file.lock();
        self.lock_file.lock_shared()?;

        let result = (|| {
            let end = file.seek(SeekFrom::End(0))?;
            let mut batch = Vec::new();
            let mut position = offset;

            file.seek(SeekFrom::Start(position))?;
            while position < end && batch.len() < max {
                match read_record(&mut *file)? {
                    Some(event) => {
                        let next = file.stream_position()?;
                        batch.push((position, event, next));
                        position = next;
                    }
                    // Torn tail left by a crashed writer.
                    None => break,
                }
            }
            Ok(batch)
        })();

        let _ = fs2::FileExt::unlock(&self.lock_file);
        result
    }

    /// Current end-of-log offset.
    pub fn tail(&self) -> Result<u64> {
        let mut file = self.file.lock();
        Ok(file.seek(SeekFrom::End(0))?)
    }

    /// Drop expired records, rewriting the log in place.
    ///
    /// Returns the offset remapping for surviving records so the caller can
    /// remap persisted cursors: for a cursor at old offset `c`, the new
    /// position is the mapped offset of the first surviving record at or
    /// after `c`, or the new tail if none survives.
    ///
    /// This is a maintenance operation; run it while consumers of this
    /// namespace are quiescent. The exclusive lock is held throughout.
    pub fn compact(&self, now: Timestamp) -> Result<(CompactionStats, OffsetRemap)> {
        let mut file = self.file.lock();
        self.lock_file.lock_exclusive()?;

        let result = (|| {
            let end = file.seek(SeekFrom::End(0))?;
            let tmp_path = self.path.with_extension("log.tmp");
            let mut tmp = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;

            let mut stats = CompactionStats {
                bytes_before: end,
                ..Default::default()
            };
            let mut surviving: Vec<(u64, u64)> = Vec::new();

            let mut position = 0u64;
            file.seek(SeekFrom::Start(0))?;
            while position < end {
                let event = match read_record(&mut *file)? {
                    Some(event) => event,
                    None => break,
                };
                let next = file.stream_position()?;
                stats.examined += 1;

                if event.is_expired(now) {
                    stats.reclaimed += 1;
                } else {
                    let new_offset = tmp.stream_position()?;
                    write_record(&mut tmp, &event)?;
                    surviving.push((position, new_offset));
                    stats.retained += 1;
                }
                position = next;
            }

            tmp.sync_all()?;
            let new_tail = tmp.stream_position()?;
            stats.bytes_after = new_tail;

            fs::rename(&tmp_path, &self.path)?;
            *file = tmp;

            tracing::debug!(
                reclaimed = stats.reclaimed,
                retained = stats.retained,
                "compacted event log"
            );

            Ok((stats, OffsetRemap { surviving, new_tail }))
        })();

        let _ = fs2::FileExt::unlock(&self.lock_file);
        result
    }
}

/// Offset mapping produced by compaction.
pub struct OffsetRemap {
    /// `(old_offset, new_offset)` for surviving records, in log order.
    surviving: Vec<(u64, u64)>,
    /// End offset of the rewritten log.
    new_tail: u64,
}

impl OffsetRemap {
    /// Map an old cursor position into the rewritten log.
    pub fn map(&self, old: u64) -> u64 {
        self.surviving
            .iter()
            .find(|(old_offset, _)| *old_offset >= old)
            .map(|(_, new_offset)| *new_offset)
            .unwrap_or(self.new_tail)
    }
}

fn write_record(file: &mut File, event: &Event) -> Result<()> {
    file.write_all(EVENT_MAGIC)?;
    file.write_all(&[EVENT_VERSION])?;

    let payload = match &event.data {
        Some(data) => Some(serde_json::to_vec(data)?),
        None => None,
    };
    let flags = if payload.is_some() {
        FLAG_HAS_PAYLOAD
    } else {
        0u8
    };
    file.write_all(&[flags])?;

    file.write_all(&event.timestamp.0.to_le_bytes())?;
    file.write_all(
        &event
            .expires_at
            .map(|t| t.0)
            .unwrap_or(NO_EXPIRY)
            .to_le_bytes(),
    )?;

    let name_bytes = event.name.as_str().as_bytes();
    // `EventName::parse` enforces the limit; a wrapped length here would
    // poison every record after this one.
    let name_len = u16::try_from(name_bytes.len())
        .map_err(|_| BusError::InvalidFormat("event name too long for record frame".into()))?;
    file.write_all(&name_len.to_le_bytes())?;
    file.write_all(name_bytes)?;

    let payload = payload.unwrap_or_default();
    file.write_all(&(payload.len() as u32).to_le_bytes())?;
    file.write_all(&payload)?;

    // Checksum covers the payload bytes.
    file.write_all(&crc32fast::hash(&payload).to_le_bytes())?;

    Ok(())
}

/// Read one record at the current position.
///
/// `Ok(None)` means the record is incomplete (torn tail); the caller treats
/// it as end-of-log.
fn read_record(file: &mut File) -> Result<Option<Event>> {
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if &magic != EVENT_MAGIC {
        return Err(BusError::InvalidFormat("invalid event magic".into()));
    }

    let mut header = [0u8; 2];
    if read_or_torn(file, &mut header)?.is_none() {
        return Ok(None);
    }
    let version = header[0];
    if version != EVENT_VERSION {
        return Err(BusError::InvalidFormat(format!(
            "unsupported event record version: {version}"
        )));
    }
    let flags = header[1];

    let mut ts_bytes = [0u8; 8];
    if read_or_torn(file, &mut ts_bytes)?.is_none() {
        return Ok(None);
    }
    let timestamp = Timestamp(i64::from_le_bytes(ts_bytes));

    let mut exp_bytes = [0u8; 8];
    if read_or_torn(file, &mut exp_bytes)?.is_none() {
        return Ok(None);
    }
    let expires_at = match i64::from_le_bytes(exp_bytes) {
        NO_EXPIRY => None,
        millis => Some(Timestamp(millis)),
    };

    let mut name_len_bytes = [0u8; 2];
    if read_or_torn(file, &mut name_len_bytes)?.is_none() {
        return Ok(None);
    }
    let mut name_bytes = vec![0u8; u16::from_le_bytes(name_len_bytes) as usize];
    if read_or_torn(file, &mut name_bytes)?.is_none() {
        return Ok(None);
    }
    let name_str = String::from_utf8(name_bytes)
        .map_err(|_| BusError::Corruption("event name is not valid UTF-8".into()))?;
    let name = EventName::parse(&name_str)
        .map_err(|_| BusError::Corruption(format!("invalid stored event name: {name_str:?}")))?;

    let mut payload_len_bytes = [0u8; 4];
    if read_or_torn(file, &mut payload_len_bytes)?.is_none() {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(payload_len_bytes) as usize];
    if read_or_torn(file, &mut payload)?.is_none() {
        return Ok(None);
    }

    let mut checksum_bytes = [0u8; 4];
    if read_or_torn(file, &mut checksum_bytes)?.is_none() {
        return Ok(None);
    }
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(&payload);
    if stored != computed {
        return Err(BusError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let data = if flags & FLAG_HAS_PAYLOAD != 0 {
        Some(
            serde_json::from_slice(&payload)
                .map_err(|e| BusError::Deserialization(e.to_string()))?,
        )
    } else {
        None
    };

    Ok(Some(Event {
        name,
        timestamp,
        expires_at,
        data,
    }))
}

/// `read_exact` that reports a short read as `None` instead of an error.
fn read_or_torn(file: &mut File, buf: &mut [u8]) -> Result<Option<()>> {
    match file.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}
