//! Durable write-ahead log.
//!
//! The log is a single append-only file of checksummed frames plus a small
//! master record holding the logical start of the log and the position of
//! the most recent checkpoint. An LSN is the byte offset of a frame, so
//! LSNs are totally ordered and readable in both directions with `read`
//! and `next`.
//!
//! Torn tails are expected: on open the log is scanned forward from its
//! logical start and physically truncated at the first frame that fails
//! validation. Records before the tear stay readable.

#![forbid(unsafe_code)]

pub mod record;

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::checksum::{Checksum, Crc32Fast};
use crate::types::{Lsn, Result, StorageError};

use record::WalRecord;

const WAL_MAGIC: [u8; 4] = *b"LTHW";
const MASTER_MAGIC: [u8; 4] = *b"LTHM";
const FORMAT_VERSION: u16 = 1;

/// magic + version + salt + crc
const HEADER_SIZE: u64 = 4 + 2 + 8 + 4;
/// lsn echo + payload len + payload crc + header crc
const FRAME_HEADER_SIZE: u64 = 8 + 4 + 4 + 4;
/// magic + version + cut lsn + checkpoint flag + checkpoint lsn + crc
const MASTER_SIZE: usize = 4 + 2 + 8 + 1 + 8 + 4;

pub(crate) const WAL_FILE: &str = "storage.wal";
pub(crate) const MASTER_FILE: &str = "storage.wmr";

struct WalState {
    io: StdFileIo,
    master_io: StdFileIo,
    salt: u64,
    /// Offset where the next frame will be appended.
    append: u64,
    /// Everything below this offset is known to be on disk.
    flushed: u64,
    /// Logical start of the log; reads below it fail with `NotFound`.
    cut: u64,
    /// LSN of the last appended record, if the log is non-empty.
    last: Option<u64>,
    /// Start LSN of the most recent checkpoint, persisted in the master record.
    last_checkpoint: Option<u64>,
}

/// Append-only write-ahead log with checksummed frames.
pub struct WriteAheadLog {
    state: Mutex<WalState>,
    wal_path: PathBuf,
    master_path: PathBuf,
}

impl WriteAheadLog {
    /// Opens the log inside `dir`, creating it when absent. A pre-existing
    /// log is scanned and its torn tail, if any, is truncated.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let wal_path = dir.as_ref().join(WAL_FILE);
        let master_path = dir.as_ref().join(MASTER_FILE);
        let io = StdFileIo::open(&wal_path)?;
        let master_io = StdFileIo::open(&master_path)?;

        let salt = if io.is_empty()? {
            let salt: u64 = rand::thread_rng().gen();
            write_header(&io, salt)?;
            salt
        } else {
            read_header(&io)?
        };

        let (cut, last_checkpoint) = read_master(&master_io)?;
        let mut state = WalState {
            io,
            master_io,
            salt,
            append: HEADER_SIZE,
            flushed: HEADER_SIZE,
            cut: cut.max(HEADER_SIZE),
            last: None,
            last_checkpoint,
        };
        scan_tail(&mut state)?;
        state.flushed = state.append;

        info!(
            target: "wal.open",
            path = %wal_path.display(),
            append = state.append,
            cut = state.cut,
            checkpoint = ?state.last_checkpoint,
            "write-ahead log opened"
        );
        Ok(Self {
            state: Mutex::new(state),
            wal_path,
            master_path,
        })
    }

    /// Appends a record and returns its LSN. The record is buffered in the
    /// OS until [`WriteAheadLog::flush`] is called.
    pub fn log(&self, record: &WalRecord) -> Result<Lsn> {
        let payload = record.encode();
        let mut state = self.state.lock();
        let lsn = state.append;
        let frame = encode_frame(lsn, state.salt, &payload);
        state.io.write_at(lsn, &frame)?;
        state.append = lsn + frame.len() as u64;
        state.last = Some(lsn);
        Ok(Lsn(lsn))
    }

    /// Forces every appended record to disk.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.io.sync_all()?;
        state.flushed = state.append;
        Ok(())
    }

    /// Reads the record stored at `lsn`.
    ///
    /// Positions outside the readable window fail with `NotFound`; frames
    /// that fail structural or checksum validation fail with `WalBroken`.
    pub fn read(&self, lsn: Lsn) -> Result<WalRecord> {
        let (io, salt, cut, append) = {
            let state = self.state.lock();
            (state.io.clone(), state.salt, state.cut, state.append)
        };
        if lsn.0 < cut || lsn.0 >= append {
            return Err(StorageError::NotFound(lsn));
        }
        let (payload, _) = read_frame(&io, lsn.0, salt, append)?;
        WalRecord::decode(&payload)
    }

    /// LSN of the record following the one at `lsn`, or `None` at the tail.
    pub fn next(&self, lsn: Lsn) -> Result<Option<Lsn>> {
        let (io, salt, cut, append) = {
            let state = self.state.lock();
            (state.io.clone(), state.salt, state.cut, state.append)
        };
        if lsn.0 < cut || lsn.0 >= append {
            return Err(StorageError::NotFound(lsn));
        }
        let (_, next) = read_frame(&io, lsn.0, salt, append)?;
        Ok((next < append).then_some(Lsn(next)))
    }

    /// LSN of the first readable record, if any.
    pub fn begin(&self) -> Option<Lsn> {
        let state = self.state.lock();
        (state.cut < state.append).then_some(Lsn(state.cut))
    }

    /// LSN of the last appended record, if any.
    pub fn end(&self) -> Option<Lsn> {
        let state = self.state.lock();
        state.last.filter(|last| *last >= state.cut).map(Lsn)
    }

    /// Highest append offset known to be durable.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.state.lock().flushed)
    }

    /// Logically discards every record before `lsn`. The master record is
    /// rewritten so the discard survives restarts; file space is not
    /// reclaimed.
    pub fn cut_till(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        if lsn.0 <= state.cut {
            return Ok(());
        }
        state.cut = lsn.0.min(state.append);
        debug!(target: "wal.cut", cut = state.cut, "log head advanced");
        persist_master(&mut state)
    }

    /// Start LSN of the most recent checkpoint recorded in the log.
    pub fn last_checkpoint(&self) -> Option<Lsn> {
        self.state.lock().last_checkpoint.map(Lsn)
    }

    /// Logs a checkpoint start record, chains it to the previous checkpoint
    /// and persists its position in the master record.
    pub fn log_checkpoint_start(&self, fuzzy: bool) -> Result<Lsn> {
        let previous = self.last_checkpoint();
        let record = if fuzzy {
            WalRecord::FuzzyCheckpointStart { previous }
        } else {
            WalRecord::FullCheckpointStart { previous }
        };
        let lsn = self.log(&record)?;
        let mut state = self.state.lock();
        state.last_checkpoint = Some(lsn.0);
        persist_master(&mut state)?;
        Ok(lsn)
    }

    /// Logs a checkpoint end record.
    pub fn log_checkpoint_end(&self, fuzzy: bool) -> Result<Lsn> {
        let record = if fuzzy {
            WalRecord::FuzzyCheckpointEnd
        } else {
            WalRecord::FullCheckpointEnd
        };
        self.log(&record)
    }

    /// Flushes and releases the log.
    pub fn close(&self) -> Result<()> {
        self.flush()
    }

    /// Removes the log files from disk.
    pub fn delete(self) -> Result<()> {
        std::fs::remove_file(&self.wal_path)?;
        if self.master_path.exists() {
            std::fs::remove_file(&self.master_path)?;
        }
        Ok(())
    }
}

fn write_header(io: &StdFileIo, salt: u64) -> Result<()> {
    let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
    buf.extend_from_slice(&WAL_MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    buf.extend_from_slice(&salt.to_be_bytes());
    let mut crc = Crc32Fast::default();
    crc.update(&buf);
    buf.extend_from_slice(&crc.finalize().to_be_bytes());
    io.write_at(0, &buf)?;
    io.sync_all()
}

fn read_header(io: &StdFileIo) -> Result<u64> {
    let mut buf = [0u8; HEADER_SIZE as usize];
    io.read_at(0, &mut buf)?;
    if buf[0..4] != WAL_MAGIC {
        return Err(StorageError::Corruption("bad WAL magic".into()));
    }
    let version = u16::from_be_bytes([buf[4], buf[5]]);
    if version != FORMAT_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported WAL format version {version}"
        )));
    }
    let mut crc = Crc32Fast::default();
    crc.update(&buf[..14]);
    let stored = u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]);
    if crc.finalize() != stored {
        return Err(StorageError::Corruption(
            "WAL header checksum mismatch".into(),
        ));
    }
    let mut salt = [0u8; 8];
    salt.copy_from_slice(&buf[6..14]);
    Ok(u64::from_be_bytes(salt))
}

fn encode_frame(lsn: u64, salt: u64, payload: &[u8]) -> Vec<u8> {
    let mut payload_crc = Crc32Fast::default();
    payload_crc.update(&salt.to_be_bytes());
    payload_crc.update(payload);
    let payload_crc = payload_crc.finalize();

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + payload.len());
    frame.extend_from_slice(&lsn.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload_crc.to_be_bytes());
    let mut header_crc = Crc32Fast::default();
    header_crc.update(&frame);
    frame.extend_from_slice(&header_crc.finalize().to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Reads and validates one frame. Returns the payload bytes and the offset
/// of the following frame. `limit` bounds the readable region.
fn read_frame(io: &StdFileIo, lsn: u64, salt: u64, limit: u64) -> Result<(Vec<u8>, u64)> {
    let broken = || StorageError::WalBroken(Lsn(lsn));

    if lsn + FRAME_HEADER_SIZE > limit {
        return Err(broken());
    }
    let mut header = [0u8; FRAME_HEADER_SIZE as usize];
    io.read_at(lsn, &mut header).map_err(|_| broken())?;

    let mut crc = Crc32Fast::default();
    crc.update(&header[..16]);
    let stored_header_crc = u32::from_be_bytes([header[16], header[17], header[18], header[19]]);
    if crc.finalize() != stored_header_crc {
        return Err(broken());
    }
    let echoed = u64::from_be_bytes([
        header[0], header[1], header[2], header[3], header[4], header[5], header[6], header[7],
    ]);
    if echoed != lsn {
        return Err(broken());
    }
    let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as u64;
    let payload_crc = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    let next = lsn + FRAME_HEADER_SIZE + len;
    if next > limit {
        return Err(broken());
    }

    let mut payload = vec![0u8; len as usize];
    io.read_at(lsn + FRAME_HEADER_SIZE, &mut payload)
        .map_err(|_| broken())?;
    let mut crc = Crc32Fast::default();
    crc.update(&salt.to_be_bytes());
    crc.update(&payload);
    if crc.finalize() != payload_crc {
        return Err(broken());
    }
    Ok((payload, next))
}

/// Walks frames from the logical start to locate the append position,
/// truncating the file at the first invalid frame.
fn scan_tail(state: &mut WalState) -> Result<()> {
    let file_len = state.io.len()?;
    let mut pos = state.cut;
    let mut last = None;
    while pos < file_len {
        match read_frame(&state.io, pos, state.salt, file_len) {
            Ok((_, next)) => {
                last = Some(pos);
                pos = next;
            }
            Err(StorageError::WalBroken(_)) => {
                warn!(target: "wal.open", at = pos, "torn WAL tail truncated");
                state.io.truncate(pos)?;
                state.io.sync_all()?;
                break;
            }
            Err(err) => return Err(err),
        }
    }
    state.append = pos.min(state.io.len()?);
    state.last = last;
    Ok(())
}

fn persist_master(state: &mut WalState) -> Result<()> {
    let mut buf = Vec::with_capacity(MASTER_SIZE);
    buf.extend_from_slice(&MASTER_MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    buf.extend_from_slice(&state.cut.to_be_bytes());
    match state.last_checkpoint {
        Some(lsn) => {
            buf.push(1);
            buf.extend_from_slice(&lsn.to_be_bytes());
        }
        None => {
            buf.push(0);
            buf.extend_from_slice(&0u64.to_be_bytes());
        }
    }
    let mut crc = Crc32Fast::default();
    crc.update(&buf);
    buf.extend_from_slice(&crc.finalize().to_be_bytes());
    state.master_io.write_at(0, &buf)?;
    state.master_io.truncate(MASTER_SIZE as u64)?;
    state.master_io.sync_all()
}

/// Reads the master record. A missing or damaged master record resets the
/// log to its physical start rather than failing the open.
fn read_master(io: &StdFileIo) -> Result<(u64, Option<u64>)> {
    if io.len()? < MASTER_SIZE as u64 {
        return Ok((HEADER_SIZE, None));
    }
    let mut buf = [0u8; MASTER_SIZE];
    io.read_at(0, &mut buf)?;
    if buf[0..4] != MASTER_MAGIC {
        warn!(target: "wal.open", "master record magic mismatch, ignoring");
        return Ok((HEADER_SIZE, None));
    }
    let mut crc = Crc32Fast::default();
    crc.update(&buf[..MASTER_SIZE - 4]);
    let stored = u32::from_be_bytes([
        buf[MASTER_SIZE - 4],
        buf[MASTER_SIZE - 3],
        buf[MASTER_SIZE - 2],
        buf[MASTER_SIZE - 1],
    ]);
    if crc.finalize() != stored {
        warn!(target: "wal.open", "master record checksum mismatch, ignoring");
        return Ok((HEADER_SIZE, None));
    }
    let mut cut = [0u8; 8];
    cut.copy_from_slice(&buf[6..14]);
    let cut = u64::from_be_bytes(cut);
    let checkpoint = if buf[14] == 1 {
        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&buf[15..23]);
        Some(u64::from_be_bytes(lsn))
    } else {
        None
    };
    Ok((cut, checkpoint))
}
