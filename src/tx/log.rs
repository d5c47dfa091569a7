//! Append-only logical log of prepared command streams and commit marks.
//!
//! Framing: a fixed header, then `[tag:1][len:4][body][crc32:4]` entries.
//! A prepared transaction is a start entry followed by one command entry per
//! record; a commit entry assigns the transaction id and the master id that
//! produced it. On open the whole segment chain is scanned; prepared entries
//! without a commit are dropped, which is how an in-flight transaction rolls
//! back across a crash.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, SableError};
use crate::tx::command::{decode_stream, Command};

const LOG_MAGIC: &[u8; 8] = b"SABLELOG";
const LOG_VERSION: u16 = 1;
const LOG_HEADER_SIZE: usize = 16;

const ENTRY_START: u8 = 1;
const ENTRY_COMMAND: u8 = 2;
const ENTRY_COMMIT: u8 = 3;

pub const LOG_FILE_NAME: &str = "sable.log";

/// One committed transaction as stored in the log index.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedTx {
    pub tx_id: u64,
    pub master_id: i32,
    /// Serialized command stream, replayable via `decode_stream`.
    pub commands: Vec<u8>,
}

/// A committed transaction reconstituted during the open scan.
#[derive(Debug)]
pub struct RecoveredTx {
    pub identifier: u32,
    pub tx_id: u64,
    pub master_id: i32,
    pub commands: Vec<Command>,
}

#[derive(Debug)]
struct LogInner {
    file: File,
    /// Prepared-but-uncommitted command streams by transaction identifier.
    pending: HashMap<u32, Vec<u8>>,
    /// Committed transactions by tx id, across every segment seen.
    committed: BTreeMap<u64, CommittedTx>,
    rotations: u32,
}

#[derive(Debug)]
pub struct LogicalLog {
    path: PathBuf,
    sync: bool,
    inner: Mutex<LogInner>,
}

impl LogicalLog {
    /// Opens (or creates) the log in `dir` and scans every segment, oldest
    /// first. Returns the log plus the committed transactions found, in tx
    /// id order, for recovery replay.
    pub fn open(dir: &Path, sync: bool) -> Result<(Self, Vec<RecoveredTx>)> {
        let path = dir.join(LOG_FILE_NAME);
        let mut pending = HashMap::new();
        let mut committed = BTreeMap::new();
        let mut recovered = Vec::new();
        let mut rotations = 0;

        for segment in segment_paths(dir, &path)? {
            scan_segment(&segment, &mut pending, &mut committed, &mut recovered)?;
            if segment != path {
                rotations += 1;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() == 0 {
            write_header(&mut file)?;
            if sync {
                file.sync_data()?;
            }
        }
        // Continue appending at the end of whatever survived the scan.
        file.seek(SeekFrom::End(0))?;

        recovered.sort_by_key(|tx| tx.tx_id);
        debug!(
            committed = recovered.len(),
            segments = rotations + 1,
            "logical log opened"
        );
        Ok((
            Self {
                path,
                sync,
                inner: Mutex::new(LogInner {
                    file,
                    pending,
                    committed,
                    rotations,
                }),
            },
            recovered,
        ))
    }

    /// Appends a start entry plus one command entry per command, in the
    /// order given. This is the prepare-time write.
    pub fn append_prepared<'a, I>(&self, identifier: u32, commands: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Command>,
    {
        let mut inner = self.inner.lock();
        write_entry(&mut inner.file, ENTRY_START, &identifier.to_be_bytes())?;
        let mut stream = Vec::new();
        for command in commands {
            let mut body = identifier.to_be_bytes().to_vec();
            let encoded = command.encode();
            body.extend_from_slice(&encoded);
            write_entry(&mut inner.file, ENTRY_COMMAND, &body)?;
            stream.extend_from_slice(&encoded);
        }
        inner.pending.insert(identifier, stream);
        Ok(())
    }

    /// Appends the commit mark and moves the prepared stream into the
    /// committed index. Synced to disk before returning.
    pub fn append_commit(&self, identifier: u32, tx_id: u64, master_id: i32) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut body = identifier.to_be_bytes().to_vec();
        body.extend_from_slice(&tx_id.to_be_bytes());
        body.extend_from_slice(&master_id.to_be_bytes());
        write_entry(&mut inner.file, ENTRY_COMMIT, &body)?;
        if self.sync {
            inner.file.sync_data()?;
        }
        let commands = inner.pending.remove(&identifier).unwrap_or_default();
        inner.committed.insert(
            tx_id,
            CommittedTx {
                tx_id,
                master_id,
                commands,
            },
        );
        Ok(())
    }

    /// Drops a prepared stream that will never commit.
    pub fn forget_prepared(&self, identifier: u32) {
        self.inner.lock().pending.remove(&identifier);
    }

    /// Committed transactions with `since < tx_id <= up_to`, ascending.
    pub fn extract_committed(&self, since: u64, up_to: u64) -> Vec<CommittedTx> {
        if up_to <= since {
            return Vec::new();
        }
        let inner = self.inner.lock();
        inner
            .committed
            .range(since + 1..=up_to)
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    pub fn master_id_for(&self, tx_id: u64) -> Option<i32> {
        self.inner.lock().committed.get(&tx_id).map(|tx| tx.master_id)
    }

    /// Closes the active segment under a numbered name and starts a fresh
    /// one. The committed index is unaffected.
    pub fn rotate(&self) -> Result<u32> {
        let mut inner = self.inner.lock();
        inner.file.sync_data()?;
        inner.rotations += 1;
        let rotated = rotated_path(&self.path, inner.rotations);
        std::fs::rename(&self.path, &rotated)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        write_header(&mut file)?;
        if self.sync {
            file.sync_data()?;
        }
        inner.file = file;
        debug!(segment = inner.rotations, "logical log rotated");
        Ok(inner.rotations)
    }

    /// Paths of every segment currently on disk, oldest first.
    pub fn segments(&self) -> Result<Vec<PathBuf>> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| SableError::IllegalState("log path has no parent".into()))?;
        segment_paths(dir, &self.path)
    }
}

fn rotated_path(path: &Path, index: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// Rotated segments sorted by index, then the active segment.
fn segment_paths(dir: &Path, active: &Path) -> Result<Vec<PathBuf>> {
    let mut rotated: Vec<(u32, PathBuf)> = Vec::new();
    if dir.exists() {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(suffix) = name.strip_prefix(&format!("{LOG_FILE_NAME}.")) {
                if let Ok(index) = suffix.parse::<u32>() {
                    rotated.push((index, entry.path()));
                }
            }
        }
    }
    rotated.sort_by_key(|(index, _)| *index);
    let mut segments: Vec<PathBuf> = rotated.into_iter().map(|(_, path)| path).collect();
    if active.exists() {
        segments.push(active.to_path_buf());
    }
    Ok(segments)
}

fn write_header(file: &mut File) -> Result<()> {
    let mut header = [0u8; LOG_HEADER_SIZE];
    header[..8].copy_from_slice(LOG_MAGIC);
    header[8..10].copy_from_slice(&LOG_VERSION.to_be_bytes());
    file.write_all(&header)?;
    Ok(())
}

fn write_entry(file: &mut File, tag: u8, body: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(body.len() + 9);
    frame.push(tag);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    let mut hasher = Hasher::new();
    hasher.update(&frame);
    frame.extend_from_slice(&hasher.finalize().to_be_bytes());
    file.write_all(&frame)?;
    Ok(())
}

fn scan_segment(
    path: &Path,
    pending: &mut HashMap<u32, Vec<u8>>,
    committed: &mut BTreeMap<u64, CommittedTx>,
    recovered: &mut Vec<RecoveredTx>,
) -> Result<()> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() < LOG_HEADER_SIZE {
        warn!(path = %path.display(), "log segment shorter than its header, ignoring");
        return Ok(());
    }
    if &bytes[..8] != LOG_MAGIC {
        return Err(SableError::Corruption(format!(
            "bad log magic in {}",
            path.display()
        )));
    }
    let version = u16::from_be_bytes([bytes[8], bytes[9]]);
    if version != LOG_VERSION {
        return Err(SableError::Corruption(format!(
            "unsupported log version {version} in {}",
            path.display()
        )));
    }

    let mut pos = LOG_HEADER_SIZE;
    while pos < bytes.len() {
        if pos + 5 > bytes.len() {
            warn!(offset = pos, "truncated log frame header, stopping scan");
            break;
        }
        let tag = bytes[pos];
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[pos + 1..pos + 5]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        let frame_end = pos + 5 + len;
        if frame_end + 4 > bytes.len() {
            warn!(offset = pos, "truncated log frame, stopping scan");
            break;
        }
        let mut hasher = Hasher::new();
        hasher.update(&bytes[pos..frame_end]);
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&bytes[frame_end..frame_end + 4]);
        if hasher.finalize() != u32::from_be_bytes(crc_bytes) {
            warn!(offset = pos, "log frame checksum mismatch, stopping scan");
            break;
        }
        let body = &bytes[pos + 5..frame_end];
        match tag {
            ENTRY_START => {
                let identifier = read_u32(body, 0)?;
                pending.insert(identifier, Vec::new());
            }
            ENTRY_COMMAND => {
                let identifier = read_u32(body, 0)?;
                pending
                    .entry(identifier)
                    .or_default()
                    .extend_from_slice(&body[4..]);
            }
            ENTRY_COMMIT => {
                let identifier = read_u32(body, 0)?;
                let tx_id = read_u64(body, 4)?;
                let master_id = read_i32(body, 12)?;
                let commands = pending.remove(&identifier).unwrap_or_default();
                recovered.push(RecoveredTx {
                    identifier,
                    tx_id,
                    master_id,
                    commands: decode_stream(&commands)?,
                });
                committed.insert(
                    tx_id,
                    CommittedTx {
                        tx_id,
                        master_id,
                        commands,
                    },
                );
            }
            other => {
                return Err(SableError::Corruption(format!(
                    "unknown log entry tag {other}"
                )));
            }
        }
        pos = frame_end + 4;
    }
    Ok(())
}

fn read_u32(body: &[u8], offset: usize) -> Result<u32> {
    let slice = body
        .get(offset..offset + 4)
        .ok_or_else(|| SableError::Corruption("log entry body truncated".into()))?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(slice);
    Ok(u32::from_be_bytes(arr))
}

fn read_i32(body: &[u8], offset: usize) -> Result<i32> {
    Ok(read_u32(body, offset)? as i32)
}

fn read_u64(body: &[u8], offset: usize) -> Result<u64> {
    let slice = body
        .get(offset..offset + 8)
        .ok_or_else(|| SableError::Corruption("log entry body truncated".into()))?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(slice);
    Ok(u64::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::NodeRecord;

    fn node_command(id: u64) -> Command {
        let mut record = NodeRecord::new(id);
        record.in_use = true;
        record.created = true;
        Command::Node(record)
    }

    #[test]
    fn committed_transactions_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let (log, recovered) = LogicalLog::open(dir.path(), true)?;
            assert!(recovered.is_empty());
            log.append_prepared(1, &[node_command(7)])?;
            log.append_commit(1, 1, 3)?;
            log.append_prepared(2, &[node_command(8)])?;
            // No commit for identifier 2: must vanish on reopen.
        }
        let (log, recovered) = LogicalLog::open(dir.path(), true)?;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].tx_id, 1);
        assert_eq!(recovered[0].master_id, 3);
        assert_eq!(recovered[0].commands.len(), 1);
        assert_eq!(log.master_id_for(1), Some(3));
        Ok(())
    }

    #[test]
    fn extraction_respects_the_horizon() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (log, _) = LogicalLog::open(dir.path(), false)?;
        for identifier in 1..=3u32 {
            log.append_prepared(identifier, &[node_command(u64::from(identifier))])?;
            log.append_commit(identifier, u64::from(identifier), -1)?;
        }
        let txs = log.extract_committed(1, 2);
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].tx_id, 2);
        assert!(log.extract_committed(3, 3).is_empty());
        Ok(())
    }

    #[test]
    fn rotation_scans_across_segments() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let (log, _) = LogicalLog::open(dir.path(), true)?;
            log.append_prepared(1, &[node_command(1)])?;
            log.append_commit(1, 1, -1)?;
            log.rotate()?;
            log.append_prepared(2, &[node_command(2)])?;
            log.append_commit(2, 2, -1)?;
        }
        let (_, recovered) = LogicalLog::open(dir.path(), true)?;
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].tx_id, 1);
        assert_eq!(recovered[1].tx_id, 2);
        Ok(())
    }
}
