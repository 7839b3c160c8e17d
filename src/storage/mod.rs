//! The durable write-ahead log and persistent term/vote state (spec §4.1).
//!
//! Two files per node: a 16-byte state file (`currentTerm`, `votedFor`)
//! rewritten in place on every save, and an append-only log file of
//! `term | cmdLen | command` records. Every write that the rest of the
//! system depends on for safety is flushed, and fsynced unless the node
//! is configured for `--async-log`.

pub mod log;

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::common::{NodeId, StorageError, NOT_VOTED};
pub use log::LogEntry;

const STATE_FILE_LEN: u64 = 16;

pub struct DurableStore {
    state_file: File,
    log_file: File,
    log_writer: BufWriter<File>,
    log_offsets: Vec<u64>,
    async_mode: bool,
}

impl DurableStore {
    pub fn open(id: NodeId, data_dir: impl AsRef<Path>, async_mode: bool) -> Result<DurableStore, StorageError> {
        let state_path = state_file_path(id, data_dir.as_ref());
        let log_path = log_file_path(id, data_dir.as_ref());
        Self::open_at_paths(state_path, log_path, async_mode)
    }

    pub fn open_at_paths(
        state_path: impl AsRef<Path>,
        log_path: impl AsRef<Path>,
        async_mode: bool,
    ) -> Result<DurableStore, StorageError> {
        let state_file = OpenOptions::new().read(true).write(true).create(true).open(state_path)?;
        let log_file = OpenOptions::new().read(true).write(true).create(true).open(log_path)?;
        let log_writer = BufWriter::new(log_file.try_clone()?);
        Ok(DurableStore {
            state_file,
            log_file,
            log_writer,
            log_offsets: Vec::new(),
            async_mode,
        })
    }

    /// Rewrites the 16-byte state file and, unless running in async mode,
    /// fsyncs it before returning.
    pub fn save_state(&mut self, term: u64, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        let voted_for = voted_for.map(|v| v as i64).unwrap_or(NOT_VOTED);
        let mut buf = [0u8; STATE_FILE_LEN as usize];
        buf[0..8].copy_from_slice(&(term as i64).to_le_bytes());
        buf[8..16].copy_from_slice(&voted_for.to_le_bytes());

        self.state_file.seek(SeekFrom::Start(0))?;
        self.state_file.write_all(&buf)?;
        if !self.async_mode {
            self.state_file.sync_all()?;
        }
        Ok(())
    }

    /// Returns `(0, None)` for a freshly created (zero-length) state file.
    pub fn load_state(&mut self) -> Result<(u64, Option<NodeId>), StorageError> {
        let len = self.state_file.metadata()?.len();
        if len == 0 {
            return Ok((0, None));
        }
        self.state_file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; STATE_FILE_LEN as usize];
        self.state_file.read_exact(&mut buf)?;
        let term = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let voted_for = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        let voted_for = if voted_for == NOT_VOTED { None } else { Some(voted_for as NodeId) };
        Ok((term as u64, voted_for))
    }

    /// Appends every entry, recording its starting offset, then flushes
    /// and (unless async) fsyncs once for the whole batch.
    pub fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.log_writer.flush()?;
        let mut offset = self.log_file.seek(SeekFrom::End(0))?;
        for entry in entries {
            self.log_offsets.push(offset);
            self.log_writer.write_all(&(entry.term as i64).to_le_bytes())?;
            self.log_writer.write_all(&(entry.command.len() as i64).to_le_bytes())?;
            self.log_writer.write_all(&entry.command)?;
            offset += 16 + entry.command.len() as u64;
        }
        self.log_writer.flush()?;
        if !self.async_mode {
            self.log_file.sync_all()?;
        }
        Ok(())
    }

    /// Truncates the on-disk log to just before `entries[index]`, where
    /// `index` is a 0-based position among the entries previously
    /// appended through this store (i.e. excludes the in-memory
    /// sentinel). Idempotent if `index` is out of range.
    pub fn truncate(&mut self, index: usize) -> Result<(), StorageError> {
        if index >= self.log_offsets.len() {
            return Ok(());
        }
        let truncate_at = self.log_offsets[index];
        self.log_writer.flush()?;
        self.log_file.set_len(truncate_at)?;
        self.log_file.seek(SeekFrom::Start(truncate_at))?;
        self.log_offsets.truncate(index);
        self.log_writer = BufWriter::new(self.log_file.try_clone()?);
        if !self.async_mode {
            self.log_file.sync_all()?;
        }
        Ok(())
    }

    /// Replays the log file in order, rebuilding the offset index. A
    /// partially written trailing record (EOF mid-header or mid-body) is
    /// silently dropped rather than treated as an error — the record was
    /// never acknowledged to a client, so discarding it is safe.
    pub fn load_log(&mut self) -> Result<Vec<LogEntry>, StorageError> {
        self.log_writer.flush()?;
        self.log_file.seek(SeekFrom::Start(0))?;
        let mut reader = io::BufReader::new(&self.log_file);
        let mut entries = Vec::new();
        self.log_offsets.clear();
        let mut offset = 0u64;

        loop {
            let start_offset = offset;
            let mut term_buf = [0u8; 8];
            match read_fully_or_partial(&mut reader, &mut term_buf)? {
                ReadOutcome::Eof => break,
                ReadOutcome::Partial(_) => break,
                ReadOutcome::Full => {}
            }
            offset += 8;

            let mut len_buf = [0u8; 8];
            match read_fully_or_partial(&mut reader, &mut len_buf)? {
                ReadOutcome::Full => {}
                _ => break,
            }
            offset += 8;
            let cmd_len = i64::from_le_bytes(len_buf) as usize;

            let mut cmd = vec![0u8; cmd_len];
            match read_fully_or_partial(&mut reader, &mut cmd)? {
                ReadOutcome::Full => {}
                _ => break,
            }
            offset += cmd_len as u64;

            self.log_offsets.push(start_offset);
            entries.push(LogEntry { term: i64::from_le_bytes(term_buf) as u64, command: cmd });
        }

        // Truncate away any partial tail we just detected so future
        // appends start from a clean offset.
        let clean_len = self.log_offsets.last().map(|_| offset).unwrap_or(0);
        self.log_file.set_len(clean_len)?;
        self.log_file.seek(SeekFrom::End(0))?;
        self.log_writer = BufWriter::new(self.log_file.try_clone()?);
        Ok(entries)
    }

    pub fn close(mut self) -> Result<(), StorageError> {
        self.log_writer.flush()?;
        Ok(())
    }
}

enum ReadOutcome {
    Full,
    Partial(usize),
    Eof,
}

fn read_fully_or_partial(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome, StorageError> {
    let mut read_total = 0;
    while read_total < buf.len() {
        match reader.read(&mut buf[read_total..])? {
            0 => {
                return Ok(if read_total == 0 { ReadOutcome::Eof } else { ReadOutcome::Partial(read_total) });
            }
            n => read_total += n,
        }
    }
    Ok(ReadOutcome::Full)
}

fn state_file_path(id: NodeId, data_dir: &Path) -> PathBuf {
    data_dir.join(format!("raft_state_{id}.bin"))
}

fn log_file_path(id: NodeId, data_dir: &Path) -> PathBuf {
    data_dir.join(format!("raft_log_{id}.bin"))
}
