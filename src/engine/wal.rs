//! CONCLAVE - Write-Ahead Log (WAL)
//! Provides durability by logging every mutation to disk
//! before it is applied to the in-memory MemTable.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::Record;

use super::codec;
use super::memtable::MemTable;

/// Write-Ahead Log for crash recovery and durability.
///
/// One physical file per engine, written in the shared line format
/// (see [`codec`]). The file handle is opened lazily on the first append
/// and dropped again when the log is discarded by a flush.
#[derive(Debug)]
pub struct WriteAheadLog {
    /// Path to the WAL file on disk.
    path: PathBuf,
    /// Append handle, opened on first use.
    file: Option<File>,
    /// Fsync after every append.
    sync_writes: bool,
}

impl WriteAheadLog {
    /// Create a WAL handle for `path` without touching the filesystem.
    pub fn new(path: PathBuf, sync_writes: bool) -> Self {
        Self {
            path,
            file: None,
            sync_writes,
        }
    }

    /// Returns the path to the WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&mut self) -> Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?;
                log::debug!("opened WAL {:?}", self.path);
                file
            }
        };
        Ok(self.file.insert(file))
    }

    /// Append one record and make it durable before returning.
    pub fn append(&mut self, key: &str, record: &Record) -> Result<()> {
        let line = codec::encode(key, record);
        let sync = self.sync_writes;
        let file = self.handle()?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Flush any pending bytes of the open handle (if one is open).
    pub fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Sync and release the handle; the next append reopens it.
    pub fn close(&mut self) -> Result<()> {
        self.sync()?;
        self.file = None;
        Ok(())
    }

    /// Close the handle and delete the file (called after a successful flush).
    pub fn discard(&mut self) -> Result<()> {
        self.file = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replay a WAL file into a fresh MemTable.
    ///
    /// Later lines overwrite earlier ones for the same key. Unparsable lines
    /// are skipped with a warning. A final line without its newline is a
    /// write torn by a crash: it is never replayed, and the file is truncated
    /// back to the last complete line so later appends start on a fresh line.
    /// Returns the table and the number of records replayed.
    pub fn recover(path: &Path) -> Result<(MemTable, usize)> {
        let mut memtable = MemTable::new();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((memtable, 0)),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut replayed = 0;
        let mut line_no = 0usize;
        let mut complete_len = 0u64;
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                break;
            }
            line_no += 1;
            if line.last() != Some(&b'\n') {
                log::warn!(
                    "dropping unterminated WAL line {} in {:?} ({} bytes)",
                    line_no,
                    path,
                    read
                );
                truncate(path, complete_len)?;
                break;
            }
            complete_len += read as u64;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match codec::decode_line(&line) {
                Ok((key, record)) => {
                    memtable.apply(key, record);
                    replayed += 1;
                }
                Err(e) => log::warn!("skipping WAL line {} in {:?}: {}", line_no, path, e),
            }
        }
        Ok((memtable, replayed))
    }
}

fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}
