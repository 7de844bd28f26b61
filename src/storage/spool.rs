//! Local spool for batches the store rejected.
//!
//! Each failed batch becomes one newline-delimited JSON file. A batch is
//! written under `*.jsonl.tmp` and only renamed to `*.jsonl` once it is fully
//! on disk, so recovery never sees a file that is still being written.
//! Recovery claims a file by renaming it to `*.jsonl.processing` so concurrent
//! passes never replay the same file twice, and either deletes it or renames
//! it back.

use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::error::Result;
use crate::model::StorageSpan;

pub const SPOOL_EXTENSION: &str = "jsonl";
pub const CLAIM_EXTENSION: &str = "processing";
pub const TEMP_EXTENSION: &str = "tmp";

const WRITE_BUFFER: usize = 1 << 20;

pub struct Spool {
    dir: PathBuf,
    seq: AtomicU64,
}

impl Spool {
    /// Open the spool directory, creating it if needed. Claims left behind
    /// by a crash during recovery are released back to pending, half-written
    /// batches from a crash during a write are removed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let spool = Self {
            dir,
            seq: AtomicU64::new(0),
        };
        let released = spool.release_stale_claims()?;
        if released > 0 {
            info!(dir = %spool.dir.display(), released, "released stale spool claims");
        }
        for partial in spool.files_with_extension(TEMP_EXTENSION)? {
            warn!(file = %partial.display(), "removing incomplete spool write");
            fs::remove_file(&partial)?;
        }
        Ok(spool)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_path(&self) -> PathBuf {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%.3f");
        self.dir.join(format!("spans-{}-{:06}.{}", stamp, seq, SPOOL_EXTENSION))
    }

    /// Write a batch to a new spool file, one span per line. Returns None
    /// for an empty batch. Spans that fail to encode are skipped.
    ///
    /// The file only appears in `pending` after it was synced in full. A
    /// failed write leaves nothing behind.
    pub fn write(&self, spans: &[StorageSpan]) -> Result<Option<PathBuf>> {
        if spans.is_empty() {
            return Ok(None);
        }

        let (path, temp, file) = loop {
            let path = self.next_path();
            let temp = with_suffix(&path, TEMP_EXTENSION);
            match OpenOptions::new().write(true).create_new(true).open(&temp) {
                Ok(file) if !path.exists() => break (path, temp, file),
                Ok(_) => fs::remove_file(&temp)?,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        };

        let written = Self::write_lines(file, spans).and_then(|()| {
            fs::rename(&temp, &path)?;
            Ok(())
        });
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temp) {
                warn!(file = %temp.display(), "removing failed spool write: {}", cleanup);
            }
            return Err(e);
        }

        Ok(Some(path))
    }

    fn write_lines(file: File, spans: &[StorageSpan]) -> Result<()> {
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);
        for span in spans {
            if let Err(e) = serde_json::to_writer(&mut writer, span) {
                warn!(trace_id = %span.trace_id, "spool encode failed: {}", e);
                continue;
            }
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Pending spool files, oldest first
    pub fn pending(&self) -> Result<Vec<PathBuf>> {
        let mut files = self.files_with_extension(SPOOL_EXTENSION)?;
        files.sort();
        Ok(files)
    }

    /// Claim a pending file for replay
    pub fn claim(&self, path: &Path) -> Result<ClaimedFile> {
        let claimed = with_suffix(path, CLAIM_EXTENSION);
        fs::rename(path, &claimed)?;
        Ok(ClaimedFile {
            original: path.to_path_buf(),
            claimed,
        })
    }

    pub fn release_stale_claims(&self) -> Result<usize> {
        let mut released = 0;
        for claimed in self.files_with_extension(CLAIM_EXTENSION)? {
            // spans-*.jsonl.processing -> spans-*.jsonl
            let original = claimed.with_extension("");
            fs::rename(&claimed, &original)?;
            released += 1;
        }
        Ok(released)
    }

    fn files_with_extension(&self, ext: &str) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().map_or(false, |e| e == ext) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

/// `path` with `.suffix` appended to the full file name
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// A spool file renamed out of the pending set
#[derive(Debug)]
pub struct ClaimedFile {
    original: PathBuf,
    claimed: PathBuf,
}

impl ClaimedFile {
    pub fn path(&self) -> &Path {
        &self.claimed
    }

    pub fn original(&self) -> &Path {
        &self.original
    }

    pub fn reader(&self, chunk_size: usize) -> Result<SpoolReader> {
        let file = File::open(&self.claimed)?;
        Ok(SpoolReader {
            reader: BufReader::new(file),
            chunk_size: chunk_size.max(1),
            line: 0,
            skipped: 0,
        })
    }

    /// Replay finished, delete the file
    pub fn complete(self) -> Result<()> {
        fs::remove_file(&self.claimed)?;
        Ok(())
    }

    /// Replay failed, put the file back for the next pass
    pub fn release(self) -> Result<()> {
        fs::rename(&self.claimed, &self.original)?;
        Ok(())
    }
}

/// Reads a spool file in chunks, skipping lines that do not decode
pub struct SpoolReader {
    reader: BufReader<File>,
    chunk_size: usize,
    line: u64,
    skipped: usize,
}

impl SpoolReader {
    pub fn next_chunk(&mut self) -> Result<Option<Vec<StorageSpan>>> {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        let mut buf = Vec::new();

        while chunk.len() < self.chunk_size {
            buf.clear();
            if self.reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            self.line += 1;

            if buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<StorageSpan>(&buf) {
                Ok(span) => chunk.push(span),
                Err(e) => {
                    warn!(line = self.line, "skipping corrupt spool line: {}", e);
                    self.skipped += 1;
                }
            }
        }

        Ok(if chunk.is_empty() { None } else { Some(chunk) })
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}
