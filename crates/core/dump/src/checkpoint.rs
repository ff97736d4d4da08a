//! Durable per-stream progress records.
//!
//! Each stream owns one file, `<dir>/<stream>.json`, holding `{"last": <block>}`: the last block
//! covered by a batch that was durably written (and archived, when archival is enabled). A
//! missing file means nothing was processed yet.
//!
//! Saves never modify the canonical file in place. The new record is written to a temporary file
//! in the same directory, synced, and then renamed over the canonical one, so a crash at any
//! point leaves either the old or the new record, never a partial one.

use std::{
    io::Write as _,
    path::{Path, PathBuf},
};

use common::{BlockNum, StreamKind};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointRecord {
    last: BlockNum,
}

/// Checkpoint records for all streams, one file per stream in a single directory.
///
/// Each stream is the single writer of its own record, so no locking is needed between streams.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Opens the store at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the last committed block of `stream`, or 0 if the stream never committed.
    pub async fn load(&self, stream: StreamKind) -> Result<BlockNum, CheckpointError> {
        let path = self.path(stream);
        tokio::task::spawn_blocking(move || read_record(&path)).await?
    }

    /// Atomically replaces the record of `stream` with `block_num`.
    ///
    /// Fails without touching the record if `block_num` is lower than the committed value.
    pub async fn save(&self, stream: StreamKind, block_num: BlockNum) -> Result<(), CheckpointError> {
        let dir = self.dir.clone();
        let path = self.path(stream);
        tokio::task::spawn_blocking(move || {
            let current = read_record(&path)?;
            if block_num < current {
                return Err(CheckpointError::Regression {
                    stream,
                    current,
                    attempted: block_num,
                });
            }
            write_record(&dir, &path, stream, block_num)
        })
        .await?
    }

    fn path(&self, stream: StreamKind) -> PathBuf {
        self.dir.join(format!("{stream}.json"))
    }
}

fn read_record(path: &Path) -> Result<BlockNum, CheckpointError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let record: CheckpointRecord =
        serde_json::from_str(&contents).map_err(|source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(record.last)
}

fn write_record(
    dir: &Path,
    path: &Path,
    stream: StreamKind,
    block_num: BlockNum,
) -> Result<(), CheckpointError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{stream}."))
        .suffix(".tmp")
        .tempfile_in(dir)?;
    serde_json::to_writer(&mut tmp, &CheckpointRecord { last: block_num })
        .map_err(std::io::Error::from)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;

    // Make the rename itself durable.
    #[cfg(unix)]
    fs::File::open(dir)?.sync_all()?;

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Reading or writing a checkpoint file failed.
    #[error("checkpoint I/O error")]
    Io(#[from] std::io::Error),

    /// A checkpoint file exists but does not hold a valid record.
    ///
    /// Renames are atomic, so this is not the result of an interrupted save. The file was
    /// modified by something else and needs operator attention.
    #[error("corrupt checkpoint record at {}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A save would move the checkpoint backwards.
    #[error("checkpoint for {stream} cannot move back from {current} to {attempted}")]
    Regression {
        stream: StreamKind,
        current: BlockNum,
        attempted: BlockNum,
    },

    #[error("checkpoint task failed")]
    Join(#[from] JoinError),
}
