//! Cursor-based tailing of an externally rotated log file.

use std::fs::{File, Metadata};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use shelver_state::{LogCursor, StateStore};
use tracing::{debug, info, warn};

use crate::error::{WatchError, WatchResult};

/// Upper bound on bytes consumed per poll.
const MAX_CHUNK: usize = 4 * 1024 * 1024;

/// Result of one poll.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TailBatch {
    /// Complete lines appended since the previous poll.
    pub lines: Vec<String>,
    /// The file was replaced or truncated; reading restarted at offset 0.
    pub rotated: bool,
    /// The file does not exist right now.
    pub missing: bool,
}

/// Reads complete lines appended to a file, resuming from a cursor that
/// survives restarts when a [`StateStore`] is attached.
pub struct LogTailer {
    path: PathBuf,
    key: String,
    store: Option<StateStore>,
    cursor: LogCursor,
    /// Whether `cursor.inode` refers to a file we have already read.
    known: bool,
}

impl LogTailer {
    pub fn open(path: impl Into<PathBuf>, store: Option<StateStore>) -> WatchResult<Self> {
        let path = path.into();
        let key = path.to_string_lossy().into_owned();
        let saved = match &store {
            Some(store) => store.get_cursor(&key)?,
            None => None,
        };
        if let Some(cursor) = saved {
            debug!(path = %path.display(), inode = cursor.inode, offset = cursor.offset, "resuming access log cursor");
        }
        Ok(Self {
            path,
            key,
            store,
            cursor: saved.unwrap_or_default(),
            known: saved.is_some(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> LogCursor {
        self.cursor
    }

    pub fn poll(&mut self) -> WatchResult<TailBatch> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(TailBatch {
                    missing: true,
                    ..TailBatch::default()
                });
            }
            Err(source) => return Err(self.io_error(source)),
        };

        let before = self.cursor;
        let inode = file_identity(&meta);
        let len = meta.len();
        let mut rotated = false;

        if self.known {
            if inode != self.cursor.inode || len < self.cursor.offset {
                info!(
                    path = %self.path.display(),
                    old_inode = self.cursor.inode,
                    new_inode = inode,
                    "access log rotated or truncated"
                );
                self.cursor = LogCursor { inode, offset: 0 };
                rotated = true;
            }
        } else {
            self.cursor = LogCursor { inode, offset: 0 };
            self.known = true;
        }

        let lines = if len > self.cursor.offset {
            self.read_lines()?
        } else {
            Vec::new()
        };

        if self.cursor != before {
            self.persist();
        }

        Ok(TailBatch {
            lines,
            rotated,
            missing: false,
        })
    }

    fn read_lines(&mut self) -> WatchResult<Vec<String>> {
        let mut file = File::open(&self.path).map_err(|e| self.io_error(e))?;
        file.seek(SeekFrom::Start(self.cursor.offset))
            .map_err(|e| self.io_error(e))?;

        let mut buf = Vec::new();
        file.take(MAX_CHUNK as u64)
            .read_to_end(&mut buf)
            .map_err(|e| self.io_error(e))?;

        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            if buf.len() == MAX_CHUNK {
                warn!(path = %self.path.display(), offset = self.cursor.offset, "skipping oversized access log line");
                self.cursor.offset += buf.len() as u64;
            }
            // A partial line stays unread until its newline arrives.
            return Ok(Vec::new());
        };

        let complete = &buf[..=last_newline];
        self.cursor.offset += complete.len() as u64;

        Ok(complete
            .split(|&b| b == b'\n')
            .map(|line| String::from_utf8_lossy(line).trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    fn persist(&self) {
        if let Some(store) = &self.store
            && let Err(e) = store.put_cursor(&self.key, &self.cursor)
        {
            warn!(error = %e, "failed to persist access log cursor");
        }
    }

    fn io_error(&self, source: std::io::Error) -> WatchError {
        WatchError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(unix)]
fn file_identity(meta: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn file_identity(_meta: &Metadata) -> u64 {
    0
}
