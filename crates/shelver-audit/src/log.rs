//! Local append-only audit log with size-based rotation.
//!
//! One JSON object per line. Appends are serialized under a single lock,
//! so sequence numbers, file order, and rotation never interleave.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use shelver_state::{AuditEvent, LifecycleStatus, StateStore};

use crate::error::AuditResult;

/// Tuning for [`AuditLog`].
#[derive(Debug, Clone)]
pub struct AuditLogOptions {
    pub path: PathBuf,
    /// Rotate before an append would grow the active file past this.
    pub max_bytes: u64,
    /// Files kept, the active one included.
    pub max_files: u32,
    /// Events kept in memory for status views.
    pub recent: usize,
    /// `fsync` after every append.
    pub sync: bool,
}

impl AuditLogOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: 10 * 1024 * 1024,
            max_files: 5,
            recent: 50,
            sync: true,
        }
    }
}

struct Inner {
    file: File,
    size: u64,
    next_seq: u64,
    last_status: Option<LifecycleStatus>,
    recent: VecDeque<AuditEvent>,
    /// An enqueue failed; the next append rescans before queueing.
    outbox_behind: bool,
}

/// The local audit trail.
///
/// `AuditLog` is shared behind an `Arc` by the state machine and the idle
/// watcher. When an outbox store is attached, every appended event is
/// queued there for the [`AuditForwarder`](crate::AuditForwarder).
pub struct AuditLog {
    options: AuditLogOptions,
    inner: Mutex<Inner>,
    outbox: Option<StateStore>,
    notify: Arc<Notify>,
}

impl AuditLog {
    /// Open (or create) the log and recover the sequence counter, the last
    /// recorded lifecycle status, and the recent-event window from disk.
    ///
    /// Every retained file is scanned: the newest status-carrying event may
    /// sit several rotations back when later events carry no status. With an
    /// outbox attached, retained events above its high-water mark (written
    /// locally but never queued) are queued again.
    pub fn open(options: AuditLogOptions, outbox: Option<StateStore>) -> AuditResult<Self> {
        if let Some(parent) = options.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let history = read_retained(&options.path, options.max_files)?;
        let next_seq = history.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
        let last_status = history.iter().rev().find_map(|e| e.status);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&options.path)?;
        if terminate_partial_line(&mut file)? {
            warn!(path = %options.path.display(), "audit log ended mid-line, partial record skipped");
        }
        let size = file.metadata()?.len();

        info!(
            path = %options.path.display(),
            next_seq,
            last_status = ?last_status,
            "audit log opened"
        );

        let log = Self {
            options,
            inner: Mutex::new(Inner {
                file,
                size,
                next_seq,
                last_status,
                recent: VecDeque::new(),
                outbox_behind: false,
            }),
            outbox,
            notify: Arc::new(Notify::new()),
        };
        if let Some(store) = &log.outbox {
            log.queue_unmirrored(store, &history)?;
        }

        let skip = history.len().saturating_sub(log.options.recent);
        log.lock().recent = history.into_iter().skip(skip).collect();
        Ok(log)
    }

    /// Durably append an event, returning it with its sequence number.
    ///
    /// The line is on disk (and fsynced, unless disabled) before this
    /// returns. Outbox failures are logged and retried on the next append
    /// or reopen: the event is still recorded locally, which is what
    /// callers wait for.
    pub fn append(&self, mut event: AuditEvent) -> AuditResult<AuditEvent> {
        let mut inner = self.lock();
        event.seq = inner.next_seq;

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        if inner.size > 0 && inner.size + line.len() as u64 > self.options.max_bytes {
            self.rotate(&mut inner)?;
        }

        if let Err(e) = inner.file.write_all(&line) {
            // Drop any partial line so the next append starts clean.
            let size = inner.size;
            if let Err(trunc) = inner.file.set_len(size) {
                warn!(error = %trunc, "failed to trim partial audit record");
            }
            return Err(e.into());
        }
        if self.options.sync {
            inner.file.sync_data()?;
        }
        inner.size += line.len() as u64;
        inner.next_seq += 1;
        if event.status.is_some() {
            inner.last_status = event.status;
        }
        inner.recent.push_back(event.clone());
        while inner.recent.len() > self.options.recent {
            inner.recent.pop_front();
        }

        if let Some(store) = &self.outbox {
            if inner.outbox_behind {
                // The new line is already on disk, so the scan covers it.
                match read_retained(&self.options.path, self.options.max_files)
                    .and_then(|events| self.queue_unmirrored(store, &events))
                {
                    Ok(_) => inner.outbox_behind = false,
                    Err(e) => warn!(seq = event.seq, error = %e, "outbox still unavailable"),
                }
            } else {
                match store.enqueue_outbox(&event) {
                    Ok(()) => self.notify.notify_one(),
                    Err(e) => {
                        warn!(seq = event.seq, error = %e, "failed to queue event for mirroring");
                        inner.outbox_behind = true;
                    }
                }
            }
        }
        drop(inner);

        debug!(seq = event.seq, kind = ?event.kind, status = ?event.status, "audit event appended");
        Ok(event)
    }

    /// Up to `limit` most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let inner = self.lock();
        let skip = inner.recent.len().saturating_sub(limit);
        inner.recent.iter().skip(skip).cloned().collect()
    }

    /// Status carried by the latest status-changing event, if any.
    pub fn last_status(&self) -> Option<LifecycleStatus> {
        self.lock().last_status
    }

    /// Woken on every queued event; the forwarder waits on it.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    pub fn path(&self) -> &Path {
        &self.options.path
    }

    /// Every retained event across rotated files, oldest first.
    pub fn read_all(&self) -> AuditResult<Vec<AuditEvent>> {
        let _guard = self.lock();
        read_retained(&self.options.path, self.options.max_files)
    }

    /// Queue every event above the outbox high-water mark. Returns how
    /// many were queued.
    fn queue_unmirrored(&self, store: &StateStore, events: &[AuditEvent]) -> AuditResult<usize> {
        let high_water = store.outbox_high_water()?;
        let mut queued = 0;
        for event in events.iter().filter(|e| e.seq > high_water) {
            store.enqueue_outbox(event)?;
            queued += 1;
        }
        if queued > 0 {
            info!(queued, high_water, "queued audit events missing from the outbox");
            self.notify.notify_one();
        }
        Ok(queued)
    }

    fn rotate(&self, inner: &mut Inner) -> AuditResult<()> {
        let path = &self.options.path;
        let keep = self.options.max_files.saturating_sub(1);

        inner.file.sync_all()?;
        if keep == 0 {
            std::fs::remove_file(path)?;
        } else {
            let oldest = rotated_path(path, keep);
            if oldest.exists() {
                std::fs::remove_file(&oldest)?;
            }
            for index in (1..keep).rev() {
                let from = rotated_path(path, index);
                if from.exists() {
                    std::fs::rename(&from, rotated_path(path, index + 1))?;
                }
            }
            std::fs::rename(path, rotated_path(path, 1))?;
        }

        inner.file = OpenOptions::new().create(true).append(true).open(path)?;
        inner.size = 0;
        info!(path = %path.display(), next_seq = inner.next_seq, "audit log rotated");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn rotated_path(path: &Path, index: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn read_retained(path: &Path, max_files: u32) -> AuditResult<Vec<AuditEvent>> {
    let mut events = Vec::new();
    for index in (1..max_files).rev() {
        events.extend(read_events(&rotated_path(path, index))?);
    }
    events.extend(read_events(path)?);
    Ok(events)
}

/// Terminate a torn final line so the next record is not glued onto it.
/// Returns whether a newline had to be written.
fn terminate_partial_line(file: &mut File) -> AuditResult<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(false);
    }
    file.write_all(b"\n")?;
    Ok(true)
}

/// Parse a log file, skipping (and counting) malformed lines.
fn read_events(path: &Path) -> AuditResult<Vec<AuditEvent>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut events = Vec::new();
    let mut malformed = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(&line) {
            Ok(event) => events.push(event),
            Err(_) => malformed += 1,
        }
    }
    if malformed > 0 {
        warn!(path = %path.display(), malformed, "skipped malformed audit log lines");
    }
    Ok(events)
}
