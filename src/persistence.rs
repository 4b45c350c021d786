//! # Persistence Log
//!
//! Per-connection write-ahead log: a binary data file of serialized
//! [`Message`]s plus a small control file holding the `last_sent`
//! counter as text. Grounded line-for-line on
//! `ActivePersistence.cpp` in the original implementation — the same
//! three monotonic counters, the same roll condition, and the same
//! recovery-mode bookkeeping.
//!
//! Every accepted publish is appended here before it reaches the bounded
//! queue (write-ahead), which is what lets the producer engine recover
//! after a crash: on restart, [`PersistenceLog::crash_recovery`] compares
//! the control file against the data log and replays whatever was
//! serialized but never acknowledged as sent.

use crate::error::CratewayError;
use crate::message::Message;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Mutable counters and cursor guarded by the log's single mutex — append,
/// replay-read, counter-update, and roll all serialize through it, mirroring
/// the original's single `persistenceMutex`.
#[derive(Debug, Default)]
struct State {
    last_wrote: u64,
    last_enqueue: u64,
    last_sent: u64,
    recovery_mode: bool,
    read_cursor: u64,
}

/// Snapshot of the three monotonic counters, for invariant checks and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub last_sent: u64,
    pub last_enqueue: u64,
    pub last_wrote: u64,
}

/// Outcome of [`PersistenceLog::one_more_sent`], telling the producer
/// engine what follow-up actions to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentOutcome {
    /// Recovery mode was just exited; producer should flip its state back
    /// to `Running`.
    pub left_recovery: bool,
    /// The replay task should be woken to enqueue one more message.
    pub signal_replay: bool,
    /// The log files were just rolled (truncated, counters reset).
    pub rolled: bool,
}

pub struct PersistenceLog {
    connection_id: String,
    data_path: PathBuf,
    control_path: PathBuf,
    size_limit: u64,
    enabled: bool,
    state: Mutex<State>,
}

impl PersistenceLog {
    /// Construct a log for `connection_id` rooted in the process working
    /// directory, per spec file-naming convention
    /// (`persistence_file_<id>`, `control_file_<id>`).
    pub fn new(connection_id: impl Into<String>, size_limit: u64) -> Self {
        Self::with_base_dir(connection_id, size_limit, ".")
    }

    /// Same as [`Self::new`] but rooted in an arbitrary directory —
    /// used by tests so concurrent test runs don't collide on the same
    /// filenames in the crate's working directory.
    pub fn with_base_dir(
        connection_id: impl Into<String>,
        size_limit: u64,
        base_dir: impl AsRef<Path>,
    ) -> Self {
        let connection_id = connection_id.into();
        let base_dir = base_dir.as_ref();
        Self {
            data_path: base_dir.join(format!("persistence_file_{connection_id}")),
            control_path: base_dir.join(format!("control_file_{connection_id}")),
            enabled: size_limit > 0,
            size_limit,
            connection_id,
            state: Mutex::new(State::default()),
        }
    }

    /// Persistence is disabled entirely when `size_limit == 0`: every
    /// other method becomes a no-op.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn counters(&self) -> Counters {
        let s = self.state.lock().await;
        Counters {
            last_sent: s.last_sent,
            last_enqueue: s.last_enqueue,
            last_wrote: s.last_wrote,
        }
    }

    pub async fn is_recovery_mode(&self) -> bool {
        self.state.lock().await.recovery_mode
    }

    /// Scan control file + data log on startup, entering recovery mode if
    /// they disagree. Returns how many messages the replay task should
    /// immediately be asked to re-enqueue, bounded by `queue_capacity`
    /// (`0` meaning unbounded, in which case the full backlog replays).
    pub async fn crash_recovery(&self, queue_capacity: usize) -> u64 {
        if !self.enabled {
            return 0;
        }
        let last_sent_from_file = self.read_control_file().await;
        let last_wrote_scanned = self.scan_data_log().await;

        let mut s = self.state.lock().await;
        s.last_enqueue = last_sent_from_file;
        s.last_sent = last_sent_from_file;
        s.last_wrote = last_wrote_scanned;

        if s.last_wrote > s.last_sent {
            debug!(
                connection_id = %self.connection_id,
                from = s.last_sent,
                to = s.last_wrote,
                "recovering persisted but unacknowledged messages"
            );
            let last_enqueue = s.last_enqueue;
            drop(s);
            self.position_cursor_after(last_enqueue).await;
            let mut s = self.state.lock().await;
            s.recovery_mode = true;
            let backlog = s.last_wrote - s.last_sent;
            if queue_capacity == 0 {
                backlog
            } else {
                backlog.min(queue_capacity as u64)
            }
        } else {
            debug!(connection_id = %self.connection_id, "nothing to recover");
            0
        }
    }

    /// Append `message` to the data log (write-ahead). No-op when
    /// persistence is disabled.
    pub async fn serialize(&self, message: &Message) -> Result<(), CratewayError> {
        if !self.enabled {
            return Ok(());
        }
        let bytes = message.to_bytes().map_err(|e| CratewayError::Persistence {
            connection_id: self.connection_id.clone(),
            reason: format!("encode failure: {e}"),
        })?;
        let mut s = self.state.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.data_path)
            .await
            .map_err(|e| CratewayError::Persistence {
                connection_id: self.connection_id.clone(),
                reason: format!("open data log: {e}"),
            })?;
        file.write_all(&bytes).await.map_err(|e| {
            error!(connection_id = %self.connection_id, %e, "POSSIBLE DATA LOSS writing persistence file");
            CratewayError::Persistence {
                connection_id: self.connection_id.clone(),
                reason: format!("append failed: {e}"),
            }
        })?;
        s.last_wrote += 1;
        Ok(())
    }

    /// Record that the producer re-enqueued one logged message (either
    /// normally, or during replay). No-op when disabled.
    pub async fn one_more_enqueued(&self) {
        if !self.enabled {
            return;
        }
        self.state.lock().await.last_enqueue += 1;
    }

    /// Read the next message at the persisted read-cursor position, O(1)
    /// relative to log size since the cursor is carried between calls.
    pub async fn next_message(&self) -> Option<Message> {
        if !self.enabled {
            return None;
        }
        let mut s = self.state.lock().await;
        let cursor = s.read_cursor;
        match read_one_at(&self.data_path, cursor).await {
            Some((msg, new_cursor)) => {
                s.read_cursor = new_cursor;
                Some(msg)
            }
            None => {
                warn!(
                    connection_id = %self.connection_id,
                    position = cursor,
                    "POSSIBLE DATA LOSS: message not found at persisted read cursor"
                );
                None
            }
        }
    }

    /// Record a successful send. Handles recovery-mode exit, requests a
    /// further replay signal if the backlog still outpaces what's in
    /// flight, and rolls the files if eligible.
    pub async fn one_more_sent(&self, dequeued_in_recovery: bool) -> SentOutcome {
        if !self.enabled {
            return SentOutcome {
                left_recovery: false,
                signal_replay: false,
                rolled: false,
            };
        }
        let mut s = self.state.lock().await;
        s.last_sent += 1;
        self.write_control_file(s.last_sent).await;

        let mut left_recovery = false;
        let mut signal_replay = false;
        if s.recovery_mode && dequeued_in_recovery {
            if s.last_enqueue == s.last_wrote {
                debug!(connection_id = %self.connection_id, "recovery complete, returning to normal mode");
                s.recovery_mode = false;
                s.read_cursor = 0;
                left_recovery = true;
            } else {
                // Replay task should stay one message ahead of the drain
                // rate; request another if its backlog estimate is stale.
                signal_replay = true;
            }
        }

        let rolled = self.try_roll(&mut s).await;
        SentOutcome {
            left_recovery,
            signal_replay,
            rolled,
        }
    }

    /// Begin recovery mode out-of-band (triggered by a full queue rather
    /// than by crash recovery). Positions the read cursor to skip
    /// messages already resident in the live queue.
    pub async fn start_recovery(&self) {
        if !self.enabled {
            return;
        }
        warn!(connection_id = %self.connection_id, "entering recovery mode: message could not be enqueued");
        let last_enqueue = {
            let s = self.state.lock().await;
            s.last_enqueue
        };
        self.position_cursor_after(last_enqueue).await;
        self.state.lock().await.recovery_mode = true;
    }

    /// Truncate both files and zero all counters, if
    /// `last_enqueue == last_sent == last_wrote` and `last_sent >= size_limit`.
    pub async fn roll_file(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let mut s = self.state.lock().await;
        self.try_roll(&mut s).await
    }

    async fn try_roll(&self, s: &mut State) -> bool {
        if s.last_enqueue == s.last_sent
            && s.last_enqueue == s.last_wrote
            && s.last_sent >= self.size_limit
        {
            debug!(connection_id = %self.connection_id, "rolling persistence files");
            let _ = fs::write(&self.data_path, []).await;
            let _ = fs::write(&self.control_path, []).await;
            s.last_sent = 0;
            s.last_enqueue = 0;
            s.last_wrote = 0;
            s.read_cursor = 0;
            true
        } else {
            false
        }
    }

    async fn read_control_file(&self) -> u64 {
        match fs::read_to_string(&self.control_path).await {
            Ok(contents) => contents.trim().parse().unwrap_or(0),
            Err(_) => 0,
        }
    }

    async fn write_control_file(&self, last_sent: u64) {
        if let Err(e) = fs::write(&self.control_path, last_sent.to_string()).await {
            error!(connection_id = %self.connection_id, %e, "failed to update control file, disk full?");
        }
    }

    /// Count deserializable records in the data log from the start.
    async fn scan_data_log(&self) -> u64 {
        let Ok(mut file) = std::fs::File::open(&self.data_path) else {
            return 0;
        };
        let mut count = 0u64;
        while bincode::deserialize_from::<_, Message>(&mut file).is_ok() {
            count += 1;
        }
        count
    }

    /// Advance the read cursor past the first `count` records — used both
    /// by crash recovery and by `start_recovery` to skip messages already
    /// live in the queue.
    async fn position_cursor_after(&self, count: u64) {
        let Ok(mut file) = std::fs::File::open(&self.data_path) else {
            return;
        };
        let mut position = 0u64;
        for _ in 0..count {
            match bincode::deserialize_from::<_, Message>(&mut file) {
                Ok(_) => {
                    position = file.stream_position().unwrap_or(position);
                }
                Err(_) => break,
            }
        }
        self.state.lock().await.read_cursor = position;
    }
}

/// Read exactly one message at byte offset `cursor`, returning it plus
/// the new cursor position.
async fn read_one_at(path: &Path, cursor: u64) -> Option<(Message, u64)> {
    let mut file = std::fs::File::open(path).ok()?;
    file.seek(SeekFrom::Start(cursor)).ok()?;
    let msg: Message = bincode::deserialize_from(&mut file).ok()?;
    let new_cursor = file.stream_position().ok()?;
    Some((msg, new_cursor))
}
