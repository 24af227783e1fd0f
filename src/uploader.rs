//! Stop-and-wait log retrieval over the message bus.
//!
//! A client that wants the node's archives sends `GET_ALL_LOGS`. The session
//! snapshots the log directory, then publishes one file per message on the
//! transfer topic, blocking after each send until the client answers with
//! `GET_NEXT_LOG` (advance) or `GET_PREVIOUS_LOG` (resend). Only one session
//! may be active at a time; a point-in-time archive is transferred, so
//! records appended during the session are not part of its snapshot.
//!
//! The transfer loop runs on a blocking task and parks on a condition
//! variable between sends. Flow-control commands arrive on the async command
//! path and only flip flags under the shared lock, so an out-of-order
//! command can never wedge or crash the loop: it is logged and ignored.
//!
//! `abort` is a shutdown-only transition: once set it is never cleared, and
//! session admission is refused for the remainder of the process lifetime.

use crate::logstore::LogStore;
use crate::msgbus::MessageBus;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct SessionState {
    /// A transfer loop is running.
    active: bool,
    /// The loop is parked waiting for a client answer.
    waiting_answer: bool,
    /// Client asked for the next file (false = resend the current one).
    wants_next: bool,
    /// Shutdown requested; never cleared.
    abort: bool,
}

struct Shared {
    state: Mutex<SessionState>,
    client_answered: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle for starting and steering log retrieval sessions.
#[derive(Clone)]
pub struct LogUploader {
    shared: Arc<Shared>,
}

impl Default for LogUploader {
    fn default() -> Self {
        Self::new()
    }
}

impl LogUploader {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::default()),
                client_answered: Condvar::new(),
            }),
        }
    }

    /// Admits and launches one transfer session.
    ///
    /// Returns `false` (logged, ignored) when a session is already active or
    /// shutdown has begun. On admission the current log file is flushed under
    /// the log lock before the directory snapshot is taken.
    pub fn start_session(
        &self,
        store: Arc<LogStore>,
        bus: Arc<dyn MessageBus>,
        transfer_topic: String,
        log_topic: String,
    ) -> bool {
        {
            let mut state = self.shared.lock();
            if state.abort {
                warn!("refusing log retrieval session: shutdown in progress");
                return false;
            }
            if state.active {
                warn!("refusing log retrieval session: another session is active");
                return false;
            }
            state.active = true;
        }

        if let Err(err) = store.flush_current() {
            warn!("failed to flush current log before snapshot: {err}");
        }
        let files = match store.snapshot_files() {
            Ok(files) => files,
            Err(err) => {
                warn!("failed to list log files: {err}");
                self.shared.lock().active = false;
                return false;
            }
        };

        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || {
            run_session(&shared, &files, bus.as_ref(), &transfer_topic, &log_topic);
        });
        true
    }

    /// Client acknowledged the current file; move to the next one.
    pub fn advance(&self) {
        self.answer(true, "GET_NEXT_LOG");
    }

    /// Client wants the file it just received again.
    pub fn resend_current(&self) {
        self.answer(false, "GET_PREVIOUS_LOG");
    }

    fn answer(&self, wants_next: bool, command: &str) {
        let mut state = self.shared.lock();
        if !state.active {
            info!("{command} received but no retrieval session is active");
            return;
        }
        if !state.waiting_answer {
            info!("{command} received but the session is not waiting for an answer");
            return;
        }
        state.wants_next = wants_next;
        state.waiting_answer = false;
        self.shared.client_answered.notify_one();
    }

    /// Requests shutdown: wakes a parked transfer loop and permanently
    /// refuses new sessions.
    pub fn abort(&self) {
        let mut state = self.shared.lock();
        state.abort = true;
        if state.active && state.waiting_answer {
            state.waiting_answer = false;
            self.shared.client_answered.notify_one();
        }
    }

    /// Whether the transfer loop is currently parked awaiting an answer.
    pub fn is_waiting(&self) -> bool {
        self.shared.lock().waiting_answer
    }

    pub fn is_active(&self) -> bool {
        self.shared.lock().active
    }
}

fn run_session(
    shared: &Arc<Shared>,
    files: &[PathBuf],
    bus: &dyn MessageBus,
    transfer_topic: &str,
    log_topic: &str,
) {
    info!("log retrieval session started ({} files)", files.len());
    let mut aborted = false;

    'files: for (idx, path) in files.iter().enumerate() {
        loop {
            // Re-read on every (re)send so a resend reflects what is on disk.
            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    warn!("log file {} vanished during the session", path.display());
                    continue 'files;
                }
                Err(err) => {
                    warn!("failed to read {}: {err}, skipping", path.display());
                    continue 'files;
                }
            };
            info!(
                "sending log file {} of {}: {}",
                idx + 1,
                files.len(),
                path.display()
            );

            // The lock is held across the publish, as in the command path,
            // so an answer can only arrive once the loop is ready to park.
            let mut state = shared.lock();
            bus.publish(transfer_topic, &content);
            state.waiting_answer = true;
            while state.waiting_answer && !state.abort {
                state = shared
                    .client_answered
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if state.abort {
                aborted = true;
                break 'files;
            }
            if state.wants_next {
                break;
            }
            // Otherwise loop around and resend the same file.
        }
    }

    {
        let mut state = shared.lock();
        state.active = false;
        state.waiting_answer = false;
    }

    if aborted {
        info!("log retrieval session aborted");
    } else {
        bus.publish(log_topic, "all logs sent");
        info!("all log files sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::msgbus::MemoryBus;
    use std::time::Duration;

    const TRANSFER: &str = "t/transfer";
    const LOG: &str = "t/log";

    fn store_with_files(dir: &std::path::Path, count: usize) -> Arc<LogStore> {
        let settings = crate::config::tests::test_settings(dir.to_path_buf());
        let config =
            Arc::new(ConfigStore::create(&dir.join("airnode.toml"), settings).expect("config"));
        let store = Arc::new(LogStore::new(config).expect("store"));
        for i in 0..count {
            let name = format!("Node_7_Remote_Log___2024_01_0{}__00_00_00.csv", i + 1);
            std::fs::write(dir.join("logs").join(name), format!("file-{i}\n")).expect("write");
        }
        store
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_streams_all_files_then_publishes_completion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with_files(dir.path(), 3);
        let bus = Arc::new(MemoryBus::new());
        let uploader = LogUploader::new();

        assert!(uploader.start_session(
            Arc::clone(&store),
            bus.clone(),
            TRANSFER.into(),
            LOG.into()
        ));
        for expected in 1..=3 {
            wait_until("file send", || {
                bus.published_on(TRANSFER).len() == expected
            })
            .await;
            uploader.advance();
        }
        wait_until("completion", || !uploader.is_active()).await;

        assert_eq!(
            bus.published_on(TRANSFER),
            vec!["file-0\n", "file-1\n", "file-2\n"]
        );
        assert_eq!(bus.published_on(LOG), vec!["all logs sent"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resend_republishes_byte_for_byte() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with_files(dir.path(), 1);
        let bus = Arc::new(MemoryBus::new());
        let uploader = LogUploader::new();

        uploader.start_session(store, bus.clone(), TRANSFER.into(), LOG.into());
        wait_until("first send", || bus.published_on(TRANSFER).len() == 1).await;
        uploader.resend_current();
        wait_until("resend", || bus.published_on(TRANSFER).len() == 2).await;

        let sent = bus.published_on(TRANSFER);
        assert_eq!(sent[0], sent[1], "resend must be byte-identical");

        uploader.advance();
        wait_until("completion", || !uploader.is_active()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abort_terminates_without_completion_notice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with_files(dir.path(), 2);
        let bus = Arc::new(MemoryBus::new());
        let uploader = LogUploader::new();

        uploader.start_session(store.clone(), bus.clone(), TRANSFER.into(), LOG.into());
        wait_until("first send", || bus.published_on(TRANSFER).len() == 1).await;
        uploader.abort();
        wait_until("session end", || !uploader.is_active()).await;

        assert_eq!(bus.published_on(TRANSFER).len(), 1);
        assert!(bus.published_on(LOG).is_empty(), "no completion after abort");

        // Admission stays refused after shutdown began.
        assert!(!uploader.start_session(store, bus, TRANSFER.into(), LOG.into()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flow_commands_without_session_are_noops() {
        let uploader = LogUploader::new();
        uploader.advance();
        uploader.resend_current();
        assert!(!uploader.is_active());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_session_is_rejected_while_one_is_active() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with_files(dir.path(), 1);
        let bus = Arc::new(MemoryBus::new());
        let uploader = LogUploader::new();

        assert!(uploader.start_session(
            store.clone(),
            bus.clone(),
            TRANSFER.into(),
            LOG.into()
        ));
        wait_until("first send", || bus.published_on(TRANSFER).len() == 1).await;
        assert!(!uploader.start_session(
            store.clone(),
            bus.clone(),
            TRANSFER.into(),
            LOG.into()
        ));

        uploader.advance();
        wait_until("completion", || !uploader.is_active()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn vanished_file_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with_files(dir.path(), 2);
        let bus = Arc::new(MemoryBus::new());
        let uploader = LogUploader::new();

        // Delete the second file before the session reaches it.
        let files = store.snapshot_files().expect("snapshot");
        uploader.start_session(store.clone(), bus.clone(), TRANSFER.into(), LOG.into());
        wait_until("first send", || bus.published_on(TRANSFER).len() == 1).await;
        std::fs::remove_file(&files[1]).expect("remove");
        uploader.advance();
        wait_until("completion", || !uploader.is_active()).await;

        assert_eq!(bus.published_on(TRANSFER).len(), 1);
        assert_eq!(bus.published_on(LOG), vec!["all logs sent"]);
    }
}
