//! Append-only rotating log of sample records.
//!
//! Every sample is written to the current log file on the local storage
//! medium, the last line of defense when the message bus is unreachable for
//! long stretches. Files rotate once their line count exceeds
//! [`ROTATION_LINE_LIMIT`]; the name of the open file is persisted to
//! configuration so a restart can resume it after a power cut.
//!
//! One internal lock guards the open file handle, its line counter and the
//! enabled flag. Appends, rotation, deletion and the transfer-session flush
//! all serialize on it; the rotation check itself runs before the lock is
//! taken so exactly one writer performs the rotation per threshold crossing.

use crate::config::ConfigStore;
use crate::error::NodeResult;
use crate::record::{DecimalStyle, SampleRecord, COLUMN_HEADER};
use chrono::Local;
use log::{info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A file is rotated once it holds more than this many record lines
/// (4 hours at 1 sample per second).
pub const ROTATION_LINE_LIMIT: usize = 14_400;

/// File name for the open log while `delete_all` clears the directory.
const RESTORE_NAME: &str = "restore";

struct LogInner {
    enabled: bool,
    file: Option<File>,
    lines: usize,
    current_name: Option<String>,
}

/// Owns the rotating log directory and the single open log file.
pub struct LogStore {
    node_id: u32,
    dir: PathBuf,
    style: DecimalStyle,
    rotation_limit: usize,
    config: Arc<ConfigStore>,
    inner: Mutex<LogInner>,
}

impl LogStore {
    pub fn new(config: Arc<ConfigStore>) -> NodeResult<Self> {
        let settings = config.settings();
        let dir = settings.logs_dir();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            node_id: settings.node_id,
            dir,
            style: settings.decimal_style,
            rotation_limit: ROTATION_LINE_LIMIT,
            config,
            inner: Mutex::new(LogInner {
                enabled: false,
                file: None,
                lines: 0,
                current_name: None,
            }),
        })
    }

    /// Overrides the rotation threshold; used by tests to exercise the
    /// rotation boundary without writing 14k lines.
    pub fn with_rotation_limit(mut self, limit: usize) -> Self {
        self.rotation_limit = limit;
        self
    }

    /// Applies the boot-time logging policy: resume the last known file when
    /// logging was enabled at shutdown, otherwise stay disabled.
    pub fn init_from_boot_config(&self) -> NodeResult<()> {
        let settings = self.config.settings();
        if !settings.log_at_boot {
            info!("logging disabled at boot");
            return Ok(());
        }
        match settings.current_log {
            Some(name) => self.restart_from_last_known(&name),
            None => self.start_new_file(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serializes the record and appends it to the current file.
    ///
    /// Silently does nothing while logging is disabled. The rotation check
    /// runs before the write lock is acquired, so the record that crosses the
    /// threshold lands in the new file.
    pub fn append(&self, record: &SampleRecord) -> NodeResult<()> {
        let needs_rotation = {
            let inner = self.lock();
            inner.enabled && inner.lines > self.rotation_limit
        };
        if needs_rotation {
            self.start_new_file()?;
        }

        let mut inner = self.lock();
        if !inner.enabled {
            return Ok(());
        }
        let line = record.to_line(self.style);
        if let Some(file) = inner.file.as_mut() {
            writeln!(file, "{line}")?;
            file.flush()?;
            inner.lines += 1;
        }
        Ok(())
    }

    /// Closes any open file and opens a fresh one with a timestamp-derived
    /// name, writing the description and column-header lines. Enables logging
    /// and persists the new file name.
    pub fn start_new_file(&self) -> NodeResult<()> {
        let stamp = Local::now().format("%Y_%m_%d__%H_%M_%S");
        let base = format!("Node_{}_Remote_Log___{stamp}", self.node_id);

        // Two files opened within the same wall-clock second (rotation right
        // after start, or back-to-back START_LOGGING commands) would derive
        // the same name and truncate the earlier file; disambiguate instead.
        let mut label = base.clone();
        let mut suffix = 1;
        while self.dir.join(format!("{label}.csv")).exists() {
            suffix += 1;
            label = format!("{base}_{suffix}");
        }
        let name = format!("{label}.csv");
        let path = self.dir.join(&name);

        {
            let mut inner = self.lock();
            inner.file = None;
            let mut file = File::create(&path)?;
            writeln!(file, "{label}")?;
            writeln!(file, "{COLUMN_HEADER}")?;
            file.flush()?;
            info!("created log file {name}");
            inner.file = Some(file);
            inner.lines = 0;
            inner.enabled = true;
            inner.current_name = Some(name.clone());
        }

        self.config.update(|s| s.current_log = Some(name))
    }

    /// Closes the current file and disables logging.
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.enabled = false;
        inner.file = None;
        info!("logging stopped");
    }

    /// Reopens the named file for appending, seeding the rotation counter
    /// from its existing line count. Falls back to a fresh file when the
    /// named one is gone.
    pub fn restart_from_last_known(&self, name: &str) -> NodeResult<()> {
        let path = self.dir.join(name);
        if !path.exists() {
            warn!("last known log file {name} is missing, starting a new one");
            return self.start_new_file();
        }

        let existing_lines = BufReader::new(File::open(&path)?).lines().count();
        let file = OpenOptions::new().append(true).open(&path)?;
        info!("resuming log file {name} at line {existing_lines}");

        let mut inner = self.lock();
        inner.file = Some(file);
        inner.lines = existing_lines;
        inner.enabled = true;
        inner.current_name = Some(name.to_string());
        Ok(())
    }

    /// Deletes every log file except the one currently open.
    ///
    /// The open file is moved aside while the directory is cleared, then
    /// moved back and reopened for appending.
    pub fn delete_all(&self) -> NodeResult<()> {
        let mut inner = self.lock();

        let kept = if inner.enabled {
            inner.file = None;
            match inner.current_name.clone() {
                Some(name) => {
                    fs::rename(self.dir.join(&name), self.dir.join(RESTORE_NAME))?;
                    Some(name)
                }
                None => None,
            }
        } else {
            None
        };

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "csv") {
                if let Err(err) = fs::remove_file(&path) {
                    warn!("failed to delete {}: {err}", path.display());
                }
            }
        }

        if let Some(name) = kept {
            let path = self.dir.join(&name);
            fs::rename(self.dir.join(RESTORE_NAME), &path)?;
            inner.file = Some(OpenOptions::new().append(true).open(&path)?);
        }
        info!("log files deleted");
        Ok(())
    }

    /// Flushes the open file under the log lock, so a transfer-session
    /// snapshot reflects everything written before the session began.
    pub fn flush_current(&self) -> NodeResult<()> {
        let mut inner = self.lock();
        if let Some(file) = inner.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }

    /// Ordered snapshot of the log files in the storage directory.
    ///
    /// Only files matching the log naming scheme are listed; unrelated files
    /// on the storage medium are never transferred.
    pub fn snapshot_files(&self) -> NodeResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if name.starts_with("Node_") && name.contains("_Remote_Log___") && name.ends_with(".csv")
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn current_file_name(&self) -> Option<String> {
        self.lock().current_name.clone()
    }

    pub fn line_count(&self) -> usize {
        self.lock().lines
    }

    /// Closes the open file handle at process shutdown without touching the
    /// persisted logging flag.
    pub fn close(&self) {
        let mut inner = self.lock();
        if let Some(file) = inner.file.as_mut() {
            if let Err(err) = file.flush() {
                warn!("failed to flush log file at shutdown: {err}");
            }
        }
        inner.file = None;
    }
}
