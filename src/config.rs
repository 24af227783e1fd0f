//! Configuration management.
//!
//! Settings are loaded from a TOML file with the `config` crate and written
//! back in place whenever a remote command changes them (`SAVE_FILTER`,
//! `SET_SAMPLING_PERIOD`, logging start/stop, log rotation). The node must
//! survive power cycles, so the current log file name and the
//! logging-enabled-at-boot flag live here rather than in process memory.

use crate::error::{NodeError, NodeResult};
use crate::record::DecimalStyle;
use config::Config;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Numeric identifier of this node, used in log file names and topics.
    pub node_id: u32,
    /// Root of the local storage medium; log files go to `<root>/logs`.
    pub storage_root: PathBuf,
    /// Seconds between sampling ticks.
    pub sampling_period_secs: u32,
    /// Base proportional constant of the adaptive observation noise.
    pub kp_base: f64,
    /// Base divergence constant of the adaptive observation noise.
    pub kd_base: f64,
    /// Whether logging resumes automatically at boot.
    pub log_at_boot: bool,
    /// File name of the log that was open the last time the node ran.
    #[serde(default)]
    pub current_log: Option<String>,
    /// Decimal separator used in serialized log lines.
    #[serde(default)]
    pub decimal_style: DecimalStyle,
    /// Topic prefix; per-node topics are derived by appending `sn_<node_id>`.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_topic_prefix() -> String {
    "airnode/sensor_nodes".to_string()
}

impl Settings {
    pub fn logs_dir(&self) -> PathBuf {
        self.storage_root.join("logs")
    }
}

/// Derived per-node topic names.
#[derive(Debug, Clone)]
pub struct Topics {
    /// Per-sample published records.
    pub sensor_data: String,
    /// Human-readable status and command acknowledgments.
    pub log: String,
    /// Log file contents during a retrieval session.
    pub transfer: String,
    /// Inbound commands.
    pub management: String,
}

impl Topics {
    pub fn for_node(settings: &Settings) -> Self {
        let prefix = &settings.topic_prefix;
        let id = settings.node_id;
        Self {
            sensor_data: format!("{prefix}/sn_{id}"),
            log: format!("{prefix}/logs/sn_{id}"),
            transfer: format!("{prefix}/csvfiles/sn_{id}"),
            management: format!("{prefix}/management/sn_{id}"),
        }
    }
}

/// Owns the settings file and serializes concurrent updates to it.
///
/// The log store persists the current file name on rotation while command
/// handlers persist filter constants and the sampling period, so every
/// mutation goes through [`ConfigStore::update`] which rewrites the file
/// under an internal lock.
pub struct ConfigStore {
    path: PathBuf,
    inner: Mutex<Settings>,
}

impl ConfigStore {
    pub fn load(path: &Path) -> NodeResult<Self> {
        let settings = Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(NodeError::Config)?
            .try_deserialize()
            .map_err(NodeError::Config)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(settings),
        })
    }

    /// Creates a store from in-memory settings, writing the initial file.
    pub fn create(path: &Path, settings: Settings) -> NodeResult<Self> {
        let store = Self {
            path: path.to_path_buf(),
            inner: Mutex::new(settings),
        };
        store.save()?;
        Ok(store)
    }

    /// A snapshot of the current settings.
    pub fn settings(&self) -> Settings {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mutates the settings and persists them in place.
    pub fn update<F>(&self, apply: F) -> NodeResult<()>
    where
        F: FnOnce(&mut Settings),
    {
        {
            let mut settings = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            apply(&mut settings);
        }
        self.save()
    }

    fn save(&self) -> NodeResult<()> {
        let rendered = {
            let settings = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            toml::to_string_pretty(&*settings)?
        };
        std::fs::write(&self.path, rendered)?;
        Ok(())
    }
}
