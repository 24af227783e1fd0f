//! The sensor node: composition of driver, filters, log store and uploader.
//!
//! An external scheduler owns the cadence and calls [`Node::tick`] once per
//! sampling period. Each tick runs one bus sample attempt on a blocking task
//! with a bounded wait, filters valid readings, assembles a composite record
//! with collaborator sensor values, publishes it and appends it to the log.
//!
//! The bus channel is exclusively owned by the driver: if a previous sample
//! attempt is still in flight when the next tick fires, this tick treats the
//! sample as unavailable rather than starting a second exchange.

use crate::commands::Command;
use crate::config::{ConfigStore, Topics};
use crate::error::NodeResult;
use crate::filter::{FilterBank, FilteredReading};
use crate::logstore::LogStore;
use crate::msgbus::MessageBus;
use crate::opc::{BusChannel, OpcDriver, RawReading};
use crate::record::{DecimalStyle, SampleRecord};
use crate::sensors::{AuxSensors, GpsSource, SecondaryPmSensor};
use crate::uploader::LogUploader;
use chrono::Local;
use log::{info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Bounded wait for one sample attempt; a slow bus exchange continues in the
/// background but the tick proceeds without it.
const SAMPLE_WAIT: Duration = Duration::from_millis(150);

pub struct Node<C: BusChannel + 'static> {
    config: Arc<ConfigStore>,
    topics: Topics,
    bus: Arc<dyn MessageBus>,
    driver: Arc<Mutex<OpcDriver<C>>>,
    filters: Mutex<FilterBank>,
    store: Arc<LogStore>,
    uploader: LogUploader,
    gps: Arc<dyn GpsSource>,
    aux: Arc<dyn AuxSensors>,
    secondary: Arc<dyn SecondaryPmSensor>,
    events: Mutex<VecDeque<String>>,
    iteration: AtomicU64,
    ip: Mutex<String>,
    image_file: Mutex<String>,
}

impl<C: BusChannel + 'static> Node<C> {
    pub fn new(
        config: Arc<ConfigStore>,
        bus: Arc<dyn MessageBus>,
        driver: OpcDriver<C>,
        gps: Arc<dyn GpsSource>,
        aux: Arc<dyn AuxSensors>,
        secondary: Arc<dyn SecondaryPmSensor>,
    ) -> NodeResult<Self> {
        let settings = config.settings();
        let topics = Topics::for_node(&settings);
        let store = Arc::new(LogStore::new(Arc::clone(&config))?);
        store.init_from_boot_config()?;
        Ok(Self {
            topics,
            bus,
            driver: Arc::new(Mutex::new(driver)),
            filters: Mutex::new(FilterBank::new(settings.kp_base, settings.kd_base)),
            store,
            uploader: LogUploader::new(),
            gps,
            aux,
            secondary,
            events: Mutex::new(VecDeque::new()),
            iteration: AtomicU64::new(0),
            ip: Mutex::new("unknown".to_string()),
            image_file: Mutex::new("none".to_string()),
            config,
        })
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    /// Brings the particulate sensor up. A start failure is logged, not
    /// fatal: the driver restarts itself once samples begin failing.
    pub async fn start(&self) {
        let driver = Arc::clone(&self.driver);
        let result = tokio::task::spawn_blocking(move || {
            let mut driver = driver.lock().unwrap_or_else(PoisonError::into_inner);
            driver.start()
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("particulate sensor start failed: {err}"),
            Err(err) => warn!("sampling task panicked during start: {err}"),
        }
    }

    /// One sampling/logging step, driven by the external scheduler.
    pub async fn tick(&self) {
        let iteration = self.iteration.fetch_add(1, Ordering::Relaxed) + 1;
        let period = self.config.settings().sampling_period_secs;

        let raw = self.sample_with_bounded_wait().await;
        let filtered = if raw.valid {
            self.filters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .step(&raw, period)
        } else {
            FilteredReading::SENTINEL
        };

        let gps = self.gps.fix().await;
        let aux = self.aux.read().await;
        let secondary = self.secondary.read().await;
        let (kp_base, kd_base) = self
            .filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .constants();

        let record = SampleRecord {
            iteration,
            timestamp: Local::now(),
            gps,
            aux,
            raw,
            filtered,
            kp_base,
            kd_base,
            event: self.pop_event(),
            image_file: self
                .image_file
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            secondary,
            ip: self.ip.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            sampling_period_secs: period,
        };

        self.bus
            .publish(&self.topics.sensor_data, &record.to_line(DecimalStyle::Point));
        if let Err(err) = self.store.append(&record) {
            warn!("failed to append sample to log: {err}");
        }
    }

    async fn sample_with_bounded_wait(&self) -> RawReading {
        let driver = Arc::clone(&self.driver);
        let attempt = tokio::task::spawn_blocking(move || match driver.try_lock() {
            Ok(mut driver) => Some(driver.sample()),
            // A previous attempt still owns the bus; never run two at once.
            Err(_) => None,
        });

        match tokio::time::timeout(SAMPLE_WAIT, attempt).await {
            Ok(Ok(Some(reading))) => reading,
            Ok(Ok(None)) => {
                warn!("previous sample attempt still in flight, sample unavailable this tick");
                RawReading::INVALID
            }
            Ok(Err(err)) => {
                warn!("sampling task panicked: {err}");
                RawReading::INVALID
            }
            Err(_) => {
                warn!("sample attempt exceeded {SAMPLE_WAIT:?}, sample unavailable this tick");
                RawReading::INVALID
            }
        }
    }

    /// Dispatches one parsed management command.
    pub async fn handle_command(&self, payload: &str) {
        let command = match Command::parse(payload) {
            Ok(command) => command,
            Err(err) => {
                warn!("ignoring management payload: {err}");
                return;
            }
        };
        info!("running command {command:?}");
        self.bus.publish(&self.topics.log, &command.acknowledgment());

        match command {
            Command::StartLogging => {
                if let Err(err) = self.store.start_new_file() {
                    warn!("failed to start log file: {err}");
                    return;
                }
                self.persist(|s| s.log_at_boot = true);
            }
            Command::StopLogging => {
                self.store.stop();
                self.persist(|s| s.log_at_boot = false);
            }
            Command::GetAllLogs => {
                self.uploader.start_session(
                    Arc::clone(&self.store),
                    Arc::clone(&self.bus),
                    self.topics.transfer.clone(),
                    self.topics.log.clone(),
                );
            }
            Command::GetNextLog => self.uploader.advance(),
            Command::GetPreviousLog => self.uploader.resend_current(),
            Command::DeleteLogs => {
                if let Err(err) = self.store.delete_all() {
                    warn!("failed to delete log files: {err}");
                    return;
                }
                self.bus.publish(&self.topics.log, "log files deleted");
            }
            Command::TestFilter { kp, kd } => {
                self.filters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .set_constants(kp, kd);
            }
            Command::SaveFilter { kp, kd } => {
                self.filters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .set_constants(kp, kd);
                self.persist(|s| {
                    s.kp_base = kp;
                    s.kd_base = kd;
                });
            }
            Command::SetSamplingPeriod { secs } => {
                self.persist(|s| s.sampling_period_secs = secs);
                info!("sampling period set to {secs} s");
            }
            Command::RegisterEvent { description } => {
                self.events
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(description);
            }
        }
    }

    /// Shutdown: abort any transfer session, stop the device, close the log.
    pub async fn shutdown(&self) {
        self.uploader.abort();

        let driver = Arc::clone(&self.driver);
        let result = tokio::task::spawn_blocking(move || {
            let mut driver = driver.lock().unwrap_or_else(PoisonError::into_inner);
            driver.stop()
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("particulate sensor stop failed: {err}"),
            Err(err) => warn!("sampling task panicked during stop: {err}"),
        }

        self.store.close();
        info!("sensor node stopped");
    }

    /// Records the node's network address for subsequent sample records.
    pub fn set_ip(&self, ip: &str) {
        *self.ip.lock().unwrap_or_else(PoisonError::into_inner) = ip.to_string();
    }

    /// Records the latest captured image name for subsequent sample records.
    pub fn set_image_file(&self, name: &str) {
        *self
            .image_file
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = name.to_string();
    }

    fn pop_event(&self) -> String {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| "none".to_string())
    }

    fn persist<F: FnOnce(&mut crate::config::Settings)>(&self, apply: F) {
        if let Err(err) = self.config.update(apply) {
            warn!("failed to persist configuration: {err}");
        }
    }
}
