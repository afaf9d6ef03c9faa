//! Collector service
//!
//! Owns the device, the queue and the API client, and runs four loops
//! sharing one [`HealthTracker`]:
//! - sample: read meter, upload now or queue (store-and-forward)
//! - forward: drain the queue in batches (auto-upload only)
//! - heartbeat: report "ok"/"error" every 5 min
//! - maintenance: error-count reset and queue purge every hour
//!
//! Every loop waits on "tick OR shutdown". An in-flight serial read or HTTP
//! call is never interrupted; shutdown is observed at the next wait point.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::{ApiError, Credentials, DataPoint, HeartbeatStatus, UploadClient};
use crate::config::{CollectorConfig, ServiceConfig, ServiceTimings};
use crate::device::{DeviceError, DeviceReader};
use crate::health::{HealthSnapshot, HealthTracker, ServicePhase, BREAKER_THRESHOLD};
use crate::protocol::Reading;
use crate::queue::{DurableQueue, QueueStats, StorageError};
use crate::shutdown::{self, ShutdownSignal, ShutdownTrigger};

pub type Shared<T> = Arc<Mutex<T>>;

/// Floor for loop periods, `interval` panics on zero
const MIN_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service is already running")]
    AlreadyRunning,
    #[error("collector is not registered")]
    NotRegistered,
    #[error("service was stopped and its resources released")]
    Closed,
    #[error("ingestion API unreachable: {0}")]
    Unreachable(#[source] ApiError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Health plus queue counters, `queue` is `None` when stats could not be read
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    #[serde(flatten)]
    pub health: HealthSnapshot,
    pub queue: Option<QueueStats>,
}

struct RunHandle {
    trigger: ShutdownTrigger,
    handles: Vec<JoinHandle<()>>,
}

enum Lifecycle {
    Idle,
    Running(RunHandle),
    Closed,
}

pub struct CollectorService {
    config: ServiceConfig,
    timings: ServiceTimings,
    version: String,
    health: HealthTracker,
    device: Shared<DeviceReader>,
    queue: DurableQueue,
    client: UploadClient,
    lifecycle: Mutex<Lifecycle>,
}

impl CollectorService {
    pub fn new(
        mut config: ServiceConfig,
        credentials: Option<Credentials>,
        device: DeviceReader,
        queue: DurableQueue,
        client: UploadClient,
        version: impl Into<String>,
    ) -> Self {
        let client = match credentials {
            Some(creds) if creds.is_complete() => client.with_credentials(creds),
            Some(_) => {
                warn!("Ignoring incomplete credentials (collector id and token are both required)");
                client
            }
            None => client,
        };
        if config.collector_id.is_empty() {
            if let Some(creds) = client.credentials() {
                config.collector_id = creds.collector_id.clone();
            }
        }

        Self {
            health: HealthTracker::new(client.credentials().is_some()),
            config,
            timings: ServiceTimings::default(),
            version: version.into(),
            device: Arc::new(Mutex::new(device)),
            queue,
            client,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Opens serial port, queue database and HTTP client from a loaded config
    pub async fn open(config: &CollectorConfig, version: &str) -> Result<Self, ServiceError> {
        let device = DeviceReader::open(&config.serial.port, config.serial.baud_rate, config.serial_timeout())?
            .with_address(config.serial.address);
        let queue = DurableQueue::open(&config.data.cache_db).await?;
        let client = UploadClient::new(&config.client_settings(), version)?;

        Ok(Self::new(
            config.service_config(),
            config.credentials(),
            device,
            queue,
            client,
            version,
        ))
    }

    pub fn with_timings(mut self, timings: ServiceTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.health.is_running()
    }

    /// Probe the API, then spawn the loops and return
    pub async fn start(&self) -> Result<(), ServiceError> {
        if matches!(*self.lifecycle.lock(), Lifecycle::Closed) {
            return Err(ServiceError::Closed);
        }
        if !self.health.begin_start() {
            return Err(ServiceError::AlreadyRunning);
        }
        if self.client.credentials().is_none() {
            self.health.set_phase(ServicePhase::Stopped);
            return Err(ServiceError::NotRegistered);
        }

        info!("Starting collector service {} (v{})", self.config.collector_id, self.version);

        if let Err(e) = self.client.probe().await {
            error!("Connectivity check failed: {}", e);
            self.health.mark_offline();
            self.health.set_phase(ServicePhase::Stopped);
            return Err(ServiceError::Unreachable(e));
        }
        self.health.mark_online();

        let (trigger, signal) = shutdown::channel();
        let worker = Arc::new(Worker {
            config: self.config.clone(),
            timings: self.timings,
            version: self.version.clone(),
            health: self.health.clone(),
            device: self.device.clone(),
            queue: self.queue.clone(),
            client: self.client.clone().bind_shutdown(signal.clone()),
            shutdown: signal,
        });

        let mut handles = Vec::with_capacity(4);

        let w = worker.clone();
        handles.push(tokio::spawn(async move {
            w.every("Sample", w.config.sample_interval, || w.sample_once()).await
        }));

        if self.config.auto_upload {
            let w = worker.clone();
            handles.push(tokio::spawn(async move {
                w.every("Forward", w.config.upload_interval, || w.forward_once()).await
            }));
        } else {
            info!("Auto-upload disabled, queued readings stay local");
        }

        let w = worker.clone();
        handles.push(tokio::spawn(async move {
            w.every("Heartbeat", w.timings.heartbeat_interval, || w.heartbeat_once()).await
        }));

        let w = worker;
        handles.push(tokio::spawn(async move {
            w.every("Maintenance", w.timings.maintenance_interval, || w.maintenance_once()).await
        }));

        *self.lifecycle.lock() = Lifecycle::Running(RunHandle { trigger, handles });
        self.health.set_phase(ServicePhase::Running);
        info!("Collector service started");
        Ok(())
    }

    /// Signal the loops, wait for them, release device and queue. No-op when not running.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        if !self.health.begin_stop() {
            debug!("Stop requested but service is not running");
            return Ok(());
        }
        info!("Stopping collector service");

        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Closed);
        let mut first_failure = None;
        if let Lifecycle::Running(run) = previous {
            run.trigger.trigger();
            for handle in run.handles {
                if let Err(e) = handle.await {
                    error!("Collector loop ended abnormally: {}", e);
                    first_failure.get_or_insert(e);
                }
            }
        }

        self.device.lock().close();
        self.queue.close().await;
        self.health.mark_offline();
        self.health.set_phase(ServicePhase::Stopped);
        info!("Collector service stopped");

        match first_failure {
            Some(e) => Err(ServiceError::Task(e)),
            None => Ok(()),
        }
    }

    /// Heartbeat health verdict
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy(Utc::now(), self.config.sample_interval)
    }

    pub async fn status(&self) -> ServiceStatus {
        let queue = match self.queue.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Could not get cache stats: {}", e);
                None
            }
        };
        ServiceStatus {
            health: self.health.snapshot(),
            queue,
        }
    }

    /// One validated reading straight from the meter
    pub async fn self_test(&self) -> Result<Reading, ServiceError> {
        let device = self.device.clone();
        let reading = tokio::task::spawn_blocking(move || device.lock().test_connection()).await??;
        info!("Device self-test passed: {}", reading);
        Ok(reading)
    }
}

/// What each loop sees for the lifetime of one run
struct Worker {
    config: ServiceConfig,
    timings: ServiceTimings,
    version: String,
    health: HealthTracker,
    device: Shared<DeviceReader>,
    queue: DurableQueue,
    client: UploadClient,
    shutdown: ShutdownSignal,
}

impl Worker {
    /// First tick one full period after start
    async fn every<F, Fut>(&self, name: &str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let period = period.max(MIN_PERIOD);
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("{} loop started (every {:?})", name, period);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => tick().await,
            }
        }
        info!("{} loop stopped", name);
    }

    async fn sample_once(&self) {
        let device = self.device.clone();
        let attempts = self.timings.read_attempts;
        let reading = match tokio::task::spawn_blocking(move || device.lock().read_validated(attempts)).await {
            Ok(Ok(reading)) => reading,
            Ok(Err(e)) => return self.handle_error("data collection", e).await,
            Err(e) => return self.handle_error("data collection", e).await,
        };
        self.health.record_data(reading.timestamp);

        match self.client.upload_one(&reading).await {
            Ok(()) => {
                self.health.mark_online();
                debug!("Reading uploaded in real time: {}", reading);
            }
            Err(upload_err) => {
                warn!("Real-time upload failed: {}. Caching reading instead.", upload_err);
                self.health.mark_offline();
                match self.queue.store(&self.config.collector_id, &reading).await {
                    Ok(id) => debug!("Reading cached as #{}: {}", id, reading),
                    Err(store_err) => {
                        let dropped = self.health.record_dropped();
                        error!(
                            "Reading lost ({} dropped so far): upload failed ({}), caching failed ({})",
                            dropped, upload_err, store_err
                        );
                        self.handle_error("data caching", store_err).await;
                    }
                }
            }
        }
    }

    async fn forward_once(&self) {
        let entries = match self.queue.fetch_unuploaded(self.config.batch_size).await {
            Ok(entries) if entries.is_empty() => return,
            Ok(entries) => entries,
            Err(e) => return self.handle_error("cache read", e).await,
        };

        let points: Vec<DataPoint> = entries.iter().map(DataPoint::from).collect();
        if let Err(e) = self.client.upload_batch(&points).await {
            self.health.mark_offline();
            return self.handle_error("data upload", e).await;
        }

        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        if let Err(e) = self.queue.mark_uploaded(&ids).await {
            warn!("Uploaded {} cached readings but could not mark them: {}", ids.len(), e);
        }
        self.health.mark_online();
        info!("Uploaded {} cached readings", ids.len());
    }

    async fn heartbeat_once(&self) {
        let healthy = self.health.is_healthy(Utc::now(), self.config.sample_interval);
        let status = HeartbeatStatus::from_health(healthy);
        match self.client.heartbeat(status, &self.version).await {
            Ok(()) => {
                self.health.mark_online();
                debug!("Heartbeat sent ({:?})", status);
            }
            Err(e) => {
                self.health.mark_offline();
                self.handle_error("heartbeat", e).await;
            }
        }
    }

    async fn maintenance_once(&self) {
        if self.health.is_recovered(Utc::now(), self.config.sample_interval * 2) {
            self.health.reset_errors();
        }
        if let Err(e) = self.queue.purge_older_than(self.timings.retention).await {
            self.handle_error("cache cleanup", e).await;
        }
        let snapshot = self.health.snapshot();
        info!(
            "Maintenance completed (errors: {}, dropped: {}, online: {})",
            snapshot.error_count, snapshot.dropped_readings, snapshot.is_online
        );
    }

    async fn handle_error(&self, operation: &str, err: impl Display) {
        trip_breaker(&self.health, self.timings.breaker_pause, &self.shutdown, operation, err).await;
    }
}

/// Count the failure; past the threshold pause this loop, then clamp the count.
/// Returns true when the pause ran.
async fn trip_breaker(
    health: &HealthTracker,
    pause: Duration,
    shutdown: &ShutdownSignal,
    operation: &str,
    err: impl Display,
) -> bool {
    let count = health.record_error();
    warn!("Error in {}: {} (error count: {})", operation, err, count);
    if count <= BREAKER_THRESHOLD {
        return false;
    }

    warn!("Too many errors, pausing {} for {:?}", operation, pause);
    let mut shutdown = shutdown.clone();
    tokio::select! {
        _ = tokio::time::sleep(pause) => {}
        _ = shutdown.triggered() => debug!("Pause cut short by shutdown"),
    }
    health.clamp_errors();
    true
}
