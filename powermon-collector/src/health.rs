//! Service health
//!
//! Handles:
//! - Lifecycle phase with atomic start/stop transitions
//! - Online flag, last data time, error and dropped-reading counters
//! - Heartbeat verdict and the maintenance recovery check

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Above this many errors a loop pauses before going on
pub const BREAKER_THRESHOLD: u32 = 10;
/// Where the error count lands after a pause
pub const BREAKER_CLAMP: u32 = 5;
/// Above this many errors the heartbeat reports "error"
pub const UNHEALTHY_ERRORS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServicePhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub phase: ServicePhase,
    pub is_running: bool,
    pub is_registered: bool,
    pub is_online: bool,
    pub last_data_time: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub dropped_readings: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug)]
struct HealthState {
    phase: ServicePhase,
    is_registered: bool,
    is_online: bool,
    last_data_time: Option<DateTime<Utc>>,
    error_count: u32,
    dropped_readings: u64,
}

/// Shared health record, one lock, never held across I/O
#[derive(Debug, Clone)]
pub struct HealthTracker {
    start_time: Instant,
    state: Arc<RwLock<HealthState>>,
}

impl HealthTracker {
    pub fn new(is_registered: bool) -> Self {
        Self {
            start_time: Instant::now(),
            state: Arc::new(RwLock::new(HealthState {
                phase: ServicePhase::Stopped,
                is_registered,
                is_online: false,
                last_data_time: None,
                error_count: 0,
                dropped_readings: 0,
            })),
        }
    }

    pub fn phase(&self) -> ServicePhase {
        self.state.read().phase
    }

    pub fn set_phase(&self, phase: ServicePhase) {
        self.state.write().phase = phase;
    }

    /// Stopped -> Starting, atomically. False if the service is not stopped.
    pub fn begin_start(&self) -> bool {
        let mut state = self.state.write();
        if state.phase != ServicePhase::Stopped {
            return false;
        }
        state.phase = ServicePhase::Starting;
        true
    }

    /// Running -> Stopping, atomically. False if there is nothing to stop.
    pub fn begin_stop(&self) -> bool {
        let mut state = self.state.write();
        if state.phase != ServicePhase::Running {
            return false;
        }
        state.phase = ServicePhase::Stopping;
        true
    }

    pub fn is_running(&self) -> bool {
        self.phase() == ServicePhase::Running
    }

    pub fn is_registered(&self) -> bool {
        self.state.read().is_registered
    }

    pub fn set_registered(&self, registered: bool) {
        self.state.write().is_registered = registered;
    }

    pub fn is_online(&self) -> bool {
        self.state.read().is_online
    }

    pub fn mark_online(&self) {
        self.state.write().is_online = true;
    }

    pub fn mark_offline(&self) {
        self.state.write().is_online = false;
    }

    pub fn record_data(&self, at: DateTime<Utc>) {
        self.state.write().last_data_time = Some(at);
    }

    pub fn last_data_time(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_data_time
    }

    /// Bumps the error count, returns the new value
    pub fn record_error(&self) -> u32 {
        let mut state = self.state.write();
        state.error_count = state.error_count.saturating_add(1);
        state.error_count
    }

    pub fn error_count(&self) -> u32 {
        self.state.read().error_count
    }

    /// After a breaker pause
    pub fn clamp_errors(&self) {
        let mut state = self.state.write();
        state.error_count = state.error_count.min(BREAKER_CLAMP);
    }

    pub fn reset_errors(&self) {
        self.state.write().error_count = 0;
    }

    pub fn record_dropped(&self) -> u64 {
        let mut state = self.state.write();
        state.dropped_readings += 1;
        state.dropped_readings
    }

    /// Online with data fresher than `window`
    pub fn is_recovered(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let state = self.state.read();
        state.is_online
            && data_age(state.last_data_time, now).is_some_and(|age| age < to_delta(window))
    }

    /// Heartbeat status: running, registered, fresh data (3 sample periods), few errors
    pub fn is_healthy(&self, now: DateTime<Utc>, sample_interval: Duration) -> bool {
        let state = self.state.read();
        state.phase == ServicePhase::Running
            && state.is_registered
            && data_age(state.last_data_time, now)
                .is_some_and(|age| age <= to_delta(sample_interval * 3))
            && state.error_count <= UNHEALTHY_ERRORS
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.read();
        HealthSnapshot {
            phase: state.phase,
            is_running: state.phase == ServicePhase::Running,
            is_registered: state.is_registered,
            is_online: state.is_online,
            last_data_time: state.last_data_time,
            error_count: state.error_count,
            dropped_readings: state.dropped_readings,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

fn data_age(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<chrono::Duration> {
    last.map(|last| now - last)
}

fn to_delta(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX)
}
