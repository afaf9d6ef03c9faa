//! Powermon collector - edge agent for PZEM-style power meters
//!
//! Samples the meter over a serial Modbus link and forwards readings to an
//! HTTP ingestion API, buffering them in a local SQLite queue while the
//! network is down.

pub mod client;
pub mod config;
pub mod device;
pub mod health;
pub mod protocol;
pub mod queue;
pub mod retry;
pub mod service;
pub mod shutdown;

pub use client::{ApiError, Credentials, UploadClient};
pub use config::{CollectorConfig, ServiceConfig, ServiceTimings};
pub use device::{DeviceError, DeviceReader};
pub use protocol::Reading;
pub use queue::{DurableQueue, QueueStats, StorageError};
pub use service::{CollectorService, ServiceError, ServiceStatus};

/// Reported to the API at registration and in heartbeats
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
