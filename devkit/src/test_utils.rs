/*!
Test Harness pour le service collecteur

Câble un `CollectorService` complet sur des doublures:
- compteur simulé (`MockSerialLink`)
- faux serveur d'ingestion (`MockIngestServer`)
- file SQLite dans un répertoire temporaire
- intervalles en millisecondes pour des tests rapides
*/

use crate::ingest_stub::{MockIngestServer, API_PREFIX, MOCK_TOKEN};
use crate::serial_stub::MockSerialLink;
use anyhow::Result;
use powermon_collector::client::ClientSettings;
use powermon_collector::retry::RetryPolicy;
use powermon_collector::{
    CollectorService, Credentials, DeviceReader, DurableQueue, ServiceConfig, ServiceTimings,
    UploadClient,
};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

pub const COLLECTOR_ID: &str = "collector-under-test";

/// Réglages du harness, modifiables avant `build`
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub sample_interval: Duration,
    pub upload_interval: Duration,
    pub batch_size: u32,
    pub auto_upload: bool,
    pub registered: bool,
    pub timings: ServiceTimings,
    pub retry: RetryPolicy,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(50),
            upload_interval: Duration::from_millis(80),
            batch_size: 100,
            auto_upload: true,
            registered: true,
            timings: ServiceTimings {
                heartbeat_interval: Duration::from_millis(100),
                maintenance_interval: Duration::from_millis(150),
                breaker_pause: Duration::from_millis(200),
                retention: Duration::from_secs(7 * 24 * 3600),
                read_attempts: 3,
            },
            retry: RetryPolicy::fixed(2, Duration::from_millis(10)),
        }
    }
}

/// Harness de test complet pour le collecteur
pub struct TestHarness {
    pub serial: MockSerialLink,
    pub server: MockIngestServer,
    pub service: CollectorService,
    db_path: PathBuf,
    _dir: TempDir,
}

impl TestHarness {
    /// Harness par défaut: compteur sain, serveur qui accepte, collecteur enregistré
    pub async fn new() -> Result<Self> {
        Self::build(HarnessOptions::default()).await
    }

    pub async fn build(options: HarnessOptions) -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        let serial = MockSerialLink::healthy();
        let server = MockIngestServer::start().await?;
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("cache.db");

        let queue = DurableQueue::open(&db_path).await?;
        let client = UploadClient::new(&Self::client_settings(&server), "0.0.0-test")?
            .with_retry_policy(options.retry);
        let device = DeviceReader::from_link(Box::new(serial.clone()), "mock-serial");
        let credentials = options.registered.then(|| Credentials {
            collector_id: COLLECTOR_ID.to_string(),
            token: MOCK_TOKEN.to_string(),
        });

        let config = ServiceConfig {
            collector_id: COLLECTOR_ID.to_string(),
            sample_interval: options.sample_interval,
            upload_interval: options.upload_interval,
            batch_size: options.batch_size,
            auto_upload: options.auto_upload,
        };
        let service = CollectorService::new(config, credentials, device, queue, client, "0.0.0-test")
            .with_timings(options.timings);

        log::info!("🧪 Harness ready (db: {})", db_path.display());
        Ok(Self {
            serial,
            server,
            service,
            db_path,
            _dir: dir,
        })
    }

    pub fn client_settings(server: &MockIngestServer) -> ClientSettings {
        ClientSettings {
            base_url: server.base_url(),
            api_prefix: API_PREFIX.to_string(),
            timeout: Duration::from_secs(2),
        }
    }

    /// Chemin de la base, pour rouvrir la file après `stop`
    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    /// Attend qu'une condition devienne vraie, `false` au timeout
    pub async fn wait_until<F>(&self, timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        log::warn!("⏰ Timeout after {:?}", timeout);
        condition(self)
    }

    /// Comme `wait_until`, pour une condition qui interroge la file
    pub async fn wait_for_queue<F>(&self, timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut(powermon_collector::QueueStats) -> bool,
    {
        let start = tokio::time::Instant::now();
        loop {
            if let Ok(stats) = self.service.queue().stats().await {
                if condition(stats) {
                    return true;
                }
            }
            if start.elapsed() >= timeout {
                log::warn!("⏰ Queue condition not met after {:?}", timeout);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_harness_starts_and_stops() {
        let harness = TestHarness::new().await.unwrap();
        harness.service.start().await.unwrap();
        assert!(harness.service.is_running());

        let sampled = harness
            .wait_until(Duration::from_secs(3), |h| h.server.requests_to("/collector/data").len() >= 2)
            .await;
        assert!(sampled);

        harness.service.stop().await.unwrap();
        assert!(!harness.service.is_running());
        assert!(harness.serial.request_count() >= 2);
    }
}
