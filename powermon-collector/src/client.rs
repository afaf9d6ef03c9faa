//! Ingestion API client
//!
//! Handles:
//! - One-shot registration (registration code → bearer token)
//! - Single and batch reading uploads
//! - Heartbeats and remote config fetch
//! - Connectivity probing
//!
//! Every call goes through [`RetryPolicy`]: 5xx and connection-level
//! failures are retried, 4xx and `success: false` envelopes are not.

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::Reading;
use crate::queue::QueueEntry;
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownSignal;

const REGISTER_PATH: &str = "/auth/collector/register";
const DATA_PATH: &str = "/collector/data";
const BATCH_PATH: &str = "/collector/data/batch";
const HEARTBEAT_PATH: &str = "/collector/heartbeat";
const CONFIG_PATH: &str = "/collector/config";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("request refused with status {status}: {message}")]
    Client { status: u16, message: String },
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("collector is not registered (no token)")]
    MissingCredentials,
}

impl ApiError {
    /// Only connection-level failures and 5xx are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::Server { .. })
    }
}

/// Where the ingestion API lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub base_url: String,
    pub api_prefix: String,
    pub timeout: Duration,
}

/// Identity issued at registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub collector_id: String,
    pub token: String,
}

impl Credentials {
    /// Both halves present
    pub fn is_complete(&self) -> bool {
        !self.collector_id.is_empty() && !self.token.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRequest {
    pub registration_code: String,
    pub collector_id: String,
    pub name: String,
    pub description: String,
    pub location: String,
    pub version: String,
}

/// Settings the server may push back at registration. Zero means "keep local".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerOverrides {
    pub collector_id: String,
    /// Seconds
    pub sample_interval: u64,
    /// Seconds
    pub upload_interval: u64,
    pub max_cache_size: i64,
    pub auto_upload: bool,
    pub compression_level: i32,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub credentials: Credentials,
    pub token_expires: Option<String>,
    pub overrides: Option<ServerOverrides>,
}

/// One reading as the API expects it. The alarm flag is not uploaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy: f64,
    pub frequency: f64,
    pub power_factor: f64,
}

impl From<&Reading> for DataPoint {
    fn from(r: &Reading) -> Self {
        Self {
            timestamp: r.timestamp,
            voltage: r.voltage,
            current: r.current,
            power: r.power,
            energy: r.energy,
            frequency: r.frequency,
            power_factor: r.power_factor,
        }
    }
}

impl From<&QueueEntry> for DataPoint {
    fn from(e: &QueueEntry) -> Self {
        Self {
            timestamp: e.timestamp,
            voltage: e.voltage,
            current: e.current,
            power: e.power,
            energy: e.energy,
            frequency: e.frequency,
            power_factor: e.power_factor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Ok,
    Error,
}

impl HeartbeatStatus {
    pub fn from_health(healthy: bool) -> Self {
        if healthy {
            HeartbeatStatus::Ok
        } else {
            HeartbeatStatus::Error
        }
    }
}

#[derive(Serialize)]
struct BatchBody<'a> {
    collector_id: &'a str,
    data: &'a [DataPoint],
}

#[derive(Serialize)]
struct HeartbeatBody<'a> {
    status: HeartbeatStatus,
    version: &'a str,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RegisterData {
    token: String,
    #[serde(default)]
    token_expires: Option<String>,
    #[serde(default)]
    config: Option<ServerOverrides>,
}

#[derive(Debug, Clone)]
pub struct UploadClient {
    http: reqwest::Client,
    endpoint: String,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
    interrupt: Option<ShutdownSignal>,
}

impl UploadClient {
    pub fn new(settings: &ClientSettings, version: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(format!("PowerCollector/{}", version))
            .build()?;

        Ok(Self {
            http,
            endpoint: join_endpoint(&settings.base_url, &settings.api_prefix),
            credentials: None,
            retry: RetryPolicy::network(),
            interrupt: None,
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Retry backoffs end early once `signal` fires
    pub fn bind_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.interrupt = Some(signal);
        self
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Exchange a registration code for a token. Stores the new credentials on success.
    pub async fn register(&mut self, request: &RegistrationRequest) -> Result<Registration, ApiError> {
        let envelope = self.call(Method::POST, REGISTER_PATH, Some(request), false).await?;
        let data = envelope
            .data
            .ok_or_else(|| ApiError::Malformed("registration response carries no data".into()))?;
        let data: RegisterData =
            serde_json::from_value(data).map_err(|e| ApiError::Malformed(e.to_string()))?;

        let collector_id = match &data.config {
            Some(cfg) if !cfg.collector_id.is_empty() => cfg.collector_id.clone(),
            _ => request.collector_id.clone(),
        };
        let credentials = Credentials {
            collector_id,
            token: data.token,
        };
        self.credentials = Some(credentials.clone());

        Ok(Registration {
            credentials,
            token_expires: data.token_expires,
            overrides: data.config,
        })
    }

    pub async fn upload_one(&self, reading: &Reading) -> Result<(), ApiError> {
        let point = DataPoint::from(reading);
        self.call(Method::POST, DATA_PATH, Some(&point), true).await?;
        Ok(())
    }

    /// Ordered batch upload; an empty batch sends nothing
    pub async fn upload_batch(&self, points: &[DataPoint]) -> Result<(), ApiError> {
        if points.is_empty() {
            return Ok(());
        }
        let creds = self.credentials.as_ref().ok_or(ApiError::MissingCredentials)?;
        let body = BatchBody {
            collector_id: &creds.collector_id,
            data: points,
        };
        self.call(Method::POST, BATCH_PATH, Some(&body), true).await?;
        Ok(())
    }

    pub async fn heartbeat(&self, status: HeartbeatStatus, version: &str) -> Result<(), ApiError> {
        let body = HeartbeatBody { status, version };
        self.call(Method::POST, HEARTBEAT_PATH, Some(&body), true).await?;
        Ok(())
    }

    /// Server-side collector config, as the raw `data` object
    pub async fn fetch_config(&self) -> Result<serde_json::Value, ApiError> {
        let envelope = self.call::<()>(Method::GET, CONFIG_PATH, None, true).await?;
        match envelope.data {
            Some(data @ serde_json::Value::Object(_)) => Ok(data),
            _ => Err(ApiError::Malformed("config response is not an object".into())),
        }
    }

    /// Connectivity check under the retry policy. Any status below 400 counts.
    pub async fn probe(&self) -> Result<(), ApiError> {
        self.retry
            .run(|_| self.probe_once(), ApiError::is_retryable, self.interrupt.as_ref())
            .await
    }

    /// Single probe, no retry
    pub async fn is_reachable(&self) -> bool {
        self.probe_once().await.is_ok()
    }

    async fn probe_once(&self) -> Result<(), ApiError> {
        let mut request = self.http.get(self.url(CONFIG_PATH));
        if let Some(creds) = &self.credentials {
            request = request.bearer_auth(&creds.token);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() < 400 {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, message_from_body(&body)))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        authenticated: bool,
    ) -> Result<Envelope, ApiError> {
        self.retry
            .run(
                |attempt| {
                    let method = method.clone();
                    async move {
                        self.send_once(method, path, body, authenticated)
                            .await
                            .inspect_err(|e| {
                                warn!(
                                    "{} failed (attempt {}/{}): {}",
                                    path, attempt, self.retry.max_attempts, e
                                )
                            })
                    }
                },
                ApiError::is_retryable,
                self.interrupt.as_ref(),
            )
            .await
    }

    async fn send_once<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        authenticated: bool,
    ) -> Result<Envelope, ApiError> {
        let mut request = self.http.request(method, self.url(path));
        if authenticated {
            let creds = self.credentials.as_ref().ok_or(ApiError::MissingCredentials)?;
            request = request.bearer_auth(&creds.token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!("{} -> {}", path, status);

        if !status.is_success() {
            return Err(status_error(status, message_from_body(&text)));
        }
        if text.trim().is_empty() {
            return Ok(Envelope {
                success: true,
                message: String::new(),
                data: None,
            });
        }

        let envelope: Envelope =
            serde_json::from_str(&text).map_err(|e| ApiError::Malformed(e.to_string()))?;
        if !envelope.success {
            return Err(ApiError::Rejected(envelope.message));
        }
        Ok(envelope)
    }
}

fn status_error(status: StatusCode, message: String) -> ApiError {
    if status.is_server_error() {
        ApiError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        ApiError::Client {
            status: status.as_u16(),
            message,
        }
    }
}

/// Envelope message when there is one, raw body otherwise
fn message_from_body(body: &str) -> String {
    serde_json::from_str::<Envelope>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

fn join_endpoint(base_url: &str, api_prefix: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let prefix = api_prefix.trim_matches('/');
    if prefix.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn settings() -> ClientSettings {
        ClientSettings {
            base_url: "http://ingest.local:8080/".into(),
            api_prefix: "/api/v1/".into(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_endpoint_joining() {
        assert_eq!(join_endpoint("http://h/", "/api/v1/"), "http://h/api/v1");
        assert_eq!(join_endpoint("http://h", "api"), "http://h/api");
        assert_eq!(join_endpoint("http://h//", ""), "http://h");

        let client = UploadClient::new(&settings(), "1.0.0").unwrap();
        assert_eq!(client.url(BATCH_PATH), "http://ingest.local:8080/api/v1/collector/data/batch");
    }

    #[test]
    fn test_retryable_classification() {
        let server = ApiError::Server { status: 503, message: "busy".into() };
        let client = ApiError::Client { status: 401, message: "bad token".into() };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(!ApiError::Rejected("nope".into()).is_retryable());
        assert!(!ApiError::MissingCredentials.is_retryable());

        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, String::new()),
            ApiError::Server { status: 502, .. }
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, String::new()),
            ApiError::Client { status: 404, .. }
        ));
    }

    #[test]
    fn test_message_extraction() {
        assert_eq!(message_from_body(r#"{"success":false,"message":"expired"}"#), "expired");
        assert_eq!(message_from_body("  gateway timeout \n"), "gateway timeout");
    }

    #[test]
    fn test_data_point_wire_shape() {
        let reading = Reading {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            voltage: 230.1,
            current: 0.5,
            power: 115.0,
            energy: 42.0,
            frequency: 50.0,
            power_factor: 1.0,
            alarm: true,
        };
        let json = serde_json::to_value(DataPoint::from(&reading)).unwrap();
        assert_eq!(json["timestamp"], "2024-03-01T12:00:00Z");
        assert_eq!(json["power_factor"], 1.0);
        assert!(json.get("alarm").is_none());
        assert_eq!(json.as_object().unwrap().len(), 7);
    }

    #[test]
    fn test_heartbeat_body() {
        let body = HeartbeatBody {
            status: HeartbeatStatus::from_health(false),
            version: "1.0.0",
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"status": "error", "version": "1.0.0"})
        );
    }

    #[test]
    fn test_register_data_parsing() {
        let data: RegisterData = serde_json::from_value(serde_json::json!({
            "token": "tok",
            "token_expires": "2030-01-01T00:00:00Z",
            "config": {"collector_id": "srv-id", "sample_interval": 10, "auto_upload": true}
        }))
        .unwrap();
        let cfg = data.config.unwrap();
        assert_eq!(cfg.collector_id, "srv-id");
        assert_eq!(cfg.sample_interval, 10);
        assert_eq!(cfg.upload_interval, 0);
        assert!(cfg.auto_upload);
    }

    #[tokio::test]
    async fn test_calls_without_token_fail_fast() {
        let client = UploadClient::new(&settings(), "1.0.0").unwrap();
        let point = DataPoint {
            timestamp: Utc::now(),
            voltage: 230.0,
            current: 1.0,
            power: 230.0,
            energy: 1.0,
            frequency: 50.0,
            power_factor: 1.0,
        };
        assert!(matches!(client.upload_batch(&[point]).await, Err(ApiError::MissingCredentials)));
        assert!(client.upload_batch(&[]).await.is_ok());
        assert!(matches!(
            client.heartbeat(HeartbeatStatus::Ok, "1.0.0").await,
            Err(ApiError::MissingCredentials)
        ));
    }
}
