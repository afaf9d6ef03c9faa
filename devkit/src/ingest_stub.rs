/*!
Faux serveur d'ingestion pour tests sans backend

Serveur axum sur 127.0.0.1 (port éphémère) qui imite l'API du collecteur:
- enregistre chaque requête (méthode, chemin, bearer, corps JSON)
- mode de réponse commutable à chaud: accepte, 5xx, 4xx, `success: false`
- exige un bearer sur toutes les routes sauf l'enregistrement
*/

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const API_PREFIX: &str = "/api/v1";
pub const MOCK_TOKEN: &str = "mock-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    Accept,
    /// 503 on every call
    ServerError,
    /// 400 on every call
    ClientError,
    /// 200 with `success: false`
    Reject,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Value,
}

#[derive(Debug)]
struct IngestState {
    mode: Mutex<IngestMode>,
    requests: Mutex<Vec<RecordedRequest>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct MockIngestServer {
    addr: SocketAddr,
    state: Arc<IngestState>,
    task: JoinHandle<()>,
}

impl MockIngestServer {
    pub async fn start() -> anyhow::Result<Self> {
        let state = Arc::new(IngestState {
            mode: Mutex::new(IngestMode::Accept),
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route(&format!("{}/auth/collector/register", API_PREFIX), post(register))
            .route(&format!("{}/collector/data", API_PREFIX), post(ingest))
            .route(&format!("{}/collector/data/batch", API_PREFIX), post(ingest))
            .route(&format!("{}/collector/heartbeat", API_PREFIX), post(ingest))
            .route(&format!("{}/collector/config", API_PREFIX), get(collector_config))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("❌ [MOCK] ingest server stopped: {}", e);
            }
        });
        log::info!("🌐 [MOCK] ingest server listening on {}", addr);

        Ok(Self { addr, state, task })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_mode(&self, mode: IngestMode) {
        *lock(&self.state.mode) = mode;
        log::info!("🔧 [MOCK] ingest mode -> {:?}", mode);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state.requests).clone()
    }

    /// Requêtes reçues sur un chemin relatif au préfixe (ex. `/collector/data`)
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        let full = format!("{}{}", API_PREFIX, path);
        lock(&self.state.requests)
            .iter()
            .filter(|r| r.path == full)
            .cloned()
            .collect()
    }

    /// Nombre total de lectures reçues, unitaires et par lot
    pub fn uploaded_readings(&self) -> usize {
        let single = self.requests_to("/collector/data").len();
        let batched: usize = self
            .requests_to("/collector/data/batch")
            .iter()
            .filter_map(|r| r.body["data"].as_array().map(Vec::len))
            .sum();
        single + batched
    }

    pub fn clear(&self) {
        lock(&self.state.requests).clear();
    }
}

impl Drop for MockIngestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type Reply = (StatusCode, Json<Value>);

fn record(state: &IngestState, method: Method, uri: &Uri, headers: &HeaderMap, body: &Bytes) {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let body = serde_json::from_slice(body).unwrap_or(Value::Null);
    lock(&state.requests).push(RecordedRequest {
        method,
        path: uri.path().to_string(),
        bearer,
        body,
    });
}

/// Réponse imposée par le mode courant, `None` si la requête passe
fn forced_reply(state: &IngestState) -> Option<Reply> {
    match *lock(&state.mode) {
        IngestMode::Accept => None,
        IngestMode::ServerError => Some((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"success": false, "message": "service unavailable"})),
        )),
        IngestMode::ClientError => Some((
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "message": "bad request"})),
        )),
        IngestMode::Reject => Some((
            StatusCode::OK,
            Json(json!({"success": false, "message": "rejected"})),
        )),
    }
}

fn unauthorized(headers: &HeaderMap) -> Option<Reply> {
    let expected = format!("Bearer {}", MOCK_TOKEN);
    match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => None,
        _ => Some((
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "message": "invalid token"})),
        )),
    }
}

async fn register(
    State(state): State<Arc<IngestState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    record(&state, method, &uri, &headers, &body);
    if let Some(reply) = forced_reply(&state) {
        return reply;
    }

    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let collector_id = request["collector_id"].as_str().unwrap_or_default().to_string();
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "registered",
            "data": {
                "token": MOCK_TOKEN,
                "token_expires": (chrono::Utc::now() + chrono::Duration::days(365)).to_rfc3339(),
                "config": {
                    "collector_id": collector_id,
                    "sample_interval": 15,
                    "upload_interval": 120,
                    "max_cache_size": 5000,
                    "auto_upload": true,
                    "compression_level": 0
                }
            }
        })),
    )
}

async fn ingest(
    State(state): State<Arc<IngestState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    record(&state, method, &uri, &headers, &body);
    if let Some(reply) = unauthorized(&headers).or_else(|| forced_reply(&state)) {
        return reply;
    }
    (StatusCode::OK, Json(json!({"success": true, "message": "ok"})))
}

async fn collector_config(
    State(state): State<Arc<IngestState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Reply {
    record(&state, method, &uri, &headers, &Bytes::new());
    if let Some(reply) = unauthorized(&headers).or_else(|| forced_reply(&state)) {
        return reply;
    }
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "ok",
            "data": {"sample_interval": 30, "upload_interval": 60, "auto_upload": true}
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use powermon_collector::client::{ClientSettings, RegistrationRequest};
    use powermon_collector::{ApiError, UploadClient};
    use std::time::Duration;

    fn client(server: &MockIngestServer) -> UploadClient {
        let settings = ClientSettings {
            base_url: server.base_url(),
            api_prefix: API_PREFIX.into(),
            timeout: Duration::from_secs(2),
        };
        UploadClient::new(&settings, "0.0.0-test")
            .unwrap()
            .with_retry_policy(powermon_collector::retry::RetryPolicy::fixed(2, Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn test_register_then_authenticated_calls() {
        let server = MockIngestServer::start().await.unwrap();
        let mut api = client(&server);

        let registration = api
            .register(&RegistrationRequest {
                registration_code: "REG".into(),
                collector_id: "c-7".into(),
                name: "bench".into(),
                description: String::new(),
                location: String::new(),
                version: "0.0.0-test".into(),
            })
            .await
            .unwrap();
        assert_eq!(registration.credentials.token, MOCK_TOKEN);
        assert_eq!(registration.credentials.collector_id, "c-7");
        assert_eq!(registration.overrides.unwrap().upload_interval, 120);

        let config = api.fetch_config().await.unwrap();
        assert_eq!(config["sample_interval"], 30);
        assert!(api.is_reachable().await);

        let config_calls = server.requests_to("/collector/config");
        assert_eq!(config_calls[0].bearer.as_deref(), Some(MOCK_TOKEN));
    }

    #[tokio::test]
    async fn test_failure_modes_map_to_errors() {
        let server = MockIngestServer::start().await.unwrap();
        let mut api = client(&server);
        api = api.with_credentials(powermon_collector::Credentials {
            collector_id: "c-1".into(),
            token: MOCK_TOKEN.into(),
        });
        let hb = powermon_collector::client::HeartbeatStatus::Ok;

        server.set_mode(IngestMode::ServerError);
        assert!(matches!(api.heartbeat(hb, "v").await, Err(ApiError::Server { status: 503, .. })));
        // retried once
        assert_eq!(server.requests_to("/collector/heartbeat").len(), 2);

        server.clear();
        server.set_mode(IngestMode::ClientError);
        assert!(matches!(api.heartbeat(hb, "v").await, Err(ApiError::Client { status: 400, .. })));
        assert_eq!(server.requests_to("/collector/heartbeat").len(), 1);

        server.set_mode(IngestMode::Reject);
        assert!(matches!(api.heartbeat(hb, "v").await, Err(ApiError::Rejected(m)) if m == "rejected"));

        server.set_mode(IngestMode::Accept);
        api.heartbeat(hb, "v").await.unwrap();
        let last = server.requests().pop().unwrap();
        assert_eq!(last.body, json!({"status": "ok", "version": "v"}));
    }

    #[tokio::test]
    async fn test_wrong_token_is_client_error() {
        let server = MockIngestServer::start().await.unwrap();
        let api = client(&server).with_credentials(powermon_collector::Credentials {
            collector_id: "c-1".into(),
            token: "stale".into(),
        });
        assert!(matches!(api.probe().await, Err(ApiError::Client { status: 401, .. })));
        assert!(!api.is_reachable().await);
    }
}
