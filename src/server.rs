//! HTTP API and websocket event stream over the [`Coordinator`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tower_http::cors::{Any, CorsLayer};

use crate::config::{AppConfig, FilterConfig};
use crate::coordinator::{AppContext, Coordinator, DownloadRequest, SyncRequest};
use crate::error::Error;
use crate::events::Event;
use crate::model::{AssetQuery, LibraryStats};
use crate::store::AssetStore;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const KEEPALIVE_FRAME: &str = r#"{"type":"keepalive"}"#;
const MAX_PAGE: usize = 500;

#[derive(Clone)]
struct AppState {
    coordinator: Coordinator,
}

impl AppState {
    fn ctx(&self) -> &Arc<AppContext> {
        self.coordinator.context()
    }
}

/// Error rendered as `{"error": "..."}` with a matching status code.
#[derive(Debug)]
enum ApiError {
    Core(Error),
    BadRequest(String),
    NotFound,
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Core(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Core(e @ Error::AlreadyRunning(_)) => (StatusCode::CONFLICT, e.to_string()),
            Self::Core(e @ (Error::MissingSession | Error::Config(_))) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            Self::Core(e) => {
                log::error!("API request failed: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
        };
        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Parses an optional JSON body, treating an empty body as the default value.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Runs a store operation off the async workers.
async fn with_store<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&AssetStore) -> crate::Result<T> + Send + 'static,
{
    let store = Arc::clone(state.ctx().store());
    let result = tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(Error::from)?;
    Ok(result?)
}

#[derive(Serialize)]
struct DownloadProgress {
    done: usize,
    total: usize,
    skipped: usize,
    failed: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    ready: bool,
    library_path: String,
    filters: FilterConfig,
    syncing: bool,
    downloading: bool,
    download_progress: DownloadProgress,
    last_sync: Option<i64>,
    last_download: Option<i64>,
    stats: LibraryStats,
    ai_configured: bool,
    session_valid: bool,
    logs: Vec<String>,
}

#[derive(Serialize)]
struct JobStarted {
    started: bool,
    job_id: uuid::Uuid,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct TagsRequest {
    tags: Vec<String>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct ReclassifyRequest {
    ids: Vec<i64>,
}

#[derive(Deserialize)]
#[serde(default)]
struct HighlightParams {
    per_category: usize,
    max_categories: usize,
}

impl Default for HighlightParams {
    fn default() -> Self {
        Self {
            per_category: 8,
            max_categories: 6,
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct LimitParams {
    limit: usize,
}

impl Default for LimitParams {
    fn default() -> Self {
        Self { limit: 100 }
    }
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct FacetParams {
    downloaded: bool,
}

async fn api_status(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let config = state.ctx().config();
    let root = config.paths.library_root.clone();
    let stats = with_store(&state, move |store| {
        store.reconcile(&root)?;
        store.stats(Some(&root))
    })
    .await?;
    let session_valid = match state.ctx().catalog() {
        Ok(catalog) => catalog.session_valid().await,
        Err(_) => false,
    };
    let job = state.coordinator.status();

    Ok(axum::Json(StatusResponse {
        ready: config.ready(),
        library_path: config.paths.library_root.to_string_lossy().into_owned(),
        ai_configured: config.ai.is_configured(),
        filters: config.filters,
        syncing: job.syncing,
        downloading: job.downloading,
        download_progress: DownloadProgress {
            done: job.download_done,
            total: job.download_total,
            skipped: job.download_skipped,
            failed: job.download_failed,
        },
        last_sync: job.last_sync,
        last_download: job.last_download,
        stats,
        session_valid,
        logs: job.logs,
    }))
}

async fn api_sync(State(state): State<AppState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let request: SyncRequest = parse_body(&body)?;
    let job_id = state.coordinator.start_sync(request)?;
    Ok((
        StatusCode::ACCEPTED,
        axum::Json(JobStarted {
            started: true,
            job_id,
        }),
    ))
}

async fn api_download(State(state): State<AppState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let request: DownloadRequest = parse_body(&body)?;
    let job_id = state.coordinator.start_download(request)?;
    Ok((
        StatusCode::ACCEPTED,
        axum::Json(JobStarted {
            started: true,
            job_id,
        }),
    ))
}

async fn api_cancel(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({ "cancelled": state.coordinator.cancel() }))
}

async fn api_assets(
    State(state): State<AppState>,
    Query(mut query): Query<AssetQuery>,
) -> ApiResult<impl IntoResponse> {
    query.limit = query.limit.clamp(1, MAX_PAGE);
    let page = with_store(&state, move |store| store.search(&query)).await?;
    Ok(axum::Json(page))
}

async fn api_asset(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    let root = state.ctx().config().paths.library_root;
    let detail = with_store(&state, move |store| store.asset_detail(id, Some(&root))).await?;
    detail.map(axum::Json).ok_or(ApiError::NotFound)
}

async fn api_asset_tags(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: TagsRequest = parse_body(&body)?;
    let tags = with_store(&state, move |store| {
        if store.get_asset(id)?.is_none() {
            return Ok(None);
        }
        store.set_tags(id, &request.tags).map(Some)
    })
    .await?
    .ok_or(ApiError::NotFound)?;
    Ok(axum::Json(json!({ "id": id, "tags": tags })))
}

async fn api_highlights(
    State(state): State<AppState>,
    Query(params): Query<HighlightParams>,
) -> ApiResult<impl IntoResponse> {
    let root = state.ctx().config().paths.library_root;
    let highlights = with_store(&state, move |store| {
        store.highlights(params.per_category, params.max_categories, Some(&root))
    })
    .await?;
    Ok(axum::Json(highlights))
}

async fn api_bundles(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> ApiResult<impl IntoResponse> {
    let bundles = with_store(&state, move |store| store.bundle_summaries(params.limit)).await?;
    Ok(axum::Json(bundles))
}

async fn api_purchases(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> ApiResult<impl IntoResponse> {
    let purchases = with_store(&state, move |store| store.purchase_summaries(params.limit)).await?;
    Ok(axum::Json(purchases))
}

async fn api_facets(
    State(state): State<AppState>,
    Query(params): Query<FacetParams>,
) -> ApiResult<impl IntoResponse> {
    let facets = with_store(&state, move |store| store.facets(params.downloaded)).await?;
    Ok(axum::Json(facets))
}

async fn api_logs(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({ "logs": state.coordinator.logs() }))
}

async fn api_get_settings(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(axum::Json(state.ctx().settings()?))
}

async fn api_post_settings(State(state): State<AppState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let raw: HashMap<String, Value> = parse_body(&body)?;
    let values: HashMap<String, String> = raw
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key, value)
        })
        .collect();
    state.ctx().update_settings(&values)?;
    state.coordinator.log("Settings updated");
    Ok(axum::Json(state.ctx().settings()?))
}

async fn api_reclassify(State(state): State<AppState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let request: ReclassifyRequest = parse_body(&body)?;
    let report = state.coordinator.reclassify(&request.ids).await?;
    Ok(axum::Json(report))
}

async fn ws_updates(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let events = BroadcastStream::new(state.ctx().events().subscribe().into_inner());
    ws.on_upgrade(move |socket| stream_events(socket, events))
}

/// Forwards bus events to one websocket client until it leaves or shutdown.
async fn stream_events(mut socket: WebSocket, mut events: BroadcastStream<Event>) {
    loop {
        let frame = tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
            next = tokio::time::timeout(KEEPALIVE_INTERVAL, events.next()) => match next {
                Err(_) => None,
                Ok(Some(Ok(event))) => Some(event),
                Ok(Some(Err(BroadcastStreamRecvError::Lagged(n)))) => {
                    log::warn!("Websocket client missed {n} events");
                    continue;
                }
                Ok(None) => Some(Event::Shutdown),
            },
        };

        let closing = matches!(frame, Some(Event::Shutdown));
        let text = match frame {
            Some(event) => serde_json::to_string(&event).unwrap_or_default(),
            None => KEEPALIVE_FRAME.to_string(),
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
        if closing {
            let _ = socket.send(Message::Close(None)).await;
            break;
        }
    }
}

/// Builds the API router.
pub fn router(coordinator: Coordinator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/sync", post(api_sync))
        .route("/api/download", post(api_download))
        .route("/api/cancel", post(api_cancel))
        .route("/api/assets", get(api_assets))
        .route("/api/assets/{id}", get(api_asset))
        .route("/api/assets/{id}/tags", post(api_asset_tags))
        .route("/api/highlights", get(api_highlights))
        .route("/api/bundles", get(api_bundles))
        .route("/api/purchases", get(api_purchases))
        .route("/api/facets", get(api_facets))
        .route("/api/logs", get(api_logs))
        .route("/api/settings", get(api_get_settings).post(api_post_settings))
        .route("/api/reclassify", post(api_reclassify))
        .route("/ws/updates", get(ws_updates))
        .layer(cors)
        .with_state(AppState { coordinator })
}

/// Binds the API server and serves it in the background until the
/// coordinator shuts down. Returns the bound address.
///
/// # Errors
///
/// Returns an error if the address is invalid or cannot be bound.
pub async fn run_server(coordinator: Coordinator, host: &str, port: u16) -> crate::Result<SocketAddr> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address {host}:{port}: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    let shutdown = coordinator.shutdown_token();
    let app = router(coordinator);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            log::error!("API server error: {e}");
        }
    });

    Ok(bound)
}

/// Runs the API server with background enrichment until Ctrl+C.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the server cannot start.
pub async fn run_standalone(config: AppConfig) -> crate::Result<()> {
    let (host, port) = (config.api.host.clone(), config.api.port);
    let ctx = Arc::new(AppContext::open(config)?);
    let coordinator = Coordinator::new(ctx);
    coordinator.start_background();

    let addr = run_server(coordinator.clone(), &host, port).await?;
    log::info!("Serving API on http://{addr}");

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    coordinator.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogApi, Order, RemoteFile, TroveProduct};
    use crate::classify::Classifier;
    use crate::model::Asset;
    use async_trait::async_trait;

    /// Catalog whose account enumeration never finishes.
    struct StalledCatalog;

    #[async_trait]
    impl CatalogApi for StalledCatalog {
        async fn purchase_keys(&self) -> crate::Result<Vec<String>> {
            std::future::pending().await
        }

        async fn order(&self, _key: &str) -> crate::Result<Order> {
            std::future::pending().await
        }

        async fn trove_page(&self, _index: usize) -> crate::Result<Vec<TroveProduct>> {
            Ok(Vec::new())
        }

        async fn sign_trove_url(&self, _machine_name: &str, _file_name: &str) -> crate::Result<String> {
            Err(Error::TroveAccessDenied)
        }

        async fn open_download(&self, _url: &str) -> crate::Result<RemoteFile> {
            Err(Error::Status {
                url: "stalled".into(),
                status: 503,
            })
        }

        async fn session_valid(&self) -> bool {
            true
        }
    }

    struct Harness {
        base: String,
        coordinator: Coordinator,
        http: reqwest::Client,
        _dir: tempfile::TempDir,
    }

    async fn serve(catalog: Option<Arc<dyn CatalogApi>>) -> Harness {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.paths.library_root = dir.path().join("library");
        config.paths.data_dir = dir.path().join("data");
        if catalog.is_some() {
            config.session = "cookie".into();
        }
        let store = Arc::new(AssetStore::open_in_memory().unwrap());
        let ctx = Arc::new(AppContext::new(config, store, catalog, Classifier::new()));
        let coordinator = Coordinator::new(ctx);
        let addr = run_server(coordinator.clone(), "127.0.0.1", 0).await.unwrap();
        Harness {
            base: format!("http://{addr}"),
            coordinator,
            http: reqwest::Client::new(),
            _dir: dir,
        }
    }

    impl Harness {
        async fn get(&self, path: &str) -> (u16, Value) {
            let response = self.http.get(format!("{}{path}", self.base)).send().await.unwrap();
            let status = response.status().as_u16();
            (status, response.json().await.unwrap())
        }

        async fn post(&self, path: &str, body: Value) -> (u16, Value) {
            let response = self
                .http
                .post(format!("{}{path}", self.base))
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = response.status().as_u16();
            (status, response.json().await.unwrap())
        }

        fn seed(&self) -> i64 {
            let asset = Asset {
                order_id: "K1".into(),
                bundle_title: "Pixel Bundle".into(),
                product_title: "Forest Tiles".into(),
                file_name: "forest.zip".into(),
                url: "https://dl.example/forest.zip".into(),
                ext: "zip".into(),
                category: Some("tileset".into()),
                ..Asset::default()
            };
            self.coordinator.context().store().upsert(&[asset]).unwrap()[0]
        }
    }

    #[tokio::test]
    async fn status_reports_unconfigured_library() {
        let h = serve(None).await;
        let (code, body) = h.get("/api/status").await;
        assert_eq!(code, 200);
        assert_eq!(body["ready"], false);
        assert_eq!(body["session_valid"], false);
        assert_eq!(body["syncing"], false);
        assert_eq!(body["stats"]["total"], 0);
        assert_eq!(body["download_progress"]["total"], 0);
    }

    #[tokio::test]
    async fn sync_without_session_is_a_bad_request() {
        let h = serve(None).await;
        let (code, body) = h.post("/api/sync", json!({})).await;
        assert_eq!(code, 400);
        assert!(body["error"].as_str().unwrap().contains("session"));
    }

    #[tokio::test]
    async fn concurrent_sync_conflicts() {
        let h = serve(Some(Arc::new(StalledCatalog))).await;
        let (first, body) = h.post("/api/sync", json!({"force_meta": false})).await;
        assert_eq!(first, 202);
        assert_eq!(body["started"], true);
        let (second, body) = h.post("/api/sync", json!({})).await;
        assert_eq!(second, 409);
        assert_eq!(body["error"], "sync already in progress");

        let (_, cancelled) = h.post("/api/cancel", json!({})).await;
        assert_eq!(cancelled["cancelled"], 1);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let h = serve(Some(Arc::new(StalledCatalog))).await;
        let (code, _) = h.post("/api/download", json!({"workers": "many"})).await;
        assert_eq!(code, 400);
        assert!(!h.coordinator.status().downloading);
    }

    #[tokio::test]
    async fn assets_search_detail_and_tags() {
        let h = serve(None).await;
        let id = h.seed();

        let (code, page) = h.get("/api/assets?query=forest&sort=alpha").await;
        assert_eq!(code, 200);
        assert_eq!(page["total"], 1);
        assert_eq!(page["items"][0]["file_name"], "forest.zip");

        let (code, detail) = h.get(&format!("/api/assets/{id}")).await;
        assert_eq!(code, 200);
        assert_eq!(detail["exists"], false);
        assert_eq!(detail["product_title"], "Forest Tiles");

        let (code, tagged) = h
            .post(&format!("/api/assets/{id}/tags"), json!({"tags": ["Pixel", "pixel", "rpg"]}))
            .await;
        assert_eq!(code, 200);
        assert_eq!(tagged["tags"], json!(["pixel", "rpg", "tileset"]));

        let (code, _) = h.get("/api/assets/9999").await;
        assert_eq!(code, 404);
        let (code, _) = h.post("/api/assets/9999/tags", json!({"tags": []})).await;
        assert_eq!(code, 404);
    }

    #[tokio::test]
    async fn aggregates_are_served() {
        let h = serve(None).await;
        h.seed();
        let (code, bundles) = h.get("/api/bundles?limit=5").await;
        assert_eq!(code, 200);
        assert_eq!(bundles[0]["bundle_title"], "Pixel Bundle");
        let (_, facets) = h.get("/api/facets").await;
        assert_eq!(facets["extensions"], json!(["zip"]));
        let (code, _) = h.get("/api/highlights").await;
        assert_eq!(code, 200);
        let (code, _) = h.get("/api/purchases").await;
        assert_eq!(code, 200);
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let h = serve(None).await;
        let (code, settings) = h
            .post(
                "/api/settings",
                json!({"include": ["pdf", "epub"], "trove": true, "openwebui_url": ""}),
            )
            .await;
        assert_eq!(code, 200);
        assert_eq!(settings["include"], r#"["pdf","epub"]"#);
        assert_eq!(settings["trove"], "true");

        let config = h.coordinator.context().config();
        assert_eq!(config.filters.include, vec!["pdf", "epub"]);
        assert!(config.filters.trove);

        let (_, logs) = h.get("/api/logs").await;
        assert_eq!(logs["logs"], json!(["Settings updated"]));
    }

    #[tokio::test]
    async fn reclassify_reports_counts() {
        let h = serve(None).await;
        let id = h.seed();
        let (code, report) = h.post("/api/reclassify", json!({"ids": [id]})).await;
        assert_eq!(code, 200);
        assert_eq!(report["total"], 1);
        assert_eq!(report["updated"].as_u64().unwrap() + report["skipped"].as_u64().unwrap(), 1);
    }

    #[test]
    fn empty_body_uses_defaults() {
        let request: SyncRequest = parse_body(&Bytes::from_static(b"  ")).unwrap();
        assert_eq!(request, SyncRequest::default());
        let request: DownloadRequest = parse_body(&Bytes::from_static(br#"{"workers": 2}"#)).unwrap();
        assert_eq!(request.workers, Some(2));
    }

    #[test]
    fn keepalive_frame_is_tagged() {
        let frame: Value = serde_json::from_str(KEEPALIVE_FRAME).unwrap();
        assert_eq!(frame["type"], "keepalive");
    }
}
