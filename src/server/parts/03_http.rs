use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path as UrlPath, Request, State};
use axum::http::{header, request::Parts, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{async_trait, extract::FromRequestParts, Json, Router};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub max_body_bytes: usize,
    pub keepalive_interval: Duration,
    pub stream_ttl: Duration,
    pub retry_hint: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".parse().expect("static addr"),
            db_path: PathBuf::from("crosstalk-server.db"),
            max_body_bytes: 1024 * 1024,
            keepalive_interval: Duration::from_secs(25),
            // The stream is force-closed so outer authorization gates
            // re-apply on reconnect.
            stream_ttl: Duration::from_secs(60),
            retry_hint: Duration::from_millis(3_000),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid_request: {0}")]
    InvalidRequest(&'static str),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not_found")]
    NotFound,
    #[error("payload_too_large")]
    PayloadTooLarge,
    #[error("server_error")]
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Storage(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, token) = match &self {
            ApiError::InvalidRequest(detail) => {
                tracing::debug!("rejected sync request: {detail}");
                (StatusCode::BAD_REQUEST, "invalid_request")
            }
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            ApiError::Storage(e) => {
                // Internal causes never reach the client.
                tracing::error!("sync api storage failure: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
        };
        (status, Json(ErrorBody { error: token })).into_response()
    }
}

/// The authenticated caller. Outer middleware (session cookies, bearer
/// tokens) is someone else's job; it hands the engine a user id either as a
/// request extension or, for in-process deployments, the `x-sync-user`
/// header.
#[derive(Clone, Debug)]
pub struct AuthedUser(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<AuthedUser>() {
            return Ok(user.clone());
        }
        let Some(value) = parts.headers.get("x-sync-user") else {
            return Err(ApiError::Unauthorized);
        };
        let user = value
            .to_str()
            .map_err(|_| ApiError::Unauthorized)?
            .trim()
            .to_string();
        if user.is_empty() || user.len() > MAX_USER_ID_LEN {
            return Err(ApiError::Unauthorized);
        }
        Ok(AuthedUser(user))
    }
}

/// Request-level sync contract: validation, the write path, and change
/// publication. The HTTP handlers and the in-process transport both go
/// through here so their semantics cannot drift apart.
pub struct SyncCore {
    store: Arc<Store>,
    notifier: Arc<Notifier>,
}

impl SyncCore {
    pub fn new(store: Arc<Store>, notifier: Arc<Notifier>) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn list(&self, user_id: &str) -> Result<Vec<ConversationMetaRecord>, ApiError> {
        Ok(self.store.list(user_id)?)
    }

    pub fn get(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>, ApiError> {
        if !valid_conversation_id(conversation_id) {
            return Err(ApiError::InvalidRequest("invalid conversation id"));
        }
        Ok(self.store.get(user_id, conversation_id)?)
    }

    pub fn upsert(
        &self,
        user_id: &str,
        conversation_id: &str,
        base_revision: Option<u64>,
        data: &Value,
    ) -> Result<WriteOutcome, ApiError> {
        if !valid_conversation_id(conversation_id) {
            return Err(ApiError::InvalidRequest("invalid conversation id"));
        }
        if !data.is_object() {
            return Err(ApiError::InvalidRequest("data must be a JSON object"));
        }
        if let Some(embedded) = data.get("id") {
            if embedded.as_str() != Some(conversation_id) {
                return Err(ApiError::InvalidRequest(
                    "data.id does not match the conversation id",
                ));
            }
        }

        let outcome = self
            .store
            .upsert(user_id, conversation_id, base_revision, data)?;
        if let WriteOutcome::Ok {
            revision,
            updated_at_ms,
        } = outcome
        {
            self.notifier.publish(
                user_id,
                &ChangeEvent {
                    conversation_id: conversation_id.to_string(),
                    revision,
                    deleted: false,
                    updated_at: updated_at_ms,
                },
            );
        }
        Ok(outcome)
    }

    pub fn tombstone(
        &self,
        user_id: &str,
        conversation_id: &str,
        base_revision: Option<u64>,
    ) -> Result<WriteOutcome, ApiError> {
        if !valid_conversation_id(conversation_id) {
            return Err(ApiError::InvalidRequest("invalid conversation id"));
        }

        let outcome = self
            .store
            .tombstone(user_id, conversation_id, base_revision)?;
        if let WriteOutcome::Ok {
            revision,
            updated_at_ms,
        } = outcome
        {
            self.notifier.publish(
                user_id,
                &ChangeEvent {
                    conversation_id: conversation_id.to_string(),
                    revision,
                    deleted: true,
                    updated_at: updated_at_ms,
                },
            );
        }
        Ok(outcome)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<SyncCore>,
    pub cfg: Arc<ServerConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaItem {
    conversation_id: String,
    revision: u64,
    deleted: bool,
    updated_at: i64,
}

#[derive(Serialize)]
struct ListResponse {
    items: Vec<MetaItem>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GetResponse {
    conversation_id: String,
    revision: u64,
    deleted: bool,
    data: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteResponse {
    conversation_id: String,
    revision: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConflictBody {
    error: &'static str,
    conversation_id: String,
    revision: u64,
    deleted: bool,
}

fn parse_base_revision(value: Option<&Value>) -> Result<Option<u64>, ApiError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or(ApiError::InvalidRequest("baseRevision must be a non-negative integer")),
        Some(_) => Err(ApiError::InvalidRequest(
            "baseRevision must be a non-negative integer or null",
        )),
    }
}

fn write_outcome_response(conversation_id: &str, outcome: WriteOutcome) -> Response {
    match outcome {
        WriteOutcome::Ok { revision, .. } => Json(WriteResponse {
            conversation_id: conversation_id.to_string(),
            revision,
        })
        .into_response(),
        WriteOutcome::Conflict { revision, deleted } => (
            StatusCode::CONFLICT,
            Json(ConflictBody {
                error: "conflict",
                conversation_id: conversation_id.to_string(),
                revision,
                deleted,
            }),
        )
            .into_response(),
        WriteOutcome::NotFound => ApiError::NotFound.into_response(),
    }
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
) -> Result<Response, ApiError> {
    let items = state
        .core
        .list(&user)?
        .into_iter()
        .map(|row| MetaItem {
            conversation_id: row.conversation_id,
            revision: row.revision,
            deleted: row.deleted,
            updated_at: row.updated_at_ms,
        })
        .collect();
    Ok(Json(ListResponse { items }).into_response())
}

async fn get_conversation(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    UrlPath(conversation_id): UrlPath<String>,
) -> Result<Response, ApiError> {
    let record = state
        .core
        .get(&user, &conversation_id)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(GetResponse {
        conversation_id: record.conversation_id,
        revision: record.revision,
        deleted: record.deleted,
        data: record.data.unwrap_or(Value::Null),
    })
    .into_response())
}

async fn upsert_conversation(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    UrlPath(conversation_id): UrlPath<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    if body.len() > state.cfg.max_body_bytes {
        return Err(ApiError::PayloadTooLarge);
    }
    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::InvalidRequest("body is not valid JSON"))?;
    let obj = parsed
        .as_object()
        .ok_or(ApiError::InvalidRequest("body must be a JSON object"))?;
    let base_revision = parse_base_revision(obj.get("baseRevision"))?;
    let data = obj
        .get("data")
        .ok_or(ApiError::InvalidRequest("missing data"))?;

    let outcome = state
        .core
        .upsert(&user, &conversation_id, base_revision, data)?;
    Ok(write_outcome_response(&conversation_id, outcome))
}

async fn delete_conversation(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    UrlPath(conversation_id): UrlPath<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    if body.len() > state.cfg.max_body_bytes {
        return Err(ApiError::PayloadTooLarge);
    }
    // An absent body means "I believe the row does not exist yet".
    let base_revision = if body.is_empty() {
        None
    } else {
        let parsed: Value = serde_json::from_slice(&body)
            .map_err(|_| ApiError::InvalidRequest("body is not valid JSON"))?;
        let obj = parsed
            .as_object()
            .ok_or(ApiError::InvalidRequest("body must be a JSON object"))?;
        parse_base_revision(obj.get("baseRevision"))?
    };

    let outcome = state
        .core
        .tombstone(&user, &conversation_id, base_revision)?;
    Ok(write_outcome_response(&conversation_id, outcome))
}

async fn events(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
) -> Response {
    let mut subscription = state.core.notifier().subscribe(&user);
    let cfg = Arc::clone(&state.cfg);
    let (tx, rx) = tokio::sync::mpsc::channel::<Event>(32);

    tokio::spawn(async move {
        if tx.send(Event::default().retry(cfg.retry_hint)).await.is_err() {
            return;
        }
        if tx.send(Event::default().event("ready").data("{}")).await.is_err() {
            return;
        }

        let ttl = tokio::time::sleep(cfg.stream_ttl);
        tokio::pin!(ttl);
        let mut ping = tokio::time::interval(cfg.keepalive_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = &mut ttl => {
                    let _ = tx.send(Event::default().event("close").data("{}")).await;
                    break;
                }
                _ = ping.tick() => {
                    if tx.send(Event::default().event("ping").data("{}")).await.is_err() {
                        break;
                    }
                }
                received = subscription.recv() => {
                    let Some(event) = received else { break };
                    let payload = match serde_json::to_string(&event) {
                        Ok(payload) => payload,
                        Err(_) => continue,
                    };
                    let sse_event = Event::default()
                        .event("conversation_changed")
                        .data(payload);
                    if tx.send(sse_event).await.is_err() {
                        // Client went away; dropping the subscription
                        // unregisters it from the notifier.
                        break;
                    }
                }
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-transform"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

async fn no_store_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
    response
}

pub fn create_router(state: AppState) -> Router {
    let body_limit = state.cfg.max_body_bytes + 1024;
    Router::new()
        .route("/sync/conversations", get(list_conversations))
        .route(
            "/sync/conversations/:id",
            get(get_conversation)
                .put(upsert_conversation)
                .delete(delete_conversation),
        )
        .route("/sync/events", get(events))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(no_store_headers))
        .with_state(state)
}

/// Running server handle; shutting down is graceful and idempotent.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ServerHandle {
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub async fn spawn(config: ServerConfig, core: Arc<SyncCore>) -> Result<ServerHandle> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    let state = AppState {
        core,
        cfg: Arc::new(config),
    };
    let router = create_router(state);
    let (tx, rx) = oneshot::channel::<()>();

    tracing::info!("sync server listening on {local_addr}");
    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!("sync server exited with error: {e}");
        }
    });

    Ok(ServerHandle {
        local_addr,
        shutdown: Some(tx),
    })
}

/// Open the store at the configured path and serve until interrupted.
pub async fn run(config: ServerConfig) -> Result<()> {
    let store = Arc::new(Store::open(&config.db_path)?);
    let notifier = Arc::new(Notifier::new());
    let core = Arc::new(SyncCore::new(store, notifier));

    let mut handle = spawn(config, core).await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down sync server");
    handle.shutdown();
    Ok(())
}
