//! api-server — HTTP API for syncing per-book text replacements.
//!
//! Serves the collection endpoint (`GET`/`POST /api/replacements`) and the item
//! endpoint (`PATCH`/`DELETE /api/replacements/:id`) and supports local dev with:
//! - Auth: Supabase session tokens (remote lookup or local HS256 check) or
//!   disabled (debug) mode via X-Debug-User.
//! - Storage: Supabase PostgREST (default), SQLite (file) when the `sqlite`
//!   feature is enabled, or in-memory.
//! - CORS: Configurable via CORS_ALLOW_ORIGIN (origin string) for the reader app.
//!
//! Run:
//! ```bash
//! # against a Supabase project
//! SUPABASE_URL=https://<ref>.supabase.co SUPABASE_ANON_KEY=... \
//!   cargo run -p api-server
//!
//! # fully local
//! AUTH_PROVIDER=none STORAGE_PROVIDER=sqlite cargo run -p api-server
//! ```
//!
//! Configuration: See `config.rs` for all environment variables.
//!

mod config;

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::HeaderValue;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch},
    Json, Router,
};
use chrono::{DateTime, Utc};
use domain::adapters::memory_store::InMemoryStore;
use domain::service::ReplacementService;
use domain::{
    Caller, Clock, CoreError, NewReplacement, Replacement, ReplacementDraft, ReplacementId,
    ReplacementPatch, ReplacementStore, SyncFilter, UserId,
};
use http_common::{json_error, json_store_error, parse_since, NO_CACHE_HEADERS};
use postgrest_adapter::{PostgrestClient, PostgrestStore};
use serde::de::DeserializeOwned;
use supabase_auth::SupabaseAuth;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Store selected at startup (sqlite feature-gated).
enum AnyStore {
    Memory(InMemoryStore),
    Postgrest(PostgrestStore),
    #[cfg(feature = "sqlite")]
    Sqlite(sqlite_adapter::SqliteStore),
}

#[async_trait]
impl ReplacementStore for AnyStore {
    async fn list(
        &self,
        caller: &Caller,
        filter: &SyncFilter,
    ) -> Result<Vec<Replacement>, CoreError> {
        match self {
            AnyStore::Memory(s) => s.list(caller, filter).await,
            AnyStore::Postgrest(s) => s.list(caller, filter).await,
            #[cfg(feature = "sqlite")]
            AnyStore::Sqlite(s) => s.list(caller, filter).await,
        }
    }

    async fn insert(
        &self,
        caller: &Caller,
        new: NewReplacement,
        now: DateTime<Utc>,
    ) -> Result<Option<Replacement>, CoreError> {
        match self {
            AnyStore::Memory(s) => s.insert(caller, new, now).await,
            AnyStore::Postgrest(s) => s.insert(caller, new, now).await,
            #[cfg(feature = "sqlite")]
            AnyStore::Sqlite(s) => s.insert(caller, new, now).await,
        }
    }

    async fn update(
        &self,
        caller: &Caller,
        id: &ReplacementId,
        patch: &ReplacementPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Replacement>, CoreError> {
        match self {
            AnyStore::Memory(s) => s.update(caller, id, patch, now).await,
            AnyStore::Postgrest(s) => s.update(caller, id, patch, now).await,
            #[cfg(feature = "sqlite")]
            AnyStore::Sqlite(s) => s.update(caller, id, patch, now).await,
        }
    }
}

/// How incoming requests are authenticated.
#[derive(Clone)]
enum Authenticator {
    /// `X-Debug-User` names the caller (AUTH_PROVIDER=none).
    Debug,
    Supabase(SupabaseAuth),
}

#[derive(Clone)]
struct AppState {
    service: Arc<ReplacementService<AnyStore, StdClock>>,
    auth: Authenticator,
}

#[derive(Clone)]
struct StdClock;
impl Clock for StdClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[tokio::main]
async fn main() {
    // Load and validate config first (fail fast on misconfiguration)
    let cfg = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&cfg);
    cfg.warn_if_insecure();

    let store = match build_store(&cfg) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "failed to initialise storage");
            std::process::exit(1);
        }
    };
    let state = AppState {
        service: Arc::new(ReplacementService::new(store, StdClock)),
        auth: build_authenticator(&cfg),
    };

    // CORS - already validated in Config::from_env()
    let cors = if cfg.cors_allow_origin == HeaderValue::from_static("*") {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list([cfg.cors_allow_origin.clone()]))
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::PATCH,
                axum::http::Method::DELETE,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
    };
    let app = router(state).layer(cors);

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, err = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(%addr, "api-server listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!(err = %e, "server error");
        std::process::exit(1);
    }
}

fn init_tracing(cfg: &config::Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match cfg.log_format {
        config::LogFormat::Json => {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_timer(fmt::time::SystemTime)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
        config::LogFormat::Pretty => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
    }
}

// Construct the store selected by config and feature flags.
fn build_store(cfg: &config::Config) -> Result<AnyStore, CoreError> {
    match cfg.storage_provider {
        config::StorageProvider::Memory => Ok(AnyStore::Memory(InMemoryStore::new())),
        config::StorageProvider::Postgrest => {
            // Both are validated in Config::from_env() for this provider
            let (Some(url), Some(key)) = (&cfg.supabase_url, &cfg.supabase_anon_key) else {
                return Err(CoreError::Repository("missing Supabase project settings".into()));
            };
            let client = PostgrestClient::new(url, key.clone());
            Ok(AnyStore::Postgrest(PostgrestStore::new(
                client,
                cfg.replacements_table.clone(),
            )))
        }
        #[cfg(feature = "sqlite")]
        config::StorageProvider::Sqlite => Ok(AnyStore::Sqlite(
            sqlite_adapter::SqliteStore::open_creating_dirs(&cfg.db_path)?,
        )),
        #[cfg(not(feature = "sqlite"))]
        config::StorageProvider::Sqlite => Err(CoreError::Repository(
            "STORAGE_PROVIDER=sqlite requires the `sqlite` feature".into(),
        )),
    }
}

fn build_authenticator(cfg: &config::Config) -> Authenticator {
    match cfg.auth_provider {
        config::AuthProvider::None => Authenticator::Debug,
        config::AuthProvider::Jwt => Authenticator::Supabase(SupabaseAuth::jwt(
            cfg.supabase_jwt_secret.clone(),
            cfg.insecure_skip_signature,
        )),
        config::AuthProvider::Supabase => Authenticator::Supabase(SupabaseAuth::remote(
            cfg.supabase_url.as_deref().unwrap_or_default(),
            cfg.supabase_anon_key.clone().unwrap_or_default(),
        )),
    }
}

fn router(state: AppState) -> Router {
    with_pipeline(routes().with_state(state))
}

fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/replacements",
            get(list_replacements)
                .post(create_replacement)
                .options(preflight)
                .fallback(collection_method_not_allowed),
        )
        // Empty final segment: handlers see no id and answer "Missing id"
        .route("/api/replacements/", item_routes())
        .route("/api/replacements/:id", item_routes())
}

// Request pipeline shared by every route: panic recovery, request id, tracing.
fn with_pipeline(app: Router) -> Router {
    // Request ID header name
    let x_request_id = axum::http::HeaderName::from_static("x-request-id");

    app.layer(CatchPanicLayer::custom(panic_response))
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = %detail, "handler panicked");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        http_common::INTERNAL_SERVER_ERROR,
    )
}

fn item_routes() -> axum::routing::MethodRouter<AppState> {
    patch(update_replacement)
        .delete(delete_replacement)
        .options(preflight)
        .fallback(item_method_not_allowed)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json_error(message))).into_response()
}

fn not_authenticated() -> Response {
    error_response(StatusCode::FORBIDDEN, http_common::NOT_AUTHENTICATED)
}

fn invalid_json_body() -> Response {
    error_response(StatusCode::BAD_REQUEST, "Invalid JSON body")
}

fn method_not_allowed(allow: &'static str) -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, allow)],
        Json(json_error(http_common::METHOD_NOT_ALLOWED)),
    )
        .into_response()
}

// Map a service error to the response clients expect.
fn core_error_response(e: CoreError, action: &'static str) -> Response {
    match e {
        CoreError::MissingFields | CoreError::InvalidId => {
            warn!(err = ?e, action, "rejected request");
            error_response(StatusCode::BAD_REQUEST, &e.to_string())
        }
        CoreError::Repository(msg) => {
            error!(err = %msg, action, "store error");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json_store_error(&msg))).into_response()
        }
        CoreError::InvalidUserId => {
            error!(err = ?e, action, "unexpected error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                http_common::INTERNAL_SERVER_ERROR,
            )
        }
    }
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Caller, Response> {
    let user = match &state.auth {
        Authenticator::Debug => {
            let user = headers
                .get("X-Debug-User")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            match user {
                Some(u) => return caller_from(u.to_string(), u.to_string()),
                None => {
                    warn!("auth failed: missing X-Debug-User");
                    return Err(not_authenticated());
                }
            }
        }
        Authenticator::Supabase(auth) => {
            let header = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            auth.validate_user_and_token(header).await
        }
    };
    match user {
        Ok(u) => caller_from(u.id, u.token),
        Err(e) => {
            warn!(err = ?e, "auth failed");
            Err(not_authenticated())
        }
    }
}

fn caller_from(user_id: String, token: String) -> Result<Caller, Response> {
    match UserId::new(user_id) {
        Ok(id) => Ok(Caller::new(id, token)),
        Err(_) => {
            warn!("auth failed: empty user id");
            Err(not_authenticated())
        }
    }
}

// Parse a request body that must be a JSON object.
fn parse_object<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            warn!(err = %e, "body is not valid JSON");
            return Err(invalid_json_body());
        }
    };
    if !value.is_object() {
        warn!("body is not a JSON object");
        return Err(invalid_json_body());
    }
    serde_json::from_value(value).map_err(|e| {
        warn!(err = %e, "body has unexpected field types");
        invalid_json_body()
    })
}

// First occurrence of a query parameter; an empty value counts as absent.
fn query_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}

async fn list_replacements(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> impl IntoResponse {
    let caller = match authenticate(&state, &headers).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let since = match query_param(&params, "since") {
        Some(raw) => match parse_since(raw) {
            Some(t) => Some(t),
            None => {
                warn!(since = %raw, "invalid since");
                return error_response(StatusCode::BAD_REQUEST, "Invalid \"since\" timestamp");
            }
        },
        None => None,
    };
    let filter = SyncFilter {
        book_hash: query_param(&params, "book_hash").map(str::to_string),
        since,
    };

    match state.service.list(&caller, &filter).await {
        Ok(rows) => (StatusCode::OK, NO_CACHE_HEADERS, Json(rows)).into_response(),
        Err(e) => core_error_response(e, "list"),
    }
}

async fn create_replacement(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let caller = match authenticate(&state, &headers).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let draft: ReplacementDraft = match parse_object(&body) {
        Ok(d) => d,
        Err(resp) => return resp,
    };

    match state.service.create(&caller, draft).await {
        Ok(row) => {
            if let Some(r) = &row {
                info!(id = %r.id, book_hash = %r.book_hash, "replacement created");
            }
            (StatusCode::CREATED, Json(row)).into_response()
        }
        Err(e) => core_error_response(e, "create"),
    }
}

async fn preflight() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn collection_method_not_allowed() -> impl IntoResponse {
    method_not_allowed("GET, POST")
}

async fn item_method_not_allowed() -> impl IntoResponse {
    method_not_allowed("PATCH, DELETE")
}

fn path_id(id: Option<Path<String>>) -> Result<ReplacementId, Response> {
    let raw = id.map(|Path(id)| id).unwrap_or_default();
    ReplacementId::new(raw).map_err(|e| core_error_response(e, "resolve id"))
}

async fn update_replacement(
    State(state): State<AppState>,
    headers: HeaderMap,
    id: Option<Path<String>>,
    body: Bytes,
) -> impl IntoResponse {
    let caller = match authenticate(&state, &headers).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let patch: ReplacementPatch = match parse_object(&body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let id = match path_id(id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.service.update(&caller, &id, &patch).await {
        Ok(row) => {
            match &row {
                Some(r) => info!(id = %r.id, "replacement updated"),
                None => warn!(id = %id.as_str(), "update matched no row"),
            }
            (StatusCode::OK, Json(row)).into_response()
        }
        Err(e) => core_error_response(e, "update"),
    }
}

async fn delete_replacement(
    State(state): State<AppState>,
    headers: HeaderMap,
    id: Option<Path<String>>,
) -> impl IntoResponse {
    let caller = match authenticate(&state, &headers).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let id = match path_id(id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.service.soft_delete(&caller, &id).await {
        Ok(row) => {
            match &row {
                Some(r) => info!(id = %r.id, "replacement deleted"),
                None => warn!(id = %id.as_str(), "delete matched no row"),
            }
            (StatusCode::OK, Json(row)).into_response()
        }
        Err(e) => core_error_response(e, "delete"),
    }
}
