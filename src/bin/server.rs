//! Mytoken Server
//!
//! Serves the mytoken HTTP API on top of the core library:
//! - Mytoken endpoint for all grant types
//! - Access tokens, revocation, transfer codes and tokeninfo
//! - Consent pages and the provider callback
//!
//! # Usage
//!
//! ```bash
//! mytoken-keygen > signing_key.pem
//! MYTOKEN_CONFIG=config.yaml mytoken-server --listen 0.0.0.0:8000
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use mytoken::context::now;
use mytoken::{
    AccessTokenRequest, ClientMetadata, Cluster, CodeExchangeOutcome, Config, ConsentUpdate,
    Context, Error, Lookups, MytokenRequest, MytokenService, RevocationRequest, TokeninfoRequest,
    TransferCodeRequest, API_PREFIX,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mytoken-server")]
#[command(about = "Mytoken Server", long_about = None)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "MYTOKEN_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Address to listen on
    #[arg(short, long, env = "MYTOKEN_LISTEN", default_value = "0.0.0.0:8000")]
    listen: SocketAddr,
}

type AppState = Arc<MytokenService>;

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    database_nodes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AuthorizationUrlResponse {
    authorization_url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;
    config.validate()?;
    let db = &config.database;
    let cluster = Arc::new(Cluster::from_urls(&db.nodes, db.pool_settings(), db.max_attempts));
    cluster.connect().await?;
    let reconnect_every = Duration::from_secs(db.reconnect_interval_secs.max(1));
    let sweep_every = Some(db.cleanup_interval_secs)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);
    let context = Context::from_config(config, Lookups::default())?;
    let service = Arc::new(MytokenService::new(context, Arc::clone(&cluster)));

    let reconnector = cluster.spawn_reconnector(reconnect_every);
    let sweeper = sweep_every.map(|every| cluster.spawn_sweeper(every, now));

    let app = Router::new()
        .route("/health", get(health))
        .route(&format!("{}/token/my", API_PREFIX), post(mytoken_endpoint))
        .route(&format!("{}/token/access", API_PREFIX), post(access_token))
        .route(&format!("{}/token/revoke", API_PREFIX), post(revoke))
        .route(&format!("{}/token/transfer", API_PREFIX), post(transfer_code))
        .route(&format!("{}/token/polling", API_PREFIX), post(mytoken_endpoint))
        .route(&format!("{}/tokeninfo", API_PREFIX), post(tokeninfo))
        .route("/c/:consent_code", get(consent_info).post(consent))
        .route("/redirect", get(redirect))
        .route("/native", get(native_done))
        .with_state(service);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, "Mytoken server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not install shutdown handler");
        }
    })
    .await?;

    reconnector.stop().await;
    if let Some(sweeper) = sweeper {
        sweeper.stop().await;
    }
    info!("Mytoken server stopped");
    Ok(())
}

// ============================================================================
// Plumbing
// ============================================================================

/// Wire form of a library error.
struct ApiFailure(Error);

impl From<Error> for ApiFailure {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        if self.0.is_internal() {
            error!(error = %self.0, code = self.0.code().code(), "Request failed");
        }
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_api_error())).into_response()
    }
}

type ApiResult<T> = Result<T, ApiFailure>;

fn client_of(addr: SocketAddr, headers: &HeaderMap) -> ClientMetadata {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    ClientMetadata::new(addr.ip(), user_agent)
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| ApiFailure(Error::InvalidRequest(format!("malformed body: {}", e))))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(service): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        database_nodes: service.cluster().active_nodes(),
    })
}

async fn mytoken_endpoint(
    State(service): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let client = client_of(addr, &headers);
    let req = MytokenRequest::from_json(&body)?;
    let res = service.handle_token_request(req, &client, now()).await?;
    Ok(Json(res).into_response())
}

async fn access_token(
    State(service): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let client = client_of(addr, &headers);
    let req: AccessTokenRequest = parse_json(&body)?;
    let res = service.access_token(req, &client, now()).await?;
    Ok(Json(res).into_response())
}

async fn revoke(State(service): State<AppState>, body: Bytes) -> ApiResult<StatusCode> {
    let req: RevocationRequest = parse_json(&body)?;
    service.revoke(req, now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn transfer_code(
    State(service): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let client = client_of(addr, &headers);
    let req: TransferCodeRequest = parse_json(&body)?;
    let res = service.create_transfer_code(req, &client, now()).await?;
    Ok((StatusCode::CREATED, Json(res)).into_response())
}

async fn tokeninfo(
    State(service): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let client = client_of(addr, &headers);
    let req: TokeninfoRequest = parse_json(&body)?;
    let res = service.tokeninfo(req, &client, now()).await?;
    Ok(Json(res).into_response())
}

async fn consent_info(
    State(service): State<AppState>,
    Path(consent_code): Path<String>,
) -> ApiResult<Response> {
    let info = service.consent_info(&consent_code, now()).await?;
    Ok(Json(info).into_response())
}

/// Approve with a (possibly empty JSON object) body; decline with no body.
async fn consent(
    State(service): State<AppState>,
    Path(consent_code): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    if body.is_empty() {
        service.decline_consent(&consent_code).await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let client = client_of(addr, &headers);
    let update: ConsentUpdate = parse_json(&body)?;
    let authorization_url = service
        .approve_consent(&consent_code, update, &client, now())
        .await?;
    Ok(Json(AuthorizationUrlResponse { authorization_url }).into_response())
}

async fn redirect(
    State(service): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<mytoken::service::RedirectQuery>,
) -> ApiResult<Response> {
    let client = client_of(addr, &headers);
    match service.handle_redirect(query, &client, now()).await? {
        CodeExchangeOutcome::Web(res) => Ok(Json(res).into_response()),
        CodeExchangeOutcome::Native { redirect } => Ok(Redirect::to(&redirect).into_response()),
    }
}

async fn native_done() -> &'static str {
    "The authorization is complete. You can close this window and return to your application."
}
