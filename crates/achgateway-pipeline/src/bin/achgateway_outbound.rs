//! Outbound aggregation service.
//!
//! Boots one aggregator per configured shard and exposes a small HTTP
//! ingress for producers: file submission, cancellation, and manual cutoff
//! triggering. The event bus and clustered lock backend are wired here;
//! this binary uses the in-process implementations, suitable for
//! single-node deployments and local development.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use achgateway_core::observability::{init_logging, LogFormat};
use achgateway_core::AchFile;
use achgateway_pipeline::aggregate::{Aggregator, ShardHandle};
use achgateway_pipeline::error::Result as PipelineResult;
use achgateway_pipeline::events::{Emitter, FileUploaded};
use achgateway_pipeline::leader::memory::{InMemoryLockBackend, SessionLock};
use achgateway_pipeline::leader::LeaderLock;
use achgateway_pipeline::merging::{CancelAchFile, IncomingAchFile};
use achgateway_pipeline::shard::Shard;
use achgateway_pipeline::upload::{UploadAgentConfig, UploadAgents};

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
enum ConfigLogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppConfig {
    #[serde(default)]
    log_format: ConfigLogFormat,
    #[serde(default = "default_bind_address")]
    bind_address: String,
    shards: Vec<Shard>,
    upload_agents: Vec<UploadAgentConfig>,
}

fn default_bind_address() -> String {
    "127.0.0.1:8484".to_string()
}

/// Publishes domain events to the log until a bus is wired in.
struct LogEmitter;

#[async_trait::async_trait]
impl Emitter for LogEmitter {
    async fn send(&self, event: FileUploaded) -> PipelineResult<()> {
        info!(
            file_id = %event.file_id,
            shard_key = %event.shard_key,
            uploaded_at = %event.uploaded_at,
            "file uploaded"
        );
        Ok(())
    }
}

struct AppState {
    handles: HashMap<String, ShardHandle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitFile {
    file_id: String,
    file: AchFile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitCancellation {
    file_id: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args()
        .nth(1)
        .ok_or("usage: achgateway-outbound <config.json>")?;
    let config: AppConfig = serde_json::from_slice(&std::fs::read(&config_path)?)?;

    init_logging(match config.log_format {
        ConfigLogFormat::Json => LogFormat::Json,
        ConfigLogFormat::Pretty => LogFormat::Pretty,
    });

    let agents = Arc::new(UploadAgents::new(config.upload_agents));
    let leader: Arc<dyn LeaderLock> =
        Arc::new(SessionLock::connect(Arc::new(InMemoryLockBackend::default())));
    let emitter = Arc::new(LogEmitter);

    let shutdown = CancellationToken::new();
    let mut handles = HashMap::new();
    let mut aggregators = Vec::new();

    for shard in config.shards {
        let name = shard.name.clone();
        let aggregator = Aggregator::new(
            shard,
            agents.clone(),
            leader.clone(),
            emitter.clone(),
            None,
            None,
        )?;
        handles.insert(name.clone(), aggregator.handle());
        aggregators.push(tokio::spawn(aggregator.run(shutdown.clone())));
        info!(shard = %name, "started aggregator");
    }

    let state = Arc::new(AppState { handles });
    let router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/shards/:name/files", post(submit_file))
        .route("/shards/:name/cancellations", post(submit_cancellation))
        .route("/shards/:name/cutoff", put(trigger_cutoff))
        .with_state(state);

    let addr: SocketAddr = config.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await;
        if let Err(err) = result {
            error!(%err, "http server failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();

    for task in aggregators {
        let _ = task.await;
    }
    let _ = server.await;
    leader.shutdown().await;
    Ok(())
}

fn find_shard<'a>(
    state: &'a AppState,
    name: &str,
) -> Result<&'a ShardHandle, (StatusCode, String)> {
    state
        .handles
        .get(name)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown shard {name:?}")))
}

async fn submit_file(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<SubmitFile>,
) -> Result<StatusCode, (StatusCode, String)> {
    let handle = find_shard(&state, &name)?;
    handle
        .accept_file(IncomingAchFile {
            file_id: body.file_id,
            file: body.file,
            shard_key: name,
        })
        .await
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(StatusCode::CREATED)
}

async fn submit_cancellation(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<SubmitCancellation>,
) -> Result<StatusCode, (StatusCode, String)> {
    let handle = find_shard(&state, &name)?;
    handle
        .accept_cancellation(CancelAchFile {
            file_id: body.file_id,
        })
        .await
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(StatusCode::OK)
}

async fn trigger_cutoff(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let handle = find_shard(&state, &name)?;
    handle
        .trigger_cutoff()
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(StatusCode::OK)
}
