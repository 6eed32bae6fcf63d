use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;

use crate::config::Config;
use crate::engine::cmd::{ExecRequest, RequestFile, RunResult};
use crate::error::ApiError;
use crate::filestore::FileStore;
use crate::metrics::MetricsRegistry;
use crate::worker::Worker;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub worker: Arc<Worker>,
    pub metrics: Arc<MetricsRegistry>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/run", post(run))
        .route("/file", post(file_add).get(file_list))
        .route("/file/{id}", get(file_get).delete(file_delete))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "buildVersion": env!("CARGO_PKG_VERSION"),
        "runtimeVersion": concat!("rust ", env!("CARGO_PKG_RUST_VERSION")),
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    }))
}

async fn run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ExecRequest>,
) -> Result<Json<Vec<RunResult>>, ApiError> {
    authorize(&state.config, &headers)?;
    validate_exec_request(&state.config, state.worker.store(), &request).await?;
    let results = state.worker.submit(request).await?;
    Ok(Json(results))
}

#[derive(Debug, Deserialize)]
struct FileAddQuery {
    name: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct FileAddResponse {
    #[serde(rename = "blobId")]
    blob_id: String,
}

async fn file_add(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FileAddQuery>,
    body: Bytes,
) -> Result<Json<FileAddResponse>, ApiError> {
    authorize(&state.config, &headers)?;
    let name = query.name.unwrap_or_else(|| "file".to_string());
    let blob_id = state.worker.store().put(&name, body).await?;
    Ok(Json(FileAddResponse { blob_id }))
}

async fn file_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    authorize(&state.config, &headers)?;
    Ok(Json(state.worker.store().list().into_iter().collect()))
}

async fn file_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    authorize(&state.config, &headers)?;
    let (name, bytes) = state
        .worker
        .store()
        .get(&id)
        .await
        .ok_or(ApiError::NotFound)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={name}"),
            ),
        ],
        bytes,
    ))
}

async fn file_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state.config, &headers)?;
    if state.worker.store().delete(&id).await {
        Ok(Json(serde_json::json!({ "ok": true })))
    } else {
        Err(ApiError::NotFound)
    }
}

async fn metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<String, ApiError> {
    authorize(&state.config, &headers)?;
    if !state.config.enable_metrics {
        return Err(ApiError::NotFound);
    }
    Ok(state.metrics.render_prometheus())
}

/// Optional static bearer token; `/version` is registered without it.
pub(crate) fn authorize(config: &Config, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(token) = &config.auth_token else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    if constant_time_eq(presented.as_bytes(), token.as_bytes()) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Request-level checks that must never reach the engine: local sources
/// outside the configured prefix and unknown blob ids.
pub(crate) async fn validate_exec_request(
    config: &Config,
    store: &Arc<dyn FileStore>,
    request: &ExecRequest,
) -> Result<(), ApiError> {
    for cmd in &request.cmd {
        let sources = cmd.files.iter().flatten().chain(cmd.copy_in.values());
        for file in sources {
            match file {
                RequestFile::Local { src } => {
                    if !src.is_absolute() {
                        return Err(ApiError::InvalidRequest(format!(
                            "local source {} must be absolute",
                            src.display()
                        )));
                    }
                    if let Some(prefix) = &config.src_prefix {
                        if !src.starts_with(prefix) {
                            return Err(ApiError::InvalidRequest(format!(
                                "local source {} is outside the allowed prefix",
                                src.display()
                            )));
                        }
                    }
                }
                RequestFile::Cached { file_id } => {
                    if !store.contains(file_id).await {
                        return Err(ApiError::InvalidRequest(format!(
                            "unknown file id {file_id}"
                        )));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (left, right) in a.iter().zip(b.iter()) {
        diff |= left ^ right;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use super::*;
    use crate::engine::cmd::Cmd;
    use crate::filestore::MemoryStore;

    fn config_with_token(token: Option<&str>) -> Config {
        Config {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            parallelism: 1,
            work_dir: None,
            time_limit_checker_interval: Duration::from_millis(100),
            extra_memory_limit: 16 << 10,
            output_limit: 4096,
            copy_out_limit: 4096,
            pre_fork: 0,
            cgroup_prefix: "test".to_string(),
            enable_cpu_rate: false,
            cpu_cfs_period_us: 100_000,
            auth_token: token.map(String::from),
            src_prefix: Some("/allowed".into()),
            release: false,
            silent: true,
            enable_metrics: true,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn authorize_passes_without_a_configured_token() {
        let config = config_with_token(None);
        assert!(authorize(&config, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn authorize_requires_a_matching_bearer_token() {
        let config = config_with_token(Some("secret"));
        assert!(authorize(&config, &HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(authorize(&config, &headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(authorize(&config, &headers).is_ok());
    }

    #[test]
    fn constant_time_eq_compares_by_content() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[tokio::test]
    async fn validation_rejects_sources_outside_the_prefix() {
        let config = config_with_token(None);
        let store: Arc<dyn FileStore> = Arc::new(MemoryStore::new());
        let request = ExecRequest {
            cmd: vec![Cmd {
                args: vec!["/bin/cat".into()],
                files: vec![Some(RequestFile::Local {
                    src: "/etc/passwd".into(),
                })],
                ..Cmd::default()
            }],
            pipe_mapping: Vec::new(),
        };
        assert!(validate_exec_request(&config, &store, &request)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn validation_rejects_unknown_file_ids() {
        let config = config_with_token(None);
        let store: Arc<dyn FileStore> = Arc::new(MemoryStore::new());
        let request = ExecRequest {
            cmd: vec![Cmd {
                args: vec!["/bin/cat".into()],
                copy_in: [(
                    "/w/in".to_string(),
                    RequestFile::Cached {
                        file_id: "nope".into(),
                    },
                )]
                .into_iter()
                .collect(),
                ..Cmd::default()
            }],
            pipe_mapping: Vec::new(),
        };
        assert!(validate_exec_request(&config, &store, &request)
            .await
            .is_err());
    }
}
