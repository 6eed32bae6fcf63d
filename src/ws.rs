use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::api::{authorize, validate_exec_request, AppState};
use crate::engine::cmd::{ExecRequest, RunResult};
use crate::error::ApiError;

/// One JSON request per frame, tagged with a client-supplied id; responses
/// carry the matching id and may arrive out of order.
#[derive(Debug, Deserialize)]
struct WsRequest {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(flatten)]
    request: ExecRequest,
}

#[derive(Debug, Serialize)]
struct WsResponse {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<Vec<RunResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    authorize(&state.config, &headers)?;
    Ok(upgrade.on_upgrade(move |socket| handle_socket(socket, state)))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsResponse>(64);

    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&response) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let request: WsRequest = match serde_json::from_str(&text) {
                    Ok(request) => request,
                    Err(err) => {
                        let _ = tx
                            .send(WsResponse {
                                request_id: String::new(),
                                results: None,
                                error: Some(format!("malformed request: {err}")),
                            })
                            .await;
                        continue;
                    }
                };
                let state = state.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let WsRequest {
                        request_id,
                        request,
                    } = request;
                    let response = match execute(&state, request).await {
                        Ok(results) => WsResponse {
                            request_id,
                            results: Some(results),
                            error: None,
                        },
                        Err(err) => WsResponse {
                            request_id,
                            results: None,
                            error: Some(err.to_string()),
                        },
                    };
                    let _ = tx.send(response).await;
                });
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    drop(tx);
    let _ = writer.await;
}

async fn execute(state: &AppState, request: ExecRequest) -> Result<Vec<RunResult>, ApiError> {
    validate_exec_request(&state.config, state.worker.store(), &request).await?;
    Ok(state.worker.submit(request).await?)
}
