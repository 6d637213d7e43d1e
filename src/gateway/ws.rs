//! WebSocket endpoints: the builder bridge and the pipeline session.
//!
//! The bridge relays frames between a client socket and an upstream builder
//! socket. Until the upstream reaches `open`, inbound client frames queue in
//! a bounded [`PendingQueue`]; blowing the bound is a fatal backpressure
//! condition that closes both sides. Neither side of a bridge has an
//! independent lifetime.

use axum::{
    extract::{
        Extension, Path, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::PgPool;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::handlers::auth::guard::{authenticate, extract_client_ip};
use crate::api::handlers::auth::rate_limit::{RateLimitAction, RateLimitDecision};
use crate::api::handlers::auth::{AuthState, EntitlementFlag};
use crate::api::handlers::auth::guard::require_entitlement;
use crate::api::handlers::jobs::{AttachJobRequest, attach_job};
use crate::api::metrics::{self, MetricsSink};

use super::sse::stream_with_completion;
use super::upstream::{PipelineRequest, builder_ws_url};
use super::{GatewayState, OutEvent};

const CLOSE_POLICY: u16 = 1008;
const CLOSE_OVERFLOW: u16 = 1009;
const CLOSE_ERROR: u16 = 1011;

/// Static preface applied when no prompt-enhancement service is configured.
const PROMPT_PREFACE: &str = "Please generate a secure, minimal, audited smart contract. \
    Prefer OpenZeppelin patterns. Enforce checks-effects-interactions. \
    Provide clear constructor args.";

/// Bounded queue for client frames awaiting the upstream `open`.
#[derive(Debug)]
pub struct PendingQueue {
    messages: Vec<Message>,
    bytes: usize,
    max_messages: usize,
    max_bytes: usize,
}

/// The queue bound was exceeded; the bridge must fail fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOverflow;

fn message_size(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(bytes) | Message::Ping(bytes) | Message::Pong(bytes) => bytes.len(),
        Message::Close(_) => 0,
    }
}

impl PendingQueue {
    #[must_use]
    pub fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            messages: Vec::new(),
            bytes: 0,
            max_messages,
            max_bytes,
        }
    }

    /// Queue a frame. The frame is stored first; crossing either bound is
    /// reported so the caller can tear the bridge down.
    ///
    /// # Errors
    /// Returns [`PendingOverflow`] when the count or byte bound is exceeded.
    pub fn push(&mut self, message: Message) -> Result<(), PendingOverflow> {
        self.bytes += message_size(&message);
        self.messages.push(message);
        if self.messages.len() > self.max_messages || self.bytes > self.max_bytes {
            return Err(PendingOverflow);
        }
        Ok(())
    }

    /// Take every queued frame in arrival order.
    pub fn drain(&mut self) -> Vec<Message> {
        self.bytes = 0;
        std::mem::take(&mut self.messages)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.bytes
    }
}

fn to_upstream(message: Message) -> UpstreamMessage {
    match message {
        Message::Text(text) => UpstreamMessage::Text(text),
        Message::Binary(bytes) => UpstreamMessage::Binary(bytes),
        Message::Ping(bytes) => UpstreamMessage::Ping(bytes),
        Message::Pong(bytes) => UpstreamMessage::Pong(bytes),
        Message::Close(frame) => UpstreamMessage::Close(frame.map(|frame| UpstreamCloseFrame {
            code: CloseCode::from(frame.code),
            reason: frame.reason,
        })),
    }
}

fn to_client(message: UpstreamMessage) -> Option<Message> {
    match message {
        UpstreamMessage::Text(text) => Some(Message::Text(text)),
        UpstreamMessage::Binary(bytes) => Some(Message::Binary(bytes)),
        UpstreamMessage::Ping(bytes) => Some(Message::Ping(bytes)),
        UpstreamMessage::Pong(bytes) => Some(Message::Pong(bytes)),
        UpstreamMessage::Close(frame) => Some(Message::Close(frame.map(|frame| CloseFrame {
            code: frame.code.into(),
            reason: frame.reason,
        }))),
        UpstreamMessage::Frame(_) => None,
    }
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}

fn valid_project_id(project_id: &str) -> bool {
    Regex::new(r"^[0-9a-zA-Z-]{8,64}$").is_ok_and(|regex| regex.is_match(project_id))
}

#[utoipa::path(
    get,
    path = "/v1/ws/builder/{project_id}",
    params(("project_id" = String, Path, description = "Builder project id")),
    responses(
        (status = 101, description = "WebSocket bridge to the builder session"),
        (status = 403, description = "Missing pro entitlement")
    ),
    tag = "gateway"
)]
pub async fn builder_bridge(
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    gateway: Extension<Arc<GatewayState>>,
    metrics_sink: Extension<Arc<dyn MetricsSink>>,
    Path(project_id): Path<String>,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    if !valid_project_id(&project_id) {
        return ApiError::bad_request("invalid project id").into_response();
    }
    if let Err(err) = require_entitlement(&pool, &ctx, EntitlementFlag::ProEnabled).await {
        return err.into_response();
    }
    let ip = extract_client_ip(&headers).unwrap_or_else(|| "unknown".to_string());
    let limiter = auth_state.rate_limiter();
    if limiter.check(RateLimitAction::BridgeOpen, &ctx.user_id.to_string())
        == RateLimitDecision::Limited
        || limiter.check(RateLimitAction::BridgeOpen, &ip) == RateLimitDecision::Limited
    {
        return ApiError::RateLimited.into_response();
    }
    let Some(builder_base) = gateway.config().builder_base_url() else {
        return ApiError::UpstreamUnreachable.into_response();
    };

    let upstream_url = builder_ws_url(builder_base, &format!("/ws/{project_id}"));
    let state = gateway.0.clone();
    metrics_sink.increment(metrics::BRIDGES_OPENED);
    info!(%project_id, user_id = %ctx.user_id, "builder bridge opened");

    ws.on_upgrade(move |socket| bridge_session(socket, upstream_url, state))
}

/// Relay frames between a client socket and the upstream builder socket.
///
/// Either side closing, erroring, or disconnecting tears down the other.
async fn bridge_session(socket: WebSocket, upstream_url: String, state: Arc<GatewayState>) {
    let (mut client_tx, mut client_rx) = socket.split();
    let config = state.config();
    let mut pending = PendingQueue::new(
        config.pending_max_messages(),
        config.pending_max_bytes(),
    );

    // Queue client frames until the upstream dial resolves.
    let connect = connect_async(upstream_url.as_str());
    tokio::pin!(connect);
    let upstream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((upstream, _)) => break upstream,
                Err(err) => {
                    warn!(%upstream_url, "builder upstream connect failed: {err}");
                    let _ = client_tx.send(close_frame(CLOSE_ERROR, "upstream_error")).await;
                    return;
                }
            },
            message = client_rx.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(message)) => {
                    if pending.push(message).is_err() {
                        // Fail fast instead of buffering without bound.
                        warn!(%upstream_url, "pending queue overflow before upstream open");
                        let _ = client_tx.send(close_frame(CLOSE_OVERFLOW, "pending_overflow")).await;
                        return;
                    }
                }
            },
        }
    };

    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    // Flush queued frames in arrival order before going transparent.
    for message in pending.drain() {
        if upstream_tx.send(to_upstream(message)).await.is_err() {
            let _ = client_tx.send(close_frame(CLOSE_ERROR, "upstream_flush_failed")).await;
            return;
        }
    }

    let mut upstream_ping = tokio::time::interval(config.upstream_ping_interval());
    upstream_ping.tick().await;
    let mut client_heartbeat = tokio::time::interval(config.client_heartbeat_interval());
    client_heartbeat.tick().await;
    let mut client_alive = true;

    loop {
        tokio::select! {
            message = client_rx.next() => match message {
                Some(Ok(Message::Close(frame))) => {
                    let _ = upstream_tx.send(to_upstream(Message::Close(frame))).await;
                    break;
                }
                Some(Ok(Message::Pong(_))) => {
                    client_alive = true;
                }
                Some(Ok(message)) => {
                    if upstream_tx.send(to_upstream(message)).await.is_err() {
                        let _ = client_tx.send(close_frame(CLOSE_ERROR, "upstream_send_failed")).await;
                        break;
                    }
                }
                Some(Err(_)) | None => {
                    let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
                    break;
                }
            },
            message = upstream_rx.next() => match message {
                Some(Ok(UpstreamMessage::Close(frame))) => {
                    let close = to_client(UpstreamMessage::Close(frame));
                    if let Some(close) = close {
                        let _ = client_tx.send(close).await;
                    }
                    break;
                }
                Some(Ok(UpstreamMessage::Pong(_) | UpstreamMessage::Ping(_))) => {
                    // Keepalive traffic; the websocket layer answers pings.
                }
                Some(Ok(message)) => {
                    let Some(message) = to_client(message) else { continue };
                    if client_tx.send(message).await.is_err() {
                        let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!("builder upstream read failed: {err}");
                    let _ = client_tx.send(close_frame(CLOSE_ERROR, "upstream_error")).await;
                    break;
                }
                None => {
                    let _ = client_tx.send(close_frame(CLOSE_ERROR, "upstream_closed")).await;
                    break;
                }
            },
            _ = upstream_ping.tick() => {
                let _ = upstream_tx.send(UpstreamMessage::Ping(Vec::new())).await;
            }
            _ = client_heartbeat.tick() => {
                if !client_alive {
                    let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
                    let _ = client_tx.send(close_frame(CLOSE_POLICY, "heartbeat_timeout")).await;
                    break;
                }
                client_alive = false;
                let _ = client_tx.send(Message::Ping(Vec::new())).await;
            }
        }
    }
}

#[derive(Deserialize, Debug)]
struct StartMessage {
    #[serde(rename = "type")]
    kind: String,
    payload: Option<StartPayload>,
}

#[derive(Deserialize, Debug)]
struct StartPayload {
    prompt: String,
    network: String,
    max_iters: Option<u32>,
    filename: Option<String>,
    strict_args: Option<bool>,
}

fn validate_start(payload: &StartPayload) -> Result<(), &'static str> {
    if payload.prompt.len() < 4 || payload.prompt.len() > 20_000 {
        return Err("prompt length out of range");
    }
    if payload.network.len() < 2 || payload.network.len() > 64 {
        return Err("network length out of range");
    }
    if payload.filename.as_deref().is_some_and(|name| name.len() > 256) {
        return Err("filename too long");
    }
    Ok(())
}

fn event_message(event: &str, data: Value) -> Message {
    Message::Text(json!({ "event": event, "data": data }).to_string())
}

#[utoipa::path(
    get,
    path = "/v1/ws/pipeline",
    responses(
        (status = 101, description = "WebSocket pipeline session"),
        (status = 401, description = "No session")
    ),
    tag = "gateway"
)]
pub async fn pipeline_session(
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    gateway: Extension<Arc<GatewayState>>,
    metrics_sink: Extension<Arc<dyn MetricsSink>>,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    let ip = extract_client_ip(&headers).unwrap_or_else(|| "unknown".to_string());
    let limiter = auth_state.rate_limiter();
    if limiter.check(RateLimitAction::PipelineStart, &ctx.user_id.to_string())
        == RateLimitDecision::Limited
        || limiter.check(RateLimitAction::PipelineStart, &ip) == RateLimitDecision::Limited
    {
        return ApiError::RateLimited.into_response();
    }

    let state = gateway.0.clone();
    let pool = pool.0.clone();
    let sink = metrics_sink.0.clone();
    let user_id = ctx.user_id;
    ws.on_upgrade(move |socket| pipeline_ws(socket, pool, state, sink, user_id))
}

/// Drive one pipeline session: wait for `start`, submit the job, relay its
/// log stream, and run the completion trigger when the stream ends.
async fn pipeline_ws(
    socket: WebSocket,
    pool: PgPool,
    state: Arc<GatewayState>,
    metrics_sink: Arc<dyn MetricsSink>,
    user_id: Uuid,
) {
    let (mut client_tx, mut client_rx) = socket.split();
    if client_tx
        .send(event_message("ready", json!({})))
        .await
        .is_err()
    {
        return;
    }

    // Wait for a valid start message; malformed ones get an error event.
    let payload = loop {
        match client_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                let parsed: Option<StartMessage> = serde_json::from_str(&text).ok();
                let start = parsed.filter(|message| message.kind == "start");
                let Some(payload) = start.and_then(|message| message.payload) else {
                    let _ = client_tx
                        .send(event_message("error", json!({ "code": "bad_request" })))
                        .await;
                    continue;
                };
                if let Err(reason) = validate_start(&payload) {
                    let _ = client_tx
                        .send(event_message(
                            "error",
                            json!({ "code": "bad_request", "message": reason }),
                        ))
                        .await;
                    continue;
                }
                break payload;
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    };

    // Static prompt preface; a dedicated enhancement service is out of scope.
    let enhanced_prompt = format!("{PROMPT_PREFACE}\n\n{}", payload.prompt);
    let _ = client_tx
        .send(event_message(
            "prompt.enhanced",
            json!({ "prompt": enhanced_prompt }),
        ))
        .await;

    let request = PipelineRequest {
        prompt: enhanced_prompt.clone(),
        network: payload.network.clone(),
        max_iters: payload.max_iters,
        filename: payload.filename.clone(),
        strict_args: payload.strict_args,
    };
    let created = match state.client().submit_pipeline(&request).await {
        Ok(created) => created,
        Err(err) => {
            error!("pipeline submit failed: {err}");
            let _ = client_tx
                .send(event_message(
                    "error",
                    json!({ "code": err.api_error().code() }),
                ))
                .await;
            let _ = client_tx.send(close_frame(CLOSE_ERROR, "upstream_error")).await;
            return;
        }
    };
    let Some(job_id) = created.resolved_job_id() else {
        let _ = client_tx
            .send(event_message("error", json!({ "code": "no_job_id" })))
            .await;
        let _ = client_tx.send(close_frame(CLOSE_ERROR, "no_job_id")).await;
        return;
    };

    // Bind the job to its owner so later stream opens pass the gate.
    let attach = AttachJobRequest {
        job_id: job_id.clone(),
        network: payload.network.clone(),
        kind: Some("pipeline".to_string()),
        prompt: Some(enhanced_prompt),
        filename: payload.filename.clone(),
    };
    if let Err(err) = attach_job(&pool, user_id, &attach).await {
        warn!(%job_id, "job attach failed: {err:#}");
    }

    metrics_sink.increment(metrics::STREAMS_OPENED);
    info!(%job_id, %user_id, "pipeline session started");
    if client_tx
        .send(event_message("pipeline.created", json!({ "jobId": job_id })))
        .await
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::channel::<OutEvent>(64);
    let relay = stream_with_completion(
        state.clone(),
        pool.clone(),
        metrics_sink.clone(),
        job_id.clone(),
        None,
        tx,
    );
    tokio::pin!(relay);
    let mut relay_done = false;

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(out) => {
                    if client_tx
                        .send(event_message(&out.event, out.data))
                        .await
                        .is_err()
                    {
                        // Dropping the relay future aborts the upstream fetch.
                        return;
                    }
                }
                None => break,
            },
            _ = &mut relay, if !relay_done => {
                relay_done = true;
            }
            message = client_rx.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = client_tx
        .send(event_message("complete", json!({ "jobId": job_id })))
        .await;
    let _ = client_tx.send(Message::Close(None)).await;
}
