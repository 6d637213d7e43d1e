//! SSE relay for job log streams.
//!
//! Re-frames the upstream SSE byte stream into discrete events, enriches
//! recognized log lines with flavor events, retries the upstream connection
//! without dropping the client, and fires the verification trigger after a
//! terminal `end` frame. Closing the client side aborts the upstream fetch:
//! the relay future is dropped as soon as the event channel closes.

use axum::{
    extract::{Extension, Path, RawQuery},
    http::HeaderMap,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use futures_util::StreamExt;
use regex::Regex;
use serde_json::{Value, json};
use sqlx::PgPool;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::api::error::ApiError;
use crate::api::handlers::auth::AuthState;
use crate::api::handlers::auth::guard::{authenticate, extract_client_ip};
use crate::api::handlers::auth::rate_limit::{RateLimitAction, RateLimitDecision};
use crate::api::handlers::jobs::user_owns_job;
use crate::api::metrics::{self, MetricsSink};

use super::flavor::{FlavorContext, flavor_from_log};
use super::frames::{FrameDecoder, SseFrame};
use super::verify::run_completion;
use super::{GatewayState, OutEvent};

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayEnd {
    /// Upstream delivered a terminal `end` frame.
    SawEnd,
    /// Reconnect budget exhausted without a terminal frame.
    Exhausted,
    /// The client went away; nothing further to deliver.
    ClientGone,
}

fn valid_job_id(job_id: &str) -> bool {
    Regex::new(r"^[A-Za-z0-9._:-]{1,128}$").is_ok_and(|regex| regex.is_match(job_id))
}

/// Forward one upstream frame, interleaving derived flavor events directly
/// after the `log` frame that produced them. Returns false once the client
/// channel is closed.
async fn emit_frame(
    tx: &mpsc::Sender<OutEvent>,
    frame: &SseFrame,
    ctx: &mut FlavorContext,
) -> bool {
    let data = frame
        .data_json()
        .unwrap_or_else(|| Value::String(frame.data.clone()));

    if frame.event == "log" {
        if let Some(msg) = data.get("msg").and_then(Value::as_str) {
            let events = flavor_from_log(msg, ctx);
            if tx.send(OutEvent::new("log", data.clone())).await.is_err() {
                return false;
            }
            for event in events {
                if let Some(name) = &event.contract_name {
                    ctx.contract_name = Some(name.clone());
                }
                let payload = serde_json::to_value(&event).unwrap_or(Value::Null);
                if tx.send(OutEvent::new("flavor", payload)).await.is_err() {
                    return false;
                }
            }
            return true;
        }
    }

    tx.send(OutEvent::new(frame.event.clone(), data))
        .await
        .is_ok()
}

/// Pump the upstream log stream into the client channel.
///
/// Upstream disconnects before a terminal frame retry the connection with
/// linear backoff; already-delivered frames are never replayed by the
/// gateway itself.
pub(crate) async fn relay_log_stream(
    state: &GatewayState,
    job_id: &str,
    query: Option<&str>,
    tx: &mpsc::Sender<OutEvent>,
) -> RelayEnd {
    let mut decoder = FrameDecoder::new();
    let mut ctx = FlavorContext::default();
    let mut saw_end = false;
    let max_attempts = state.config().reconnect_attempts();
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            let delay = state.config().backoff_step() * attempt;
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = tx.closed() => return RelayEnd::ClientGone,
            }
        }
        // A fresh connection starts from a clean frame boundary.
        decoder.reset();

        let connect = tokio::select! {
            result = state.client().open_log_stream(job_id, query) => result,
            () = tx.closed() => return RelayEnd::ClientGone,
        };
        let response = match connect {
            Ok(response) => response,
            Err(err) => {
                warn!(job_id, attempt, "log stream connect failed: {err}");
                attempt += 1;
                if attempt > max_attempts {
                    let _ = tx
                        .send(OutEvent::new(
                            "error",
                            json!({ "message": "upstream_unreachable" }),
                        ))
                        .await;
                    return RelayEnd::Exhausted;
                }
                continue;
            }
        };

        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for frame in decoder.feed(&bytes) {
                            if frame.event == "end" {
                                saw_end = true;
                            }
                            if !emit_frame(tx, &frame, &mut ctx).await {
                                return RelayEnd::ClientGone;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        warn!(job_id, attempt, "log stream read failed: {err}");
                        break;
                    }
                    None => break,
                },
                () = tx.closed() => return RelayEnd::ClientGone,
            }
        }

        if saw_end {
            return RelayEnd::SawEnd;
        }
        attempt += 1;
        if attempt > max_attempts {
            let _ = tx
                .send(OutEvent::new(
                    "error",
                    json!({ "message": "upstream_disconnected" }),
                ))
                .await;
            return RelayEnd::Exhausted;
        }
    }
}

/// Relay the stream, then fire the one-shot completion trigger if this
/// stream lifetime saw the terminal frame and no other stream already
/// claimed it for this job.
pub(crate) async fn stream_with_completion(
    state: Arc<GatewayState>,
    pool: PgPool,
    metrics_sink: Arc<dyn MetricsSink>,
    job_id: String,
    query: Option<String>,
    tx: mpsc::Sender<OutEvent>,
) -> RelayEnd {
    let end = relay_log_stream(&state, &job_id, query.as_deref(), &tx).await;
    if end == RelayEnd::SawEnd && state.claim_verification(&job_id) {
        run_completion(&state, &pool, metrics_sink.as_ref(), &job_id, &tx).await;
    }
    end
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}/logs/stream",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "SSE log stream"),
        (status = 404, description = "Not owned or unknown"),
        (status = 429, description = "Rate limited")
    ),
    tag = "gateway"
)]
pub async fn logs_stream(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    gateway: Extension<Arc<GatewayState>>,
    metrics_sink: Extension<Arc<dyn MetricsSink>>,
    Path(job_id): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let ctx = match authenticate(&headers, &pool, &auth_state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    if !valid_job_id(&job_id) {
        return ApiError::bad_request("invalid job id").into_response();
    }
    match user_owns_job(&pool, ctx.user_id, &job_id).await {
        Ok(true) => {}
        Ok(false) => return ApiError::NotFound.into_response(),
        Err(err) => {
            error!("job ownership check failed: {err:#}");
            return ApiError::ServiceUnavailable.into_response();
        }
    }
    let ip = extract_client_ip(&headers).unwrap_or_else(|| "unknown".to_string());
    let limiter = auth_state.rate_limiter();
    if limiter.check(RateLimitAction::StreamOpen, &ctx.user_id.to_string())
        == RateLimitDecision::Limited
        || limiter.check(RateLimitAction::StreamOpen, &ip) == RateLimitDecision::Limited
    {
        return ApiError::RateLimited.into_response();
    }

    metrics_sink.increment(metrics::STREAMS_OPENED);
    info!(%job_id, user_id = %ctx.user_id, "log stream opened");

    let (tx, rx) = mpsc::channel::<OutEvent>(64);
    let ping_interval = gateway.config().sse_ping_interval();
    let state = gateway.0.clone();
    let pool = pool.0.clone();
    let sink = metrics_sink.0.clone();

    tokio::spawn(async move {
        let ping_tx = tx.clone();
        let relay = stream_with_completion(state, pool, sink, job_id, query, tx);
        tokio::pin!(relay);
        // Pings keep intermediary proxies from timing the connection out,
        // including while the verification trigger is still running.
        let ping = async {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let event = OutEvent::new(
                    "ping",
                    json!({ "ts": chrono::Utc::now().timestamp_millis() }),
                );
                if ping_tx.send(event).await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            _ = &mut relay => {}
            () = ping => {}
        }
    });

    let stream = ReceiverStream::new(rx).map(|out| {
        Ok::<Event, Infallible>(Event::default().event(out.event).data(out.data.to_string()))
    });
    Sse::new(stream).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use std::time::Duration;

    #[test]
    fn job_id_validation() {
        assert!(valid_job_id("job-123"));
        assert!(valid_job_id("a.b:c_d"));
        assert!(!valid_job_id(""));
        assert!(!valid_job_id("job/../../etc"));
        assert!(!valid_job_id(&"x".repeat(200)));
    }

    #[tokio::test]
    async fn emit_frame_interleaves_flavor_after_log() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut ctx = FlavorContext::default();
        let frame = SseFrame::new("log", r#"{"msg":"Stage: generate"}"#);
        assert!(emit_frame(&tx, &frame, &mut ctx).await);
        drop(tx);

        let first = rx.recv().await.expect("log event");
        assert_eq!(first.event, "log");
        let second = rx.recv().await.expect("flavor event");
        assert_eq!(second.event, "flavor");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn emit_frame_passes_unknown_events_through() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut ctx = FlavorContext::default();
        let frame = SseFrame::new("progress", r#"{"pct":50}"#);
        assert!(emit_frame(&tx, &frame, &mut ctx).await);

        let event = rx.recv().await.expect("event");
        assert_eq!(event.event, "progress");
        assert_eq!(event.data["pct"], 50);
    }

    #[tokio::test]
    async fn emit_frame_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut ctx = FlavorContext::default();
        let frame = SseFrame::new("log", r#"{"msg":"hello"}"#);
        assert!(!emit_frame(&tx, &frame, &mut ctx).await);
    }

    // Connection to a dead upstream must exhaust the retry budget and emit
    // a terminal error frame rather than hanging.
    #[tokio::test]
    async fn relay_exhausts_retries_against_dead_upstream() {
        let config = GatewayConfig::new("http://127.0.0.1:1".to_string())
            .with_reconnect_attempts(1)
            .with_backoff_step(Duration::from_millis(1));
        let state = GatewayState::new(config).unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let end = relay_log_stream(&state, "job-1", None, &tx).await;
        assert_eq!(end, RelayEnd::Exhausted);
        drop(tx);

        let event = rx.recv().await.expect("error frame");
        assert_eq!(event.event, "error");
        assert_eq!(event.data["message"], "upstream_unreachable");
        assert!(rx.recv().await.is_none());
    }

    // A closed client channel aborts the relay without burning retries.
    #[tokio::test]
    async fn relay_stops_when_client_is_gone() {
        let config = GatewayConfig::new("http://127.0.0.1:1".to_string())
            .with_reconnect_attempts(5)
            .with_backoff_step(Duration::from_secs(30));
        let state = GatewayState::new(config).unwrap();
        let (tx, rx) = mpsc::channel::<OutEvent>(8);
        drop(rx);

        let end = tokio::time::timeout(
            Duration::from_secs(5),
            relay_log_stream(&state, "job-1", None, &tx),
        )
        .await
        .expect("relay must not wait out the 30s backoff");
        assert_eq!(end, RelayEnd::ClientGone);
    }
}
