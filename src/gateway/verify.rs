//! Post-deployment verification, triggered once per completed stream.
//!
//! The SSE stream is the sole trigger: when a terminal `end` frame was seen
//! and the stream drains, the gateway polls the job status (the upstream
//! needs a moment to finalize deploy state), and if a deployment is on
//! record it runs verification and reports progress on the still-open
//! client connection before closing.

use serde_json::json;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::api::handlers::jobs::{JobCachePatch, upsert_job_cache};
use crate::api::metrics::{self, MetricsSink};

use super::upstream::{DeploymentStatus, VerifyRequest};
use super::{GatewayState, OutEvent};

async fn emit(tx: &mpsc::Sender<OutEvent>, event: &str, data: serde_json::Value) {
    // The client may already be gone; verification proceeds regardless.
    let _ = tx.send(OutEvent::new(event, data)).await;
}

/// Poll the job status with bounded retries until a deployment shows up.
async fn poll_deployment(state: &GatewayState, job_id: &str) -> Option<DeploymentStatus> {
    for attempt in 0..state.config().status_poll_attempts() {
        if attempt > 0 {
            sleep(state.config().status_poll_delay()).await;
        }
        match state.client().job_detail(job_id).await {
            Ok(detail) => {
                if let Some(deployment) = detail.deployment() {
                    return Some(deployment);
                }
            }
            Err(err) => {
                warn!(job_id, attempt, "deployment status poll failed: {err}");
            }
        }
    }
    None
}

/// Run the one-shot verification side effect for a finished stream.
///
/// Callers must hold the per-job claim from
/// [`GatewayState::claim_verification`]; this function itself performs no
/// deduplication.
pub(crate) async fn run_completion(
    state: &GatewayState,
    pool: &PgPool,
    metrics_sink: &dyn MetricsSink,
    job_id: &str,
    tx: &mpsc::Sender<OutEvent>,
) {
    // Give the upstream a moment to settle its deploy state.
    sleep(state.config().settle_delay()).await;

    let Some(deployment) = poll_deployment(state, job_id).await else {
        warn!(job_id, "verification skipped: deployment not confirmed");
        emit(
            tx,
            "log",
            json!({ "msg": "Skipping verification: contract deploy status not confirmed", "level": "warn" }),
        )
        .await;
        return;
    };
    let Some(network) = deployment.network.clone() else {
        warn!(job_id, "verification skipped: no network on record");
        emit(
            tx,
            "log",
            json!({ "msg": "Skipping verification: deployment network unknown", "level": "warn" }),
        )
        .await;
        return;
    };

    metrics_sink.increment(metrics::VERIFICATIONS_TRIGGERED);
    info!(job_id, %network, address = %deployment.address, "auto-verification started");
    emit(
        tx,
        "verification.started",
        json!({ "jobId": job_id, "network": network, "address": deployment.address }),
    )
    .await;
    emit(
        tx,
        "log",
        json!({ "msg": format!("Starting auto-verification on {network}..."), "level": "info" }),
    )
    .await;

    let request = VerifyRequest {
        job_id: job_id.to_string(),
        network: network.clone(),
        fully_qualified_name: deployment.fq_name.clone(),
    };
    match state.client().verify_by_job(&request).await {
        Ok(outcome) => {
            let verified = outcome.ok && outcome.verified.unwrap_or(true);
            emit(
                tx,
                "verification.complete",
                json!({
                    "jobId": job_id,
                    "ok": outcome.ok,
                    "verified": verified,
                    "error": outcome.error_message(),
                }),
            )
            .await;
            if verified {
                emit(
                    tx,
                    "log",
                    json!({ "msg": format!("Contract verified successfully on {network}"), "level": "info" }),
                )
                .await;
                let patch = JobCachePatch {
                    state: "completed".to_string(),
                    address: Some(deployment.address.clone()),
                    fq_name: deployment.fq_name.clone(),
                    verified: Some(true),
                };
                if let Err(err) = upsert_job_cache(pool, job_id, &patch).await {
                    error!(job_id, "job cache writeback failed: {err:#}");
                }
            } else {
                let reason = outcome
                    .error_message()
                    .unwrap_or_else(|| "unknown error".to_string());
                emit(
                    tx,
                    "log",
                    json!({ "msg": format!("Contract verification failed: {reason}"), "level": "warn" }),
                )
                .await;
            }
        }
        Err(err) => {
            error!(job_id, "verification call failed: {err}");
            emit(
                tx,
                "verification.complete",
                json!({ "jobId": job_id, "ok": false, "verified": false, "error": err.to_string() }),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::metrics::AtomicMetricsSink;
    use crate::gateway::GatewayConfig;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;
    use std::time::Duration;

    // The upstream is unreachable here, so the trigger must settle on the
    // "deployment not confirmed" path and emit a warning log frame.
    #[tokio::test]
    async fn unconfirmed_deployment_emits_skip_warning() {
        let config = GatewayConfig::new("http://127.0.0.1:1".to_string())
            .with_settle_delay(Duration::ZERO)
            .with_status_polling(1, Duration::ZERO);
        let state = Arc::new(GatewayState::new(config).unwrap());
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .expect("lazy pool");
        let sink = AtomicMetricsSink::new();
        let (tx, mut rx) = mpsc::channel(8);

        run_completion(&state, &pool, &sink, "job-1", &tx).await;
        drop(tx);

        let event = rx.recv().await.expect("skip warning");
        assert_eq!(event.event, "log");
        assert_eq!(event.data["level"], "warn");
        assert!(rx.recv().await.is_none());
        assert!(sink.snapshot().get(metrics::VERIFICATIONS_TRIGGERED).is_none());
    }
}
