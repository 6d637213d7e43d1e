//! Real-time job event gateway.
//!
//! Bridges the upstream job service's SSE log stream and builder WebSocket
//! into client-facing connections, with bounded reconnects, heartbeats,
//! backpressure, and an exactly-once post-deployment verification trigger.

pub mod flavor;
pub mod frames;
pub mod sse;
pub mod upstream;
pub mod verify;
pub mod ws;

use anyhow::Result;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use self::upstream::JobServiceClient;

const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_STEP_MS: u64 = 300;
const DEFAULT_SSE_PING_SECONDS: u64 = 15;
const DEFAULT_UPSTREAM_PING_SECONDS: u64 = 25;
const DEFAULT_CLIENT_HEARTBEAT_SECONDS: u64 = 30;
const DEFAULT_PENDING_MAX_MESSAGES: usize = 200;
const DEFAULT_PENDING_MAX_BYTES: usize = 1_000_000;
const DEFAULT_SETTLE_DELAY_SECONDS: u64 = 3;
const DEFAULT_STATUS_POLL_ATTEMPTS: u32 = 3;
const DEFAULT_STATUS_POLL_DELAY_SECONDS: u64 = 2;

/// One event bound for a client, transport-agnostic. The SSE relay renders
/// it as an `event:`/`data:` frame; the WebSocket paths as a JSON message.
#[derive(Debug, Clone)]
pub struct OutEvent {
    pub event: String,
    pub data: Value,
}

impl OutEvent {
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    job_service_base_url: String,
    builder_base_url: Option<String>,
    reconnect_attempts: u32,
    backoff_step: Duration,
    sse_ping_interval: Duration,
    upstream_ping_interval: Duration,
    client_heartbeat_interval: Duration,
    pending_max_messages: usize,
    pending_max_bytes: usize,
    settle_delay: Duration,
    status_poll_attempts: u32,
    status_poll_delay: Duration,
}

impl GatewayConfig {
    #[must_use]
    pub fn new(job_service_base_url: String) -> Self {
        Self {
            job_service_base_url,
            builder_base_url: None,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            backoff_step: Duration::from_millis(DEFAULT_BACKOFF_STEP_MS),
            sse_ping_interval: Duration::from_secs(DEFAULT_SSE_PING_SECONDS),
            upstream_ping_interval: Duration::from_secs(DEFAULT_UPSTREAM_PING_SECONDS),
            client_heartbeat_interval: Duration::from_secs(DEFAULT_CLIENT_HEARTBEAT_SECONDS),
            pending_max_messages: DEFAULT_PENDING_MAX_MESSAGES,
            pending_max_bytes: DEFAULT_PENDING_MAX_BYTES,
            settle_delay: Duration::from_secs(DEFAULT_SETTLE_DELAY_SECONDS),
            status_poll_attempts: DEFAULT_STATUS_POLL_ATTEMPTS,
            status_poll_delay: Duration::from_secs(DEFAULT_STATUS_POLL_DELAY_SECONDS),
        }
    }

    #[must_use]
    pub fn with_builder_base_url(mut self, url: Option<String>) -> Self {
        self.builder_base_url = url;
        self
    }

    #[must_use]
    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step = step;
        self
    }

    #[must_use]
    pub fn with_sse_ping_interval(mut self, interval: Duration) -> Self {
        self.sse_ping_interval = interval;
        self
    }

    #[must_use]
    pub fn with_pending_limits(mut self, max_messages: usize, max_bytes: usize) -> Self {
        self.pending_max_messages = max_messages;
        self.pending_max_bytes = max_bytes;
        self
    }

    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    #[must_use]
    pub fn with_status_polling(mut self, attempts: u32, delay: Duration) -> Self {
        self.status_poll_attempts = attempts;
        self.status_poll_delay = delay;
        self
    }

    #[must_use]
    pub fn job_service_base_url(&self) -> &str {
        &self.job_service_base_url
    }

    #[must_use]
    pub fn builder_base_url(&self) -> Option<&str> {
        self.builder_base_url.as_deref()
    }

    pub(crate) fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub(crate) fn backoff_step(&self) -> Duration {
        self.backoff_step
    }

    pub(crate) fn sse_ping_interval(&self) -> Duration {
        self.sse_ping_interval
    }

    pub(crate) fn upstream_ping_interval(&self) -> Duration {
        self.upstream_ping_interval
    }

    pub(crate) fn client_heartbeat_interval(&self) -> Duration {
        self.client_heartbeat_interval
    }

    pub(crate) fn pending_max_messages(&self) -> usize {
        self.pending_max_messages
    }

    pub(crate) fn pending_max_bytes(&self) -> usize {
        self.pending_max_bytes
    }

    pub(crate) fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    pub(crate) fn status_poll_attempts(&self) -> u32 {
        self.status_poll_attempts
    }

    pub(crate) fn status_poll_delay(&self) -> Duration {
        self.status_poll_delay
    }
}

pub struct GatewayState {
    config: GatewayConfig,
    client: JobServiceClient,
    /// Job ids whose post-`end` verification already fired in this process.
    /// A reconnect that replays `end` for a finished job must not re-verify.
    fired_verifications: Mutex<HashSet<String>>,
}

impl GatewayState {
    /// # Errors
    /// Returns an error if the upstream HTTP client fails to build.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = JobServiceClient::new(config.job_service_base_url())?;
        Ok(Self {
            config,
            client,
            fired_verifications: Mutex::new(HashSet::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn client(&self) -> &JobServiceClient {
        &self.client
    }

    /// Claim the verification trigger for a job. Returns true exactly once
    /// per job id per process.
    pub(crate) fn claim_verification(&self, job_id: &str) -> bool {
        self.fired_verifications
            .lock()
            .map(|mut fired| fired.insert(job_id.to_string()))
            .unwrap_or(false)
    }
}
