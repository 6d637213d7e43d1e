//! Typed client for the upstream job-execution service.
//!
//! Each endpoint gets a concrete request/response shape; unknown fields are
//! preserved in a flattened catch-all map so upstream additions pass through
//! without breaking deserialization. The upstream sometimes wraps responses
//! in a `data` envelope; accessors look through it.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::api::error::ApiError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub enum UpstreamError {
    Timeout,
    Unreachable(String),
    Status(u16),
}

impl UpstreamError {
    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Unreachable(err.to_string())
        }
    }

    #[must_use]
    pub fn api_error(&self) -> ApiError {
        match self {
            Self::Timeout => ApiError::UpstreamTimeout,
            Self::Unreachable(_) | Self::Status(_) => ApiError::UpstreamUnreachable,
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "upstream timed out"),
            Self::Unreachable(reason) => write!(f, "upstream unreachable: {reason}"),
            Self::Status(code) => write!(f, "upstream returned status {code}"),
        }
    }
}

impl std::error::Error for UpstreamError {}

#[derive(Serialize, Debug, Clone)]
pub struct PipelineRequest {
    pub prompt: String,
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iters: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict_args: Option<bool>,
}

#[derive(Deserialize, Debug, Default)]
pub struct PipelineCreated {
    #[serde(default, alias = "jobId")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PipelineCreated {
    /// The job id, wherever the upstream chose to put it.
    #[must_use]
    pub fn resolved_job_id(&self) -> Option<String> {
        if let Some(job_id) = self.job_id.as_deref().or(self.id.as_deref()) {
            return Some(job_id.to_string());
        }
        self.data
            .as_ref()
            .and_then(|data| data.get("jobId").or_else(|| data.get("id")))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct JobResult {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default, alias = "fqName")]
    pub fq_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct JobDetail {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub data: Option<Box<JobDetail>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Deployment facts extracted from a job detail response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStatus {
    pub address: String,
    pub network: Option<String>,
    pub fq_name: Option<String>,
}

impl JobDetail {
    fn inner(&self) -> &Self {
        self.data.as_deref().unwrap_or(self)
    }

    #[must_use]
    pub fn job_state(&self) -> Option<&str> {
        self.inner()
            .state
            .as_deref()
            .or(self.state.as_deref())
    }

    #[must_use]
    pub fn deploy_address(&self) -> Option<&str> {
        self.inner()
            .result
            .as_ref()
            .and_then(|result| result.address.as_deref())
            .or_else(|| {
                self.result
                    .as_ref()
                    .and_then(|result| result.address.as_deref())
            })
    }

    #[must_use]
    pub fn deploy_network(&self) -> Option<&str> {
        let inner = self.inner();
        inner
            .result
            .as_ref()
            .and_then(|result| result.network.as_deref())
            .or(inner.network.as_deref())
            .or(self.network.as_deref())
    }

    #[must_use]
    pub fn deploy_fq_name(&self) -> Option<&str> {
        self.inner()
            .result
            .as_ref()
            .and_then(|result| result.fq_name.as_deref())
    }

    /// A job counts as deployed once it is in a terminal state with an
    /// address on record.
    #[must_use]
    pub fn deployment(&self) -> Option<DeploymentStatus> {
        let state = self.job_state()?;
        if state != "deployed" && state != "completed" {
            return None;
        }
        let address = self.deploy_address()?.to_string();
        Some(DeploymentStatus {
            address,
            network: self.deploy_network().map(str::to_string),
            fq_name: self.deploy_fq_name().map(str::to_string),
        })
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct VerifyRequest {
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub network: String,
    #[serde(rename = "fullyQualifiedName", skip_serializing_if = "Option::is_none")]
    pub fully_qualified_name: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct VerifyOutcome {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub verified: Option<bool>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VerifyOutcome {
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        match &self.error {
            Some(Value::String(message)) => Some(message.clone()),
            Some(value) => value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some(value.to_string())),
            None => None,
        }
    }
}

/// HTTP client for the upstream job service.
#[derive(Debug, Clone)]
pub struct JobServiceClient {
    base_url: String,
    http: Client,
}

impl JobServiceClient {
    /// # Errors
    /// Returns an error if the HTTP client fails to build.
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        // No total timeout here: the same client serves long-lived log
        // streams. JSON calls set a per-request timeout instead.
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(crate::APP_USER_AGENT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Cheap reachability probe for `/health`.
    pub async fn reachable(&self) -> bool {
        self.http
            .get(&self.base_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }

    /// Submit a generation pipeline job.
    ///
    /// # Errors
    /// Returns an [`UpstreamError`] on transport failure or non-2xx status.
    pub async fn submit_pipeline(
        &self,
        request: &PipelineRequest,
    ) -> Result<PipelineCreated, UpstreamError> {
        let url = format!("{}/api/ai/pipeline", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(request)
            .send()
            .await
            .map_err(|err| UpstreamError::from_reqwest(&err))?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|err| UpstreamError::from_reqwest(&err))
    }

    /// Fetch job state and deployment result.
    ///
    /// # Errors
    /// Returns an [`UpstreamError`] on transport failure or non-2xx status.
    pub async fn job_detail(&self, job_id: &str) -> Result<JobDetail, UpstreamError> {
        let url = format!("{}/api/job/{job_id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|err| UpstreamError::from_reqwest(&err))?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|err| UpstreamError::from_reqwest(&err))
    }

    /// Ask the upstream to verify a deployed contract from job artifacts.
    ///
    /// # Errors
    /// Returns an [`UpstreamError`] on transport failure.
    pub async fn verify_by_job(
        &self,
        request: &VerifyRequest,
    ) -> Result<VerifyOutcome, UpstreamError> {
        let url = format!("{}/api/verify/byJob", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(60))
            .json(request)
            .send()
            .await
            .map_err(|err| UpstreamError::from_reqwest(&err))?;
        // Verification failures come back in the body; only transport-level
        // problems are errors here.
        response
            .json()
            .await
            .map_err(|err| UpstreamError::from_reqwest(&err))
    }

    /// Open the upstream SSE log stream for a job.
    ///
    /// # Errors
    /// Returns an [`UpstreamError`] on transport failure or non-2xx status.
    pub async fn open_log_stream(
        &self,
        job_id: &str,
        query: Option<&str>,
    ) -> Result<reqwest::Response, UpstreamError> {
        let suffix = query
            .filter(|value| !value.is_empty())
            .map(|value| format!("?{value}"))
            .unwrap_or_default();
        let url = format!("{}/api/job/{job_id}/logs/stream{suffix}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| UpstreamError::from_reqwest(&err))?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

/// Rewrite an http(s) base URL into its ws(s) twin for the builder bridge.
#[must_use]
pub fn builder_ws_url(base_http: &str, path: &str) -> String {
    let base = base_http.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    format!("{ws_base}{path}")
}
