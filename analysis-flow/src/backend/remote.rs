use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::RemoteStrategy;
use crate::domain::{Domain, Operation};
use crate::error::{FlowError, Result};
use crate::request::AnalysisRequest;

/// HTTP client for one domain's analysis microservice.
///
/// Endpoints are `POST {base_url}/api/{domain}/{operation}` with a flat JSON
/// body, and `GET {base_url}/health` for probing.
pub struct HttpRemote {
    client: Client,
    domain: Domain,
    base_url: String,
    composite: bool,
    probe_timeout: Duration,
    /// Upper bound on the per-operation call budget.
    timeout_cap: Option<Duration>,
}

impl HttpRemote {
    pub fn new(domain: Domain, base_url: impl Into<String>, composite: bool) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| FlowError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            domain,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            composite,
            probe_timeout: Duration::from_secs(5),
            timeout_cap: None,
        })
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_timeout_cap(mut self, cap: Option<Duration>) -> Self {
        self.timeout_cap = cap;
        self
    }

    fn budget(&self, operation: Operation) -> Duration {
        let budget = operation.remote_timeout();
        self.timeout_cap.map_or(budget, |cap| cap.min(budget))
    }

    pub fn endpoint(&self, operation: Operation) -> String {
        format!(
            "{}/api/{}/{}",
            self.base_url,
            self.domain,
            operation.remote_path()
        )
    }

    fn classify(&self, err: reqwest::Error, what: String, budget: Duration) -> FlowError {
        if err.is_connect() {
            FlowError::BackendUnavailable(format!("{what}: {err}"))
        } else if err.is_timeout() {
            FlowError::Timeout {
                what,
                after: budget,
            }
        } else {
            FlowError::Remote {
                status: err.status().map(|s| s.as_u16()).unwrap_or(502),
                body: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl RemoteStrategy for HttpRemote {
    async fn probe(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| FlowError::BackendUnavailable(format!("{url}: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(FlowError::BackendUnavailable(format!(
                "{url} answered HTTP {}",
                response.status()
            )))
        }
    }

    async fn call(&self, request: &AnalysisRequest) -> Result<Value> {
        let operation = request.operation();
        let url = self.endpoint(operation);
        let budget = self.budget(operation);
        let what = format!("{} {} request", self.domain, operation);
        debug!(%url, gene = request.gene(), "Calling remote analysis service");

        let response = self
            .client
            .post(&url)
            .json(&request.to_body())
            .timeout(budget)
            .send()
            .await
            .map_err(|e| self.classify(e, what.clone(), budget))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.classify(e, what, budget))?;

        if !status.is_success() {
            return Err(FlowError::Remote {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            FlowError::malformed(format!("{url} returned invalid JSON: {e}"), body)
        })
    }

    fn supports_composite(&self) -> bool {
        self.composite
    }
}
