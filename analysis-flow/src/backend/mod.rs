//! Execution backend: one per domain, choosing between the remote service and
//! the local analysis engine based on live health state.

pub mod remote;
pub mod subprocess;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::Domain;
use crate::error::{FailureKind, FlowError, Result};
use crate::health::{HealthMonitor, HealthState, ProbePolicy};
use crate::normalize::normalize;
use crate::request::AnalysisRequest;
use crate::result::{AnalysisResult, ExecutionPath};

pub use remote::HttpRemote;
pub use subprocess::{EngineCommand, EngineProcess};

/// Network request/response against a domain microservice.
#[async_trait]
pub trait RemoteStrategy: Send + Sync {
    /// Cheap reachability check used by the health monitor.
    async fn probe(&self) -> Result<()>;

    /// Raw, not yet normalized, payload for one operation.
    ///
    /// Connectivity failures must surface as [`FlowError::BackendUnavailable`].
    async fn call(&self, request: &AnalysisRequest) -> Result<Value>;

    /// Whether the service exposes a native comprehensive endpoint.
    fn supports_composite(&self) -> bool;
}

/// Launch of the external analysis engine.
#[async_trait]
pub trait SubprocessStrategy: Send + Sync {
    /// Parsed standard output of one engine run.
    async fn run(&self, request: &AnalysisRequest) -> Result<Value>;
}

/// What happened when the remote strategy was tried.
#[derive(Debug)]
pub enum RemoteOutcome {
    /// Normalized payload.
    Payload(Value),
    /// Remote answered but the call failed; no fallback.
    Failed(AnalysisResult),
    /// Remote not usable for this call; fall through to the engine.
    Unavailable,
}

pub struct ExecutionBackend {
    domain: Domain,
    remote: Option<Arc<dyn RemoteStrategy>>,
    subprocess: Option<Arc<dyn SubprocessStrategy>>,
    health: HealthMonitor,
}

impl ExecutionBackend {
    pub fn new(
        domain: Domain,
        remote: Option<Arc<dyn RemoteStrategy>>,
        subprocess: Option<Arc<dyn SubprocessStrategy>>,
        policy: ProbePolicy,
    ) -> Self {
        let health = HealthMonitor::new(domain, policy);
        if remote.is_none() {
            health.demote("remote service disabled");
        }
        Self {
            domain,
            remote,
            subprocess,
            health,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn supports_composite(&self) -> bool {
        self.remote
            .as_ref()
            .is_some_and(|remote| remote.supports_composite())
    }

    /// Probe if nobody has yet; concurrent callers share one probe.
    pub async fn ensure_health(&self) -> HealthState {
        match &self.remote {
            Some(remote) => self.health.ensure_checked(|| remote.probe()).await,
            None => self.health.state(),
        }
    }

    /// Explicit re-check; the only way back from `unavailable`.
    pub async fn recheck(&self) -> HealthState {
        if self.remote.is_none() {
            return self.health.state();
        }
        self.health.reset();
        self.ensure_health().await
    }

    /// Run one operation. Never fails: every failure becomes an error result.
    pub async fn execute(&self, request: &AnalysisRequest) -> AnalysisResult {
        if self.ensure_health().await == HealthState::Available {
            match self.try_remote(request).await {
                RemoteOutcome::Payload(payload) => {
                    return interpret(payload, ExecutionPath::Remote);
                }
                RemoteOutcome::Failed(result) => return result,
                RemoteOutcome::Unavailable => {}
            }
        }
        self.run_subprocess(request).await
    }

    /// Attempt the remote strategy only, demoting health on connectivity failure.
    pub async fn try_remote(&self, request: &AnalysisRequest) -> RemoteOutcome {
        let Some(remote) = &self.remote else {
            return RemoteOutcome::Unavailable;
        };
        if self.health.state() != HealthState::Available {
            return RemoteOutcome::Unavailable;
        }

        let started = Instant::now();
        let outcome = remote.call(request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(payload) => {
                info!(
                    domain = %self.domain,
                    operation = %request.operation(),
                    gene = request.gene(),
                    duration_ms,
                    "Remote analysis completed"
                );
                RemoteOutcome::Payload(normalize(payload))
            }
            Err(FlowError::BackendUnavailable(reason)) => {
                self.health.demote(reason);
                RemoteOutcome::Unavailable
            }
            Err(FlowError::Remote { status: 404, .. }) => {
                debug!(
                    domain = %self.domain,
                    operation = %request.operation(),
                    "Operation not served remotely, using analysis engine"
                );
                RemoteOutcome::Unavailable
            }
            Err(e) => {
                warn!(
                    domain = %self.domain,
                    operation = %request.operation(),
                    duration_ms,
                    error = %e,
                    "Remote analysis failed"
                );
                RemoteOutcome::Failed(AnalysisResult::from_error(&e).executed_by(ExecutionPath::Remote))
            }
        }
    }

    async fn run_subprocess(&self, request: &AnalysisRequest) -> AnalysisResult {
        let Some(engine) = &self.subprocess else {
            return AnalysisResult::error(
                FailureKind::BackendUnavailable,
                format!(
                    "{} analysis is unavailable: remote service unreachable and no local engine configured",
                    self.domain
                ),
            );
        };

        let started = Instant::now();
        let outcome = engine.run(request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(payload) => {
                info!(
                    domain = %self.domain,
                    operation = %request.operation(),
                    gene = request.gene(),
                    duration_ms,
                    "Engine analysis completed"
                );
                interpret(normalize(payload), ExecutionPath::Subprocess)
            }
            Err(e) => {
                warn!(
                    domain = %self.domain,
                    operation = %request.operation(),
                    duration_ms,
                    error = %e,
                    "Engine analysis failed"
                );
                AnalysisResult::from_error(&e).executed_by(ExecutionPath::Subprocess)
            }
        }
    }
}

fn interpret(payload: Value, path: ExecutionPath) -> AnalysisResult {
    match AnalysisResult::from_payload(payload) {
        Ok(result) => result.executed_by(path),
        Err(e) => AnalysisResult::from_error(&e).executed_by(path),
    }
}

/// In-memory strategies shared by the unit tests of several modules.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::domain::Operation;
    use dashmap::DashMap;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub fn fast_policy() -> ProbePolicy {
        ProbePolicy {
            timeout: Duration::from_millis(200),
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn rows(gene: &str, op: Operation) -> Value {
        json!({
            "status": ["success"],
            "message": [format!("{op} for {gene}")],
            "data": [{"site": "Y703", "gene": gene}, {"site": "S821", "gene": gene}]
        })
    }

    #[derive(Default)]
    pub struct MockRemote {
        pub healthy: bool,
        pub refuse_calls: bool,
        pub composite: bool,
        pub probes: AtomicUsize,
        pub calls: DashMap<Operation, usize>,
    }

    impl MockRemote {
        pub fn healthy() -> Self {
            Self {
                healthy: true,
                ..Default::default()
            }
        }

        pub fn calls(&self, op: Operation) -> usize {
            self.calls.get(&op).map(|c| *c).unwrap_or(0)
        }

        pub fn total_calls(&self) -> usize {
            self.calls.iter().map(|entry| *entry.value()).sum()
        }
    }

    #[async_trait]
    impl RemoteStrategy for MockRemote {
        async fn probe(&self) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.healthy {
                Ok(())
            } else {
                Err(FlowError::BackendUnavailable("connection refused".to_string()))
            }
        }

        async fn call(&self, request: &AnalysisRequest) -> Result<Value> {
            *self.calls.entry(request.operation()).or_insert(0) += 1;
            if self.refuse_calls {
                return Err(FlowError::BackendUnavailable("connection refused".to_string()));
            }
            Ok(rows(request.gene(), request.operation()))
        }

        fn supports_composite(&self) -> bool {
            self.composite
        }
    }

    /// Engine answering from a closure, counting runs per operation.
    pub struct MockEngine {
        pub runs: DashMap<Operation, usize>,
        pub seen: DashMap<Operation, AnalysisRequest>,
        respond: Box<dyn Fn(&AnalysisRequest) -> Result<Value> + Send + Sync>,
    }

    impl MockEngine {
        pub fn new(respond: impl Fn(&AnalysisRequest) -> Result<Value> + Send + Sync + 'static) -> Self {
            Self {
                runs: DashMap::new(),
                seen: DashMap::new(),
                respond: Box::new(respond),
            }
        }

        pub fn succeeding() -> Self {
            Self::new(|req| Ok(rows(req.gene(), req.operation())))
        }

        pub fn runs(&self, op: Operation) -> usize {
            self.runs.get(&op).map(|c| *c).unwrap_or(0)
        }

        pub fn total_runs(&self) -> usize {
            self.runs.iter().map(|entry| *entry.value()).sum()
        }
    }

    #[async_trait]
    impl SubprocessStrategy for MockEngine {
        async fn run(&self, request: &AnalysisRequest) -> Result<Value> {
            *self.runs.entry(request.operation()).or_insert(0) += 1;
            self.seen.insert(request.operation(), request.clone());
            (self.respond)(request)
        }
    }
}
