use futures_util::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::backend::{ExecutionBackend, RemoteOutcome};
use crate::domain::{Domain, DomainProfile, Operation};
use crate::error::{FlowError, Result};
use crate::health::{BackendHealth, HealthState};
use crate::request::{AnalysisParams, AnalysisRequest};
use crate::result::{AnalysisResult, CompositeResult, ExecutionPath};

/// Domain-level analysis operations on top of one [`ExecutionBackend`].
pub struct AnalysisService {
    profile: &'static DomainProfile,
    backend: ExecutionBackend,
}

impl AnalysisService {
    pub fn new(backend: ExecutionBackend) -> Self {
        Self {
            profile: backend.domain().profile(),
            backend,
        }
    }

    pub fn domain(&self) -> Domain {
        self.profile.domain
    }

    pub fn profile(&self) -> &'static DomainProfile {
        self.profile
    }

    pub fn health(&self) -> BackendHealth {
        self.backend.health().snapshot()
    }

    pub async fn recheck_health(&self) -> BackendHealth {
        self.backend.recheck().await;
        self.health()
    }

    /// Build a request this domain can serve; nothing reaches the backend otherwise.
    pub fn validate(
        &self,
        operation: Operation,
        gene: &str,
        params: AnalysisParams,
    ) -> Result<AnalysisRequest> {
        if !self.profile.supports(operation) {
            return Err(FlowError::validation(format!(
                "{} analysis does not support '{}'",
                self.domain(),
                operation
            )));
        }
        AnalysisRequest::new(self.domain(), operation, gene, params)
    }

    pub async fn query(&self, gene: &str, params: AnalysisParams) -> AnalysisResult {
        self.validated_single(Operation::Query, gene, params).await
    }

    pub async fn grouped_comparison(&self, gene: &str, params: AnalysisParams) -> AnalysisResult {
        self.validated_single(Operation::GroupedComparison, gene, params)
            .await
    }

    pub async fn survival(&self, gene: &str, params: AnalysisParams) -> AnalysisResult {
        self.validated_single(Operation::Survival, gene, params).await
    }

    pub async fn correlation(&self, gene: &str, params: AnalysisParams) -> AnalysisResult {
        self.validated_single(Operation::Correlation, gene, params)
            .await
    }

    pub async fn enrichment(&self, gene: &str, params: AnalysisParams) -> AnalysisResult {
        self.validated_single(Operation::Enrichment, gene, params)
            .await
    }

    async fn validated_single(
        &self,
        operation: Operation,
        gene: &str,
        params: AnalysisParams,
    ) -> AnalysisResult {
        match self.validate(operation, gene, params) {
            Ok(request) => self.execute_single_analysis(&request).await,
            Err(e) => AnalysisResult::from_error(&e),
        }
    }

    /// Run one non-composite operation.
    ///
    /// A missing parameter the operation cannot do without (a phospho site, say)
    /// is discovered through the domain's prerequisite lookup first.
    pub async fn execute_single_analysis(&self, request: &AnalysisRequest) -> AnalysisResult {
        if request.operation() == Operation::Comprehensive {
            return AnalysisResult::from_error(&FlowError::validation(
                "comprehensive analysis cannot run as a single analysis",
            ));
        }
        if request.domain() != self.domain() || !self.profile.supports(request.operation()) {
            return AnalysisResult::from_error(&FlowError::validation(format!(
                "{} analysis does not support {} {}",
                self.domain(),
                request.domain(),
                request.operation()
            )));
        }

        let request = match self.profile.requires_discovery(request.operation()) {
            Some(discovery) if request.params().get(discovery.param).is_none() => {
                let lookup = self
                    .backend
                    .execute(&request.for_operation(self.profile.prerequisite))
                    .await;
                match self.discovered_value(&lookup) {
                    Some(value) => match request.with_default(discovery.param, &value) {
                        Ok(filled) => filled,
                        Err(e) => return AnalysisResult::from_error(&e),
                    },
                    None => return self.skipped(request),
                }
            }
            _ => request.clone(),
        };

        self.backend.execute(&request).await
    }

    /// Fan out every operation of the domain for one gene.
    ///
    /// Uses the remote composite endpoint when healthy and offered. Otherwise the
    /// prerequisite lookup runs first, then all dependent operations run
    /// concurrently; a failing operation never cancels its siblings.
    pub async fn comprehensive(&self, gene: &str, params: AnalysisParams) -> CompositeResult {
        let base = match self.validate(Operation::Comprehensive, gene, params) {
            Ok(request) => request,
            Err(e) => return CompositeResult::rejected(self.domain(), gene, &e),
        };

        if self.backend.supports_composite()
            && self.backend.ensure_health().await == HealthState::Available
        {
            match self.backend.try_remote(&base).await {
                RemoteOutcome::Payload(payload) => return self.composite_from_payload(&base, payload),
                RemoteOutcome::Failed(result) => warn!(
                    domain = %self.domain(),
                    gene = base.gene(),
                    error = %result.message,
                    "Remote comprehensive analysis failed, running operations individually"
                ),
                RemoteOutcome::Unavailable => {}
            }
        }

        self.run_plan(&base).await
    }

    async fn run_plan(&self, base: &AnalysisRequest) -> CompositeResult {
        let prerequisite = self.profile.prerequisite;
        let lookup = self.backend.execute(&base.for_operation(prerequisite)).await;
        let discovered = self.discovered_value(&lookup);

        let dependents = self
            .profile
            .dependent_operations()
            .map(|op| {
                let discovered = discovered.as_deref();
                async move { (op, self.run_dependent(base, op, discovered).await) }
            })
            .collect::<Vec<_>>();
        let outcomes = join_all(dependents).await;

        let mut results = BTreeMap::new();
        results.insert(prerequisite.to_string(), lookup);
        for (op, result) in outcomes {
            results.insert(op.to_string(), result);
        }

        let composite = CompositeResult::from_results(self.domain(), base.gene(), results);
        info!(
            domain = %self.domain(),
            gene = base.gene(),
            total = composite.summary.total,
            successful = composite.summary.successful,
            warnings = composite.summary.warnings,
            failed = composite.summary.failed,
            "Comprehensive analysis finished"
        );
        composite
    }

    async fn run_dependent(
        &self,
        base: &AnalysisRequest,
        operation: Operation,
        discovered: Option<&str>,
    ) -> AnalysisResult {
        let mut request = base.for_operation(operation);
        if let (Some(discovery), Some(value)) = (&self.profile.discovery, discovered) {
            match request.with_default(discovery.param, value) {
                Ok(filled) => request = filled,
                Err(e) => return AnalysisResult::from_error(&e),
            }
        }
        if let Some(discovery) = self.profile.requires_discovery(operation) {
            if request.params().get(discovery.param).is_none() {
                return self.skipped(&request);
            }
        }
        self.backend.execute(&request).await
    }

    /// First usable value of the discovery field in the lookup's records.
    fn discovered_value(&self, lookup: &AnalysisResult) -> Option<String> {
        let discovery = self.profile.discovery.as_ref()?;
        lookup.data.iter().find_map(|row| match row.get(discovery.field)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    fn skipped(&self, request: &AnalysisRequest) -> AnalysisResult {
        let param = self
            .profile
            .discovery
            .as_ref()
            .map(|d| d.param.as_str())
            .unwrap_or("parameter");
        AnalysisResult::warning(format!(
            "{} skipped: no {} available for {}",
            request.operation(),
            param,
            request.gene()
        ))
    }

    fn composite_from_payload(&self, base: &AnalysisRequest, payload: Value) -> CompositeResult {
        let results = match payload {
            Value::Object(mut fields) => match fields.remove("results") {
                Some(Value::Object(per_operation)) => per_operation
                    .into_iter()
                    .map(|(name, value)| (name, remote_result(value)))
                    .collect(),
                _ => BTreeMap::from([(
                    Operation::Comprehensive.to_string(),
                    remote_result(Value::Object(fields)),
                )]),
            },
            other => BTreeMap::from([(Operation::Comprehensive.to_string(), remote_result(other))]),
        };
        CompositeResult::from_results(self.domain(), base.gene(), results)
    }
}

fn remote_result(value: Value) -> AnalysisResult {
    match AnalysisResult::from_payload(value) {
        Ok(result) => result.executed_by(ExecutionPath::Remote),
        Err(e) => AnalysisResult::from_error(&e).executed_by(ExecutionPath::Remote),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::*;
    use crate::error::FailureKind;
    use crate::result::ResultStatus;
    use serde_json::json;
    use std::sync::Arc;

    fn service(remote: Option<Arc<MockRemote>>, engine: Arc<MockEngine>) -> AnalysisService {
        service_for(Domain::Phospho, remote, engine)
    }

    fn service_for(
        domain: Domain,
        remote: Option<Arc<MockRemote>>,
        engine: Arc<MockEngine>,
    ) -> AnalysisService {
        let remote = remote.map(|r| r as Arc<dyn crate::backend::RemoteStrategy>);
        AnalysisService::new(ExecutionBackend::new(domain, remote, Some(engine), fast_policy()))
    }

    #[tokio::test]
    async fn query_through_healthy_remote() {
        let remote = Arc::new(MockRemote::healthy());
        let engine = Arc::new(MockEngine::succeeding());
        let svc = service(Some(remote.clone()), engine.clone());

        let result = svc.query("KIT", AnalysisParams::default()).await;

        assert_eq!(result.status, ResultStatus::Success);
        assert!(!result.data.is_empty());
        assert_eq!(svc.health().state, HealthState::Available);
        assert_eq!(engine.total_runs(), 0);
    }

    #[tokio::test]
    async fn comprehensive_falls_back_after_refused_composite() {
        let remote = Arc::new(MockRemote {
            healthy: true,
            refuse_calls: true,
            composite: true,
            ..Default::default()
        });
        let engine = Arc::new(MockEngine::succeeding());
        let svc = service(Some(remote.clone()), engine.clone());

        let composite = svc.comprehensive("KIT", AnalysisParams::default()).await;

        assert_eq!(svc.health().state, HealthState::Unavailable);
        assert_eq!(remote.calls(Operation::Comprehensive), 1);
        assert_eq!(remote.total_calls(), 1);
        assert_eq!(engine.total_runs(), 4);
        assert_eq!(composite.summary.total, 4);
        assert_eq!(composite.summary.successful, composite.summary.total);
        assert_eq!(composite.status, ResultStatus::Success);
        assert!(
            composite
                .results
                .values()
                .all(|r| r.executed_by == Some(ExecutionPath::Subprocess))
        );
    }

    #[tokio::test]
    async fn comprehensive_uses_native_endpoint_when_healthy() {
        struct CompositeRemote;

        #[async_trait::async_trait]
        impl crate::backend::RemoteStrategy for CompositeRemote {
            async fn probe(&self) -> Result<()> {
                Ok(())
            }
            async fn call(&self, _request: &AnalysisRequest) -> Result<Value> {
                Ok(json!({
                    "results": {
                        "query": {"status": ["success"], "data": [{"site": "Y703"}]},
                        "survival": {"status": ["error"], "message": ["too few samples"]}
                    }
                }))
            }
            fn supports_composite(&self) -> bool {
                true
            }
        }

        let engine = Arc::new(MockEngine::succeeding());
        let backend = ExecutionBackend::new(
            Domain::Phospho,
            Some(Arc::new(CompositeRemote)),
            Some(engine.clone()),
            fast_policy(),
        );
        let svc = AnalysisService::new(backend);

        let composite = svc.comprehensive("KIT", AnalysisParams::default()).await;
        assert_eq!(engine.total_runs(), 0);
        assert_eq!(composite.summary.total, 2);
        assert_eq!(composite.summary.failed, 1);
        assert_eq!(composite.status, ResultStatus::Warning);
        assert_eq!(composite.results["survival"].message, "too few samples");
    }

    #[tokio::test]
    async fn discovered_site_feeds_dependent_operations() {
        let engine = Arc::new(MockEngine::succeeding());
        let svc = service(None, engine.clone());

        svc.comprehensive("KIT", AnalysisParams::default()).await;

        let survival = engine.seen.get(&Operation::Survival).unwrap();
        assert_eq!(survival.params().site.as_deref(), Some("Y703"));
        let query = engine.seen.get(&Operation::Query).unwrap();
        assert!(query.params().site.is_none());
    }

    #[tokio::test]
    async fn partial_failures_are_counted() {
        let engine = Arc::new(MockEngine::new(|req| match req.operation() {
            Operation::Survival => Err(FlowError::Process {
                message: "exit status 1".to_string(),
                stderr: "not enough events".to_string(),
            }),
            Operation::Correlation => Ok(json!({"status": ["warning"], "message": ["n < 10"]})),
            op => Ok(rows(req.gene(), op)),
        }));
        let svc = service(None, engine);

        let composite = svc.comprehensive("KIT", AnalysisParams::default()).await;
        let s = composite.summary;
        assert_eq!((s.total, s.successful, s.warnings, s.failed), (4, 2, 1, 1));
        assert_eq!(composite.status, ResultStatus::Warning);
        assert_eq!(
            composite.results["survival"].diagnostics.as_deref(),
            Some("not enough events")
        );
    }

    #[tokio::test]
    async fn everything_failing_is_an_error() {
        let engine = Arc::new(MockEngine::new(|_| {
            Err(FlowError::malformed("not JSON", "Segmentation fault"))
        }));
        let svc = service(None, engine);

        let composite = svc.comprehensive("KIT", AnalysisParams::default()).await;
        assert_eq!(composite.status, ResultStatus::Error);
        assert_eq!(composite.summary.successful, 0);
        // Site-dependent operations are skipped, not failed.
        assert_eq!(composite.summary.warnings, 2);
        assert_eq!(composite.summary.failed, 2);
    }

    #[tokio::test]
    async fn invalid_gene_never_reaches_backend() {
        let remote = Arc::new(MockRemote::healthy());
        let engine = Arc::new(MockEngine::succeeding());
        let svc = service(Some(remote.clone()), engine.clone());

        let single = svc.query("KIT; DROP", AnalysisParams::default()).await;
        assert_eq!(single.error_kind, Some(FailureKind::Validation));

        let composite = svc.comprehensive("KIT; DROP", AnalysisParams::default()).await;
        assert_eq!(composite.status, ResultStatus::Error);
        assert_eq!(composite.error_kind, Some(FailureKind::Validation));
        assert!(composite.results.is_empty());

        assert_eq!(remote.probes.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(remote.total_calls(), 0);
        assert_eq!(engine.total_runs(), 0);
    }

    #[tokio::test]
    async fn single_analysis_rejects_composite_and_unsupported() {
        let engine = Arc::new(MockEngine::succeeding());
        let svc = service_for(Domain::SingleCell, None, engine.clone());

        let request = AnalysisRequest::new(
            Domain::SingleCell,
            Operation::Comprehensive,
            "CD4",
            AnalysisParams::default(),
        )
        .unwrap();
        let result = svc.execute_single_analysis(&request).await;
        assert_eq!(result.error_kind, Some(FailureKind::Validation));

        let survival = svc.survival("CD4", AnalysisParams::default()).await;
        assert_eq!(survival.error_kind, Some(FailureKind::Validation));
        assert_eq!(engine.total_runs(), 0);
    }

    #[tokio::test]
    async fn single_survival_discovers_missing_site() {
        let engine = Arc::new(MockEngine::succeeding());
        let svc = service(None, engine.clone());

        let result = svc.survival("KIT", AnalysisParams::default()).await;
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(engine.runs(Operation::Query), 1);
        let seen = engine.seen.get(&Operation::Survival).unwrap();
        assert_eq!(seen.params().site.as_deref(), Some("Y703"));
    }

    #[tokio::test]
    async fn no_site_means_skipped() {
        let engine = Arc::new(MockEngine::new(|req| match req.operation() {
            Operation::Query => Ok(json!({"status": ["success"], "data": []})),
            op => Ok(rows(req.gene(), op)),
        }));
        let svc = service(None, engine.clone());

        let result = svc.survival("ORPHAN1", AnalysisParams::default()).await;
        assert_eq!(result.status, ResultStatus::Warning);
        assert!(result.message.contains("no site"));
        assert_eq!(engine.runs(Operation::Survival), 0);
    }
}
