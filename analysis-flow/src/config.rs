use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::remote::HttpRemote;
use crate::backend::subprocess::{EngineCommand, EngineProcess};
use crate::backend::{ExecutionBackend, RemoteStrategy, SubprocessStrategy};
use crate::domain::Domain;
use crate::error::Result;
use crate::health::ProbePolicy;
use crate::llm::ModelConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::service::AnalysisService;
use crate::tools::{AnalysisTool, BackendStatusTool, ToolRegistry};

#[derive(Debug, Clone)]
pub struct DomainSettings {
    pub domain: Domain,
    pub remote_enabled: bool,
    pub base_url: String,
    pub composite_endpoint: bool,
}

impl DomainSettings {
    fn default_for(domain: Domain) -> Self {
        let port = match domain {
            Domain::Phospho => 8001,
            Domain::Transcriptome => 8002,
            Domain::SingleCell => 8003,
            Domain::Proteomics => 8004,
        };
        Self {
            domain,
            remote_enabled: true,
            base_url: format!("http://localhost:{port}"),
            composite_endpoint: true,
        }
    }
}

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub model: ModelConfig,
    pub orchestrator: OrchestratorConfig,
    pub domains: Vec<DomainSettings>,
    /// `None` disables the subprocess strategy.
    pub engine: Option<EngineCommand>,
    pub probe: ProbePolicy,
    /// Caps every remote call budget when set.
    pub remote_timeout_cap: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 3000,
            model: ModelConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            domains: Domain::ALL.iter().map(|d| DomainSettings::default_for(*d)).collect(),
            engine: Some(EngineCommand {
                program: PathBuf::from("Rscript"),
                args: vec!["analysis/engine.R".to_string()],
                working_dir: None,
                timeout: Duration::from_secs(60),
            }),
            probe: ProbePolicy::default(),
            remote_timeout_cap: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut settings = Settings::default();

        settings.port = parse_or(&get, "PORT", settings.port);

        settings.model.api_key = get("OPENROUTER_API_KEY");
        if let Some(url) = get("LLM_BASE_URL") {
            settings.model.base_url = url;
        }
        if let Some(model) = get("LLM_MODEL") {
            settings.model.model = model;
        }
        let llm_timeout = parse_or(&get, "LLM_TIMEOUT_SECS", settings.model.timeout.as_secs());
        settings.model.timeout = Duration::from_secs(llm_timeout);
        settings.orchestrator.model_timeout = settings.model.timeout;
        settings.orchestrator.max_turns =
            parse_or(&get, "MAX_TOOL_TURNS", settings.orchestrator.max_turns).max(1);

        for domain in &mut settings.domains {
            let prefix = domain.domain.env_prefix();
            domain.remote_enabled = flag_or(
                &get,
                &format!("{prefix}_SERVICE_ENABLED"),
                domain.remote_enabled,
            );
            if let Some(url) = get(&format!("{prefix}_SERVICE_URL")) {
                domain.base_url = url;
            }
            domain.composite_endpoint = flag_or(
                &get,
                &format!("{prefix}_COMPOSITE_ENDPOINT"),
                domain.composite_endpoint,
            );
        }

        // An explicitly empty ANALYSIS_ENGINE disables the subprocess strategy.
        let engine_disabled = lookup("ANALYSIS_ENGINE").is_some_and(|v| v.trim().is_empty());
        if engine_disabled {
            settings.engine = None;
        } else if let Some(engine) = settings.engine.as_mut() {
            if let Some(program) = get("ANALYSIS_ENGINE") {
                engine.program = PathBuf::from(program);
            }
            if let Some(args) = lookup("ANALYSIS_ENGINE_ARGS") {
                engine.args = args.split_whitespace().map(str::to_string).collect();
            }
            engine.working_dir = get("ANALYSIS_WORKDIR").map(PathBuf::from);
            let secs = parse_or(&get, "SUBPROCESS_TIMEOUT_SECS", engine.timeout.as_secs());
            engine.timeout = Duration::from_secs(secs);
        }

        let timeout = parse_or(&get, "HEALTH_TIMEOUT_SECS", settings.probe.timeout.as_secs());
        settings.probe.timeout = Duration::from_secs(timeout);
        settings.probe.attempts = parse_or(&get, "HEALTH_RETRIES", settings.probe.attempts).max(1);
        let backoff = parse_or(&get, "HEALTH_BACKOFF_MS", settings.probe.backoff.as_millis() as u64);
        settings.probe.backoff = Duration::from_millis(backoff);

        // 0 leaves the per-operation budgets alone.
        let cap = parse_or(&get, "REMOTE_TIMEOUT_CAP_SECS", 0u64);
        settings.remote_timeout_cap = (cap > 0).then(|| Duration::from_secs(cap));

        settings
    }

    /// One analysis service per domain, wired to its remote and the shared engine.
    pub fn build_services(&self) -> Result<Vec<Arc<AnalysisService>>> {
        let engine: Option<Arc<dyn SubprocessStrategy>> = self
            .engine
            .clone()
            .map(|command| Arc::new(EngineProcess::new(command)) as Arc<dyn SubprocessStrategy>);

        let mut services = Vec::with_capacity(self.domains.len());
        for domain in &self.domains {
            let remote: Option<Arc<dyn RemoteStrategy>> = if domain.remote_enabled {
                let client = HttpRemote::new(
                    domain.domain,
                    domain.base_url.clone(),
                    domain.composite_endpoint,
                )?
                .with_probe_timeout(self.probe.timeout)
                .with_timeout_cap(self.remote_timeout_cap);
                Some(Arc::new(client))
            } else {
                None
            };
            info!(
                domain = %domain.domain,
                remote = domain.remote_enabled,
                url = %domain.base_url,
                subprocess = engine.is_some(),
                "Configured analysis backend"
            );
            let backend =
                ExecutionBackend::new(domain.domain, remote, engine.clone(), self.probe.clone());
            services.push(Arc::new(AnalysisService::new(backend)));
        }
        Ok(services)
    }
}

/// Register one analysis tool per service plus `backend_status`.
pub fn build_registry(services: &[Arc<AnalysisService>]) -> ToolRegistry {
    let registry = ToolRegistry::new();
    for service in services {
        registry.register(Arc::new(AnalysisTool::new(service.clone())));
    }
    registry.register(Arc::new(BackendStatusTool::new(services.to_vec())));
    registry
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match get(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = %default, "Invalid numeric setting, using default");
            default
        }),
    }
}

fn flag_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => default,
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        Some(v) => {
            warn!(key, value = %v, default, "Invalid boolean setting, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(move |key| env.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let s = settings(&[]);
        assert_eq!(s.port, 3000);
        assert_eq!(s.orchestrator.max_turns, 6);
        assert_eq!(s.model.model, "openai/gpt-4.1-mini");
        assert_eq!(s.domains.len(), 4);
        assert_eq!(s.domains[2].base_url, "http://localhost:8003");
        assert_eq!(s.probe.attempts, 3);
        let engine = s.engine.unwrap();
        assert_eq!(engine.program, PathBuf::from("Rscript"));
        assert_eq!(engine.timeout, Duration::from_secs(60));
        assert!(s.remote_timeout_cap.is_none());
    }

    #[test]
    fn overrides_and_bad_numbers() {
        let s = settings(&[
            ("PORT", "8080"),
            ("MAX_TOOL_TURNS", "lots"),
            ("LLM_TIMEOUT_SECS", "30"),
            ("PHOSPHO_SERVICE_ENABLED", "false"),
            ("SINGLECELL_SERVICE_URL", "http://sc:9000/"),
            ("TRANSCRIPTOME_COMPOSITE_ENDPOINT", "0"),
            ("ANALYSIS_ENGINE", "python3"),
            ("ANALYSIS_ENGINE_ARGS", "engine.py  --quiet"),
            ("HEALTH_BACKOFF_MS", "50"),
            ("REMOTE_TIMEOUT_CAP_SECS", "45"),
        ]);
        assert_eq!(s.port, 8080);
        assert_eq!(s.orchestrator.max_turns, 6);
        assert_eq!(s.orchestrator.model_timeout, Duration::from_secs(30));
        assert!(!s.domains[0].remote_enabled);
        assert_eq!(s.domains[2].base_url, "http://sc:9000/");
        assert!(!s.domains[1].composite_endpoint);
        let engine = s.engine.unwrap();
        assert_eq!(engine.program, PathBuf::from("python3"));
        assert_eq!(engine.args, vec!["engine.py", "--quiet"]);
        assert_eq!(s.probe.backoff, Duration::from_millis(50));
        assert_eq!(s.remote_timeout_cap, Some(Duration::from_secs(45)));
    }

    #[test]
    fn empty_engine_disables_subprocess() {
        let s = settings(&[("ANALYSIS_ENGINE", "")]);
        assert!(s.engine.is_none());
    }

    #[tokio::test]
    async fn builds_a_service_and_tool_per_domain() {
        let s = settings(&[("PHOSPHO_SERVICE_ENABLED", "no")]);
        let services = s.build_services().unwrap();
        assert_eq!(services.len(), 4);

        let registry = build_registry(&services);
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "backend_status",
                "phospho_analysis",
                "proteomics_analysis",
                "singlecell_analysis",
                "transcriptome_analysis",
            ]
        );
    }
}
