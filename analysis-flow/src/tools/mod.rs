//! Tool registry: name → handler, with bounded per-tool call history.

pub mod analysis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::conversation::ToolCall;
use crate::domain::{Domain, Operation};
use crate::error::{FlowError, Result};
use crate::result::{AnalysisResult, CompositeResult, ResultStatus};

pub use analysis::{AnalysisTool, BackendStatusTool};

/// Most recent calls kept per tool.
pub const HISTORY_LIMIT: usize = 100;

/// Schema-described callable offered to the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

/// Analysis payload a tool produced, kept typed for merging.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisOutput {
    Single {
        domain: Domain,
        operation: Operation,
        gene: String,
        result: AnalysisResult,
    },
    Composite {
        result: CompositeResult,
    },
}

impl AnalysisOutput {
    pub fn domain(&self) -> Domain {
        match self {
            AnalysisOutput::Single { domain, .. } => *domain,
            AnalysisOutput::Composite { result } => result.domain,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// What gets recorded and, trimmed, echoed back to the model.
    pub content: Value,
    pub analysis: Option<AnalysisOutput>,
}

impl ToolOutput {
    pub fn json(content: Value) -> Self {
        Self {
            content,
            analysis: None,
        }
    }

    /// False when the analysis ran but came back with an error status.
    pub fn is_success(&self) -> bool {
        match &self.analysis {
            Some(AnalysisOutput::Single { result, .. }) => result.status != ResultStatus::Error,
            Some(AnalysisOutput::Composite { result }) => result.status != ResultStatus::Error,
            None => true,
        }
    }
}

/// Core trait every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    async fn call(&self, arguments: Value) -> Result<ToolOutput>;
}

/// One observed tool invocation. Observability only.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub arguments: Value,
    pub result: Value,
    pub success: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregates over a tool's retained history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolStats {
    pub calls: usize,
    pub failures: usize,
    pub avg_duration_ms: f64,
    pub last_called_at: Option<DateTime<Utc>>,
}

/// Result of one call in a batch.
#[derive(Debug)]
pub struct ToolOutcome {
    pub call_id: String,
    pub tool_name: String,
    pub record: ToolCallRecord,
    pub output: Result<ToolOutput>,
}

pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
    history: DashMap<String, VecDeque<ToolCallRecord>>,
    history_limit: usize,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_history_limit(HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            tools: DashMap::new(),
            history: DashMap::new(),
            history_limit: history_limit.max(1),
        }
    }

    pub fn register(&self, tool: Arc<dyn Tool>) -> &Self {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Tool registered twice, keeping the latest");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions sorted by name so prompts are stable.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<_> = self
            .tools
            .iter()
            .map(|entry| entry.value().definition())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Run one tool. Failures are recorded, then returned to the caller.
    pub async fn execute_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let (output, _) = self.invoke(name, arguments).await;
        output
    }

    /// Run every call concurrently; each outcome stands on its own.
    pub async fn execute_batch(&self, calls: Vec<ToolCall>) -> Vec<ToolOutcome> {
        let futures = calls.into_iter().map(|call| async move {
            let (output, record) = self.invoke(&call.name, call.arguments).await;
            ToolOutcome {
                call_id: call.id,
                tool_name: call.name,
                record,
                output,
            }
        });
        join_all(futures).await
    }

    async fn invoke(&self, name: &str, arguments: Value) -> (Result<ToolOutput>, ToolCallRecord) {
        let timestamp = Utc::now();
        let started = Instant::now();

        // Clone the handle out so no map guard is held across the await.
        let tool = self.tools.get(name).map(|entry| entry.value().clone());
        let Some(tool) = tool else {
            let err = FlowError::ToolNotFound(name.to_string());
            let record = ToolCallRecord {
                tool_name: name.to_string(),
                arguments,
                result: json!({ "error": err.to_string() }),
                success: false,
                duration_ms: 0,
                timestamp,
            };
            return (Err(err), record);
        };

        let output = tool.call(arguments.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let record = ToolCallRecord {
            tool_name: name.to_string(),
            arguments,
            result: match &output {
                Ok(out) => out.content.clone(),
                Err(e) => json!({ "error": e.to_string() }),
            },
            success: output.as_ref().is_ok_and(ToolOutput::is_success),
            duration_ms,
            timestamp,
        };
        match &output {
            Ok(_) if record.success => debug!(tool = %name, duration_ms, "Tool call succeeded"),
            Ok(_) => warn!(tool = %name, duration_ms, "Tool returned a failed analysis"),
            Err(e) => warn!(tool = %name, duration_ms, error = %e, "Tool call failed"),
        }
        self.append(record.clone());

        (output, record)
    }

    fn append(&self, record: ToolCallRecord) {
        let mut entries = self.history.entry(record.tool_name.clone()).or_default();
        entries.push_back(record);
        while entries.len() > self.history_limit {
            entries.pop_front();
        }
    }

    pub fn history(&self, name: &str) -> Vec<ToolCallRecord> {
        self.history
            .get(name)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> BTreeMap<String, ToolStats> {
        let mut stats: BTreeMap<String, ToolStats> = self
            .tools
            .iter()
            .map(|entry| (entry.key().clone(), ToolStats::default()))
            .collect();

        for entry in self.history.iter() {
            let records = entry.value();
            let total_ms: u64 = records.iter().map(|r| r.duration_ms).sum();
            let stat = stats.entry(entry.key().clone()).or_default();
            stat.calls = records.len();
            stat.failures = records.iter().filter(|r| !r.success).count();
            stat.avg_duration_ms = if records.is_empty() {
                0.0
            } else {
                total_ms as f64 / records.len() as f64
            };
            stat.last_called_at = records.back().map(|r| r.timestamp);
        }
        stats
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
