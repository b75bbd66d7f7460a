use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::Domain;
use crate::error::{FailureKind, FlowError};
use crate::normalize::RECORD_FIELD;

/// Outcome status shared by single and composite results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Warning,
    Error,
}

impl ResultStatus {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" | "ok" => Some(ResultStatus::Success),
            "warning" | "warn" | "partial" => Some(ResultStatus::Warning),
            "error" | "failed" | "failure" => Some(ResultStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultStatus::Success => "success",
            ResultStatus::Warning => "warning",
            ResultStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Which strategy produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPath {
    Remote,
    Subprocess,
}

const PLOT_FIELDS: [&str; 3] = ["plot", "image", "plot_base64"];

/// Canonical result of one analysis operation. Present even on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub status: ResultStatus,
    #[serde(default)]
    pub message: String,
    /// Tabular payload, one JSON object per row.
    #[serde(default)]
    pub data: Vec<Value>,
    /// Encoded image, usually a base64 PNG.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<ExecutionPath>,
    /// Domain-specific fields such as test statistics.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnalysisResult {
    pub fn success(message: impl Into<String>, data: Vec<Value>) -> Self {
        Self::with_status(ResultStatus::Success, message, data)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::with_status(ResultStatus::Warning, message, Vec::new())
    }

    pub fn error(kind: FailureKind, message: impl Into<String>) -> Self {
        let mut result = Self::with_status(ResultStatus::Error, message, Vec::new());
        result.error_kind = Some(kind);
        result
    }

    fn with_status(status: ResultStatus, message: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            status,
            message: message.into(),
            data,
            plot: None,
            error_kind: None,
            diagnostics: None,
            executed_by: None,
            extra: Map::new(),
        }
    }

    pub fn from_error(err: &FlowError) -> Self {
        let mut result = Self::error(err.kind(), err.to_string());
        result.diagnostics = err.diagnostics().map(str::to_string);
        result
    }

    pub fn executed_by(mut self, path: ExecutionPath) -> Self {
        self.executed_by = Some(path);
        self
    }

    /// Build from an already normalized backend payload.
    pub fn from_payload(payload: Value) -> Result<Self, FlowError> {
        let Value::Object(mut fields) = payload else {
            return Err(FlowError::malformed(
                "expected a JSON object",
                truncate(&payload.to_string()),
            ));
        };

        let declared = fields
            .remove("status")
            .and_then(|s| s.as_str().and_then(ResultStatus::parse));
        let message = match fields.remove("message") {
            Some(Value::String(m)) => m,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let data = match fields.remove(RECORD_FIELD) {
            Some(Value::Array(rows)) => rows,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        };
        let plot = PLOT_FIELDS
            .iter()
            .find_map(|key| match fields.remove(*key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s),
                _ => None,
            });

        let status = declared.unwrap_or(if data.is_empty() && plot.is_none() {
            ResultStatus::Warning
        } else {
            ResultStatus::Success
        });
        let message = if message.is_empty() && status == ResultStatus::Warning {
            "No data returned".to_string()
        } else {
            message
        };

        Ok(Self {
            status,
            message,
            data,
            plot,
            error_kind: (status == ResultStatus::Error).then_some(FailureKind::Remote),
            diagnostics: None,
            executed_by: None,
            extra: fields,
        })
    }
}

fn truncate(raw: &str) -> String {
    const LIMIT: usize = 2_000;
    if raw.len() <= LIMIT {
        return raw.to_string();
    }
    let mut end = LIMIT;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}

/// Counts over the sub-results of a composite run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub successful: usize,
    pub warnings: usize,
    pub failed: usize,
}

/// Fan-out of several operations for one gene, merged with partial-failure accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeResult {
    pub domain: Domain,
    pub gene: String,
    pub status: ResultStatus,
    pub message: String,
    pub results: BTreeMap<String, AnalysisResult>,
    pub summary: Summary,
    /// Why a rejected composite never ran, or `partial_failure` when some
    /// but not all sub-analyses failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
}

impl CompositeResult {
    pub fn from_results(
        domain: Domain,
        gene: impl Into<String>,
        results: BTreeMap<String, AnalysisResult>,
    ) -> Self {
        let mut summary = Summary {
            total: results.len(),
            ..Summary::default()
        };
        let mut problems = Vec::new();
        for (name, result) in &results {
            match result.status {
                ResultStatus::Success => summary.successful += 1,
                ResultStatus::Warning => {
                    summary.warnings += 1;
                    problems.push(format!("{name} warned: {}", result.message));
                }
                ResultStatus::Error => {
                    summary.failed += 1;
                    problems.push(format!("{name} failed: {}", result.message));
                }
            }
        }

        let status = if summary.successful == 0 {
            ResultStatus::Error
        } else if summary.warnings + summary.failed > 0 {
            ResultStatus::Warning
        } else {
            ResultStatus::Success
        };
        let error_kind = match status {
            ResultStatus::Warning if summary.failed > 0 => Some(FailureKind::PartialFailure),
            _ => None,
        };

        let mut message = format!(
            "{} of {} analyses succeeded",
            summary.successful, summary.total
        );
        if !problems.is_empty() {
            message.push_str("; ");
            message.push_str(&problems.join("; "));
        }

        Self {
            domain,
            gene: gene.into(),
            status,
            message,
            results,
            summary,
            error_kind,
        }
    }

    /// Composite that never ran, e.g. rejected by validation.
    pub fn rejected(domain: Domain, gene: impl Into<String>, err: &FlowError) -> Self {
        Self {
            domain,
            gene: gene.into(),
            status: ResultStatus::Error,
            message: err.to_string(),
            results: BTreeMap::new(),
            summary: Summary::default(),
            error_kind: Some(err.kind()),
        }
    }
}
