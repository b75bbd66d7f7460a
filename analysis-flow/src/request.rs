use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::LazyLock;

use crate::domain::{Domain, Operation, Param};
use crate::error::{FlowError, Result};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static identifier pattern"));

static DATASET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("static dataset pattern"));

/// Auxiliary parameters accompanying a gene.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Second gene for correlation analyses.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "gene2")]
    pub comparand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "analysis_type")]
    pub survival_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
}

impl AnalysisParams {
    pub fn get(&self, param: Param) -> Option<&str> {
        match param {
            Param::Site => self.site.as_deref(),
            Param::Dataset => self.dataset.as_deref(),
        }
    }

    pub fn with(mut self, param: Param, value: impl Into<String>) -> Self {
        match param {
            Param::Site => self.site = Some(value.into()),
            Param::Dataset => self.dataset = Some(value.into()),
        }
        self
    }

    fn validate(&self) -> Result<()> {
        check_identifier("site", self.site.as_deref())?;
        check_identifier("comparand gene", self.comparand.as_deref())?;
        check_identifier("survival type", self.survival_type.as_deref())?;

        if let Some(dataset) = self.dataset.as_deref() {
            if !DATASET.is_match(dataset) {
                return Err(FlowError::validation(format!(
                    "dataset '{dataset}' contains disallowed characters"
                )));
            }
        }

        if let Some(threshold) = self.threshold {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(FlowError::validation(format!(
                    "threshold must be a non-negative number, got {threshold}"
                )));
            }
        }
        Ok(())
    }
}

fn check_identifier(field: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(v) if !IDENTIFIER.is_match(v) => Err(FlowError::validation(format!(
            "{field} '{v}' must match [A-Za-z0-9_-]+"
        ))),
        _ => Ok(()),
    }
}

/// A validated, immutable request for one analysis operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRequest {
    domain: Domain,
    operation: Operation,
    gene: String,
    params: AnalysisParams,
}

impl AnalysisRequest {
    /// Validate and build a request. Nothing downstream re-checks these fields.
    pub fn new(
        domain: Domain,
        operation: Operation,
        gene: impl Into<String>,
        params: AnalysisParams,
    ) -> Result<Self> {
        let gene = gene.into().trim().to_string();
        if gene.is_empty() {
            return Err(FlowError::validation("gene is required"));
        }
        if !IDENTIFIER.is_match(&gene) {
            return Err(FlowError::validation(format!(
                "gene '{gene}' must match [A-Za-z0-9_-]+"
            )));
        }
        params.validate()?;

        Ok(Self {
            domain,
            operation,
            gene,
            params,
        })
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn gene(&self) -> &str {
        &self.gene
    }

    pub fn params(&self) -> &AnalysisParams {
        &self.params
    }

    /// Same gene and parameters, different operation.
    pub fn for_operation(&self, operation: Operation) -> Self {
        Self {
            operation,
            ..self.clone()
        }
    }

    /// Copy with a discovered parameter filled in, unless the caller already set it.
    pub fn with_default(&self, param: Param, value: &str) -> Result<Self> {
        if self.params.get(param).is_some() {
            return Ok(self.clone());
        }
        let params = self.params.clone().with(param, value);
        params.validate()?;
        Ok(Self {
            params,
            ..self.clone()
        })
    }

    /// Flat JSON body for the remote strategy.
    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("gene".to_string(), json!(self.gene));
        if let Value::Object(params) = json!(self.params) {
            body.extend(params);
        }
        Value::Object(body)
    }

    /// Command-line flags for the subprocess strategy.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--domain".to_string(),
            self.domain.to_string(),
            "--operation".to_string(),
            self.operation.to_string(),
            "--gene".to_string(),
            self.gene.clone(),
        ];
        let p = &self.params;
        let flags = [
            ("--site", p.site.clone()),
            ("--comparand", p.comparand.clone()),
            ("--threshold", p.threshold.map(|t| t.to_string())),
            ("--survival-type", p.survival_type.clone()),
            ("--dataset", p.dataset.clone()),
        ];
        for (flag, value) in flags {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value);
            }
        }
        args
    }
}
