use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;

use super::{AnalysisOutput, Tool, ToolDefinition, ToolOutput};
use crate::domain::{Domain, Operation};
use crate::error::{FlowError, Result};
use crate::request::AnalysisParams;
use crate::service::AnalysisService;

#[derive(Debug, Deserialize)]
struct AnalysisArgs {
    operation: String,
    gene: String,
    #[serde(flatten)]
    params: AnalysisParams,
}

/// Exposes one domain's analyses to the model as `{domain}_analysis`.
pub struct AnalysisTool {
    name: String,
    service: Arc<AnalysisService>,
}

impl AnalysisTool {
    pub fn new(service: Arc<AnalysisService>) -> Self {
        Self {
            name: format!("{}_analysis", service.domain()),
            service,
        }
    }

    fn description(&self) -> String {
        let what = match self.service.domain() {
            Domain::Phospho => "phosphorylation site data (site-level abundance, survival, correlation)",
            Domain::Transcriptome => "bulk gene expression data (differential expression, survival, enrichment)",
            Domain::SingleCell => "single-cell expression data (cell-type level expression and correlation)",
            Domain::Proteomics => "protein abundance data",
        };
        format!(
            "Run an analysis on {what} for one gene. Use operation 'comprehensive' to run every \
             supported analysis at once."
        )
    }
}

#[async_trait]
impl Tool for AnalysisTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> ToolDefinition {
        let operations: Vec<&str> = self
            .service
            .profile()
            .operations
            .iter()
            .map(Operation::as_str)
            .collect();

        let mut properties = Map::new();
        properties.insert(
            "operation".to_string(),
            json!({"type": "string", "enum": operations}),
        );
        properties.insert(
            "gene".to_string(),
            json!({"type": "string", "description": "Gene symbol, e.g. KIT"}),
        );
        if self.service.domain() == Domain::Phospho {
            properties.insert(
                "site".to_string(),
                json!({"type": "string", "description": "Phosphosite such as Y703; discovered when omitted"}),
            );
        }
        if self.service.profile().supports(Operation::Correlation) {
            properties.insert(
                "comparand".to_string(),
                json!({"type": "string", "description": "Second gene for correlation"}),
            );
        }
        if self.service.profile().supports(Operation::Survival) {
            properties.insert(
                "survival_type".to_string(),
                json!({"type": "string", "description": "Survival endpoint, e.g. OS or PFS"}),
            );
        }
        if self.service.domain() != Domain::Phospho {
            properties.insert(
                "dataset".to_string(),
                json!({"type": "string", "description": "Dataset identifier"}),
            );
        }
        properties.insert(
            "threshold".to_string(),
            json!({"type": "number", "minimum": 0}),
        );

        ToolDefinition {
            name: self.name.clone(),
            description: self.description(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": ["operation", "gene"],
            }),
        }
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let args: AnalysisArgs = serde_json::from_value(arguments)
            .map_err(|e| FlowError::validation(format!("invalid arguments for {}: {e}", self.name)))?;
        let operation: Operation = args.operation.parse()?;
        let domain = self.service.domain();

        if operation == Operation::Comprehensive {
            let composite = self.service.comprehensive(&args.gene, args.params).await;
            return Ok(ToolOutput {
                content: serde_json::to_value(&composite)?,
                analysis: Some(AnalysisOutput::Composite { result: composite }),
            });
        }

        let request = self.service.validate(operation, &args.gene, args.params)?;
        let result = self.service.execute_single_analysis(&request).await;
        Ok(ToolOutput {
            content: serde_json::to_value(&result)?,
            analysis: Some(AnalysisOutput::Single {
                domain,
                operation,
                gene: request.gene().to_string(),
                result,
            }),
        })
    }
}

/// Reports per-domain backend health without probing.
pub struct BackendStatusTool {
    services: Vec<Arc<AnalysisService>>,
}

impl BackendStatusTool {
    pub fn new(services: Vec<Arc<AnalysisService>>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for BackendStatusTool {
    fn name(&self) -> &str {
        "backend_status"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "backend_status".to_string(),
            description: "Report which analysis backends are reachable and which domains are available."
                .to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(&self, _arguments: Value) -> Result<ToolOutput> {
        let mut status = Map::new();
        for service in &self.services {
            status.insert(
                service.domain().to_string(),
                json!({
                    "health": service.health(),
                    "operations": service.profile().operations.iter().map(Operation::as_str).collect::<Vec<_>>(),
                }),
            );
        }
        Ok(ToolOutput::json(Value::Object(status)))
    }
}
