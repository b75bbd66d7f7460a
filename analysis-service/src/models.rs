use analysis_flow::{AnalysisParams, ChatMessage, Domain, DomainAnalysis, StopReason, TurnOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Single new user message.
    #[serde(default)]
    pub message: Option<String>,
    /// Prior dialogue, optionally ending with the new user message.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    pub fn has_input(&self) -> bool {
        self.message.as_deref().is_some_and(|m| !m.trim().is_empty())
            || self.messages.iter().any(|m| !m.content.trim().is_empty())
    }
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub reply: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub analyses: BTreeMap<Domain, DomainAnalysis>,
    pub stop_reason: StopReason,
    pub model_turns: usize,
    pub tool_calls: usize,
}

impl ChatResponse {
    pub fn new(session_id: String, outcome: TurnOutcome) -> Self {
        Self {
            session_id,
            reply: outcome.reply,
            analyses: outcome.analyses,
            stop_reason: outcome.stop_reason,
            model_turns: outcome.model_turns,
            tool_calls: outcome.tool_calls.len(),
        }
    }
}

/// Body of the per-domain direct endpoints.
#[derive(Debug, Deserialize)]
pub struct DirectRequest {
    pub gene: String,
    #[serde(flatten)]
    pub params: AnalysisParams,
}
