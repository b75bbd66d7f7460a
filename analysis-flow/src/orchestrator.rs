//! Bounded tool-calling loop between the chat model and the tool registry.

use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::conversation::{ChatMessage, Conversation, ToolCall};
use crate::domain::Domain;
use crate::error::{FlowError, Result};
use crate::llm::{ChatModel, ModelReply};
use crate::merge::{DomainAnalysis, merge_analyses};
use crate::tools::{AnalysisOutput, ToolCallRecord, ToolOutcome, ToolRegistry};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an analysis assistant for a biomedical dashboard. \
Use the analysis tools to answer questions about genes across phosphoproteomics, transcriptomics, \
single-cell and proteomics data. Call tools for every figure you report, prefer a comprehensive \
analysis when the user asks for an overview, and summarise the results concisely. If a tool fails, \
say what could not be computed instead of guessing.";

const MAX_STRING_BYTES: usize = 4 * 1024;
const MAX_ROWS: usize = 25;
const DROPPED_FIELDS: [&str; 4] = ["plot", "image", "plot_base64", "figure"];

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model invocations allowed per run.
    pub max_turns: usize,
    pub model_timeout: Duration,
    pub system_prompt: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_turns: 6,
            model_timeout: Duration::from_secs(90),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Answered,
    TurnLimit,
    ModelTimeout,
    ModelError,
}

/// Progress notifications for streaming clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    ModelTurn {
        turn: usize,
    },
    ToolStarted {
        call_id: String,
        tool: String,
        arguments: Value,
    },
    ToolFinished {
        call_id: String,
        tool: String,
        success: bool,
        duration_ms: u64,
    },
}

/// Everything one orchestration run produced.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub reply: String,
    pub analyses: BTreeMap<Domain, DomainAnalysis>,
    pub stop_reason: StopReason,
    pub model_turns: usize,
    pub tool_calls: Vec<ToolCallRecord>,
}

enum TurnState {
    AwaitingModel,
    ExecutingTools(Vec<ToolCall>),
    Done { reply: String, reason: StopReason },
}

pub struct Orchestrator {
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        registry: Arc<ToolRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            model,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// New conversation seeded with the configured system prompt.
    pub fn conversation(
        &self,
        history: impl IntoIterator<Item = ChatMessage>,
        message: Option<String>,
    ) -> Conversation {
        Conversation::with_history(self.config.system_prompt.clone(), history, message)
    }

    pub async fn run(&self, conversation: Conversation) -> Result<TurnOutcome> {
        self.run_with_events(conversation, None).await
    }

    /// Drive the model until it answers or the turn budget is spent.
    ///
    /// A model timeout or transport failure after at least one successful
    /// tool call yields a partial outcome; before that it is an error.
    #[instrument(skip_all, fields(max_turns = self.config.max_turns))]
    pub async fn run_with_events(
        &self,
        mut conversation: Conversation,
        events: Option<mpsc::Sender<TurnEvent>>,
    ) -> Result<TurnOutcome> {
        let definitions = self.registry.definitions();
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut analyses: Vec<AnalysisOutput> = Vec::new();
        let mut turns = 0;
        let mut state = TurnState::AwaitingModel;

        let (reply, stop_reason) = loop {
            state = match state {
                TurnState::AwaitingModel if turns >= self.config.max_turns => {
                    warn!(turns, "Tool loop reached its turn limit");
                    TurnState::Done {
                        reply: exhausted_reply(&records),
                        reason: StopReason::TurnLimit,
                    }
                }
                TurnState::AwaitingModel => {
                    turns += 1;
                    emit(&events, TurnEvent::ModelTurn { turn: turns }).await;

                    let completion = tokio::time::timeout(
                        self.config.model_timeout,
                        self.model.complete(conversation.messages(), &definitions),
                    )
                    .await
                    .unwrap_or(Err(FlowError::ModelTimeout(self.config.model_timeout)));

                    match completion {
                        Ok(ModelReply::Answer(text)) => {
                            conversation.push(ChatMessage::assistant(text.clone()));
                            TurnState::Done {
                                reply: text,
                                reason: StopReason::Answered,
                            }
                        }
                        Ok(ModelReply::ToolCalls { content, calls }) => {
                            conversation.push(ChatMessage::assistant_tool_calls(content, calls.clone()));
                            TurnState::ExecutingTools(calls)
                        }
                        Err(e) => {
                            if !records.iter().any(|r| r.success) {
                                warn!(error = %e, turns, "Model failed before any tool succeeded");
                                return Err(e);
                            }
                            warn!(error = %e, turns, "Model failed, returning partial results");
                            let reason = if matches!(e, FlowError::ModelTimeout(_)) {
                                StopReason::ModelTimeout
                            } else {
                                StopReason::ModelError
                            };
                            TurnState::Done {
                                reply: partial_reply(&e, &records),
                                reason,
                            }
                        }
                    }
                }
                TurnState::ExecutingTools(calls) => {
                    for call in &calls {
                        emit(
                            &events,
                            TurnEvent::ToolStarted {
                                call_id: call.id.clone(),
                                tool: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        )
                        .await;
                    }

                    for outcome in self.registry.execute_batch(calls).await {
                        emit(
                            &events,
                            TurnEvent::ToolFinished {
                                call_id: outcome.call_id.clone(),
                                tool: outcome.tool_name.clone(),
                                success: outcome.record.success,
                                duration_ms: outcome.record.duration_ms,
                            },
                        )
                        .await;
                        conversation.push(ChatMessage::tool_result(
                            outcome.call_id.clone(),
                            content_for_model(&outcome),
                        ));
                        let ToolOutcome { record, output, .. } = outcome;
                        records.push(record);
                        if let Ok(output) = output {
                            analyses.extend(output.analysis);
                        }
                    }
                    TurnState::AwaitingModel
                }
                TurnState::Done { reply, reason } => break (reply, reason),
            };
        };

        info!(
            turns,
            tool_calls = records.len(),
            stop_reason = ?stop_reason,
            "Orchestration finished"
        );
        Ok(TurnOutcome {
            reply,
            analyses: merge_analyses(analyses),
            stop_reason,
            model_turns: turns,
            tool_calls: records,
        })
    }
}

async fn emit(events: &Option<mpsc::Sender<TurnEvent>>, event: TurnEvent) {
    if let Some(tx) = events {
        // A disconnected client must not stop the run.
        let _ = tx.send(event).await;
    }
}

fn content_for_model(outcome: &ToolOutcome) -> String {
    match &outcome.output {
        Ok(output) => trim_for_model(&output.content).to_string(),
        Err(e) => json!({ "error": e.to_string() }).to_string(),
    }
}

fn completed_lines(records: &[ToolCallRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|r| r.success)
        .map(|r| {
            let what = [r.arguments.get("operation"), r.arguments.get("gene")]
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" ");
            let message = r
                .result
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("completed");
            if what.is_empty() {
                format!("- {}: {message}", r.tool_name)
            } else {
                format!("- {} ({what}): {message}", r.tool_name)
            }
        })
        .collect()
}

fn exhausted_reply(records: &[ToolCallRecord]) -> String {
    let lines = completed_lines(records);
    if lines.is_empty() {
        return "I could not complete this request within the allowed number of steps. \
                Please try a more specific question."
            .to_string();
    }
    format!(
        "I reached the step limit before writing a full answer. Completed analyses:\n{}",
        lines.join("\n")
    )
}

fn partial_reply(err: &FlowError, records: &[ToolCallRecord]) -> String {
    format!(
        "The language model stopped responding ({err}). Results gathered so far:\n{}",
        completed_lines(records).join("\n")
    )
}

/// Shrink a tool result before it enters the model context.
///
/// Plot payloads are dropped, long strings replaced and large row arrays
/// capped. The caller keeps the untrimmed result.
pub fn trim_for_model(value: &Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut trimmed = Map::new();
            for (key, field) in fields {
                if DROPPED_FIELDS.contains(&key.as_str()) {
                    if !field.is_null() {
                        trimmed.insert(key.clone(), json!("[omitted]"));
                    }
                    continue;
                }
                trimmed.insert(key.clone(), trim_for_model(field));
            }
            Value::Object(trimmed)
        }
        Value::Array(items) => {
            let mut trimmed: Vec<Value> = items.iter().take(MAX_ROWS).map(trim_for_model).collect();
            if items.len() > MAX_ROWS {
                trimmed.push(json!(format!("... {} more rows", items.len() - MAX_ROWS)));
            }
            Value::Array(trimmed)
        }
        Value::String(s) if s.len() > MAX_STRING_BYTES => {
            json!(format!("[{} bytes omitted]", s.len()))
        }
        other => other.clone(),
    }
}
