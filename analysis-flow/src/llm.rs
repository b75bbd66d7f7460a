use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use crate::conversation::{ChatMessage, Role, ToolCall};
use crate::error::{FlowError, Result};
use crate::tools::ToolDefinition;

/// What the model asked for on one turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Answer(String),
    ToolCalls { content: String, calls: Vec<ToolCall> },
}

/// A chat-completion model that can request tool calls.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Result<ModelReply>;
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "openai/gpt-4.1-mini".to_string(),
            timeout: Duration::from_secs(90),
        }
    }
}

/// OpenAI-compatible chat completions client, OpenRouter by default.
pub struct OpenRouterModel {
    client: Client,
    config: ModelConfig,
}

impl OpenRouterModel {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FlowError::Config(format!("failed to build LLM client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn request_body(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
        });
        if !tools.is_empty() {
            body["tools"] = tools.iter().map(wire_tool).collect();
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

#[async_trait]
impl ChatModel for OpenRouterModel {
    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Result<ModelReply> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| FlowError::Config("OPENROUTER_API_KEY not set".to_string()))?;
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&self.request_body(messages, tools))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FlowError::ModelTimeout(self.config.timeout)
                } else {
                    FlowError::ModelTransport(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| FlowError::ModelTransport(e.to_string()))?;
        if !status.is_success() {
            return Err(FlowError::ModelTransport(format!(
                "model endpoint returned {status}: {}",
                text.chars().take(500).collect::<String>()
            )));
        }

        let parsed: CompletionResponse = serde_json::from_str(&text)
            .map_err(|e| FlowError::ModelTransport(format!("unparsable completion: {e}")))?;
        let reply = parse_reply(parsed)?;
        debug!(
            model = %self.config.model,
            tool_calls = match &reply {
                ModelReply::ToolCalls { calls, .. } => calls.len(),
                ModelReply::Answer(_) => 0,
            },
            "Model turn completed"
        );
        Ok(reply)
    }
}

fn wire_message(message: &ChatMessage) -> Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut wire = json!({ "role": role, "content": message.content });
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    }
                })
            })
            .collect();
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

fn wire_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn parse_reply(response: CompletionResponse) -> Result<ModelReply> {
    let message = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .ok_or_else(|| FlowError::ModelTransport("completion had no choices".to_string()))?;

    let content = message.content.unwrap_or_default();
    let calls: Vec<ToolCall> = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            // Invalid argument JSON is handed to the tool as a string and rejected there.
            let arguments = if tc.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(Value::String(tc.function.arguments))
            };
            ToolCall {
                id: tc.id.unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                name: tc.function.name,
                arguments,
            }
        })
        .collect();

    if calls.is_empty() {
        Ok(ModelReply::Answer(content))
    } else {
        Ok(ModelReply::ToolCalls { content, calls })
    }
}
