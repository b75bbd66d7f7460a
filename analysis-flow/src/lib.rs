pub mod backend;
pub mod config;
pub mod conversation;
pub mod domain;
pub mod error;
pub mod health;
pub mod llm;
pub mod merge;
pub mod normalize;
pub mod orchestrator;
pub mod request;
pub mod result;
pub mod service;
pub mod tools;

// Re-export commonly used types
pub use backend::{ExecutionBackend, RemoteOutcome, RemoteStrategy, SubprocessStrategy};
pub use config::{DomainSettings, Settings, build_registry};
pub use conversation::{ChatMessage, Conversation, Role, ToolCall};
pub use domain::{Domain, DomainProfile, Operation};
pub use error::{FailureKind, FlowError, Result};
pub use health::{BackendHealth, HealthMonitor, HealthState, ProbePolicy};
pub use llm::{ChatModel, ModelConfig, ModelReply, OpenRouterModel};
pub use merge::{DomainAnalysis, merge_analyses};
pub use normalize::normalize;
pub use orchestrator::{Orchestrator, OrchestratorConfig, StopReason, TurnEvent, TurnOutcome};
pub use request::{AnalysisParams, AnalysisRequest};
pub use result::{AnalysisResult, CompositeResult, ExecutionPath, ResultStatus, Summary};
pub use service::AnalysisService;
pub use tools::{Tool, ToolCallRecord, ToolDefinition, ToolOutput, ToolRegistry, ToolStats};
