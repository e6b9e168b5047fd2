use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::completion::{CompletionModel, CompletionRequest, Message, ToolDefinition};
use rig::message::{
    AssistantContent, Text, ToolCall, ToolFunction, ToolResult, ToolResultContent, UserContent,
};
use rig::OneOrMany;
use thiserror::Error;

/// One segment of the model-facing prompt.
#[derive(Debug, Clone)]
pub enum PromptMessage {
    System(String),
    User(String),
    Assistant(String),
    /// Assistant turn that requested tool calls (text may be empty).
    ToolCalls {
        text: String,
        calls: Vec<ToolInvocation>,
    },
    /// Results for a batch of tool calls, correlated by call id.
    ToolResults(Vec<ToolOutput>),
}

/// A model-requested tool invocation.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub call_id: Option<String>,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// The result of one tool invocation, correlated back by id.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub id: String,
    pub call_id: Option<String>,
    pub name: String,
    pub content: String,
}

/// Machine-readable tool description presented to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// What the model returned: text, tool calls, or both.
#[derive(Debug, Clone, Default)]
pub struct CompletionOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
}

/// One completion request.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub messages: Vec<PromptMessage>,
    pub tools: Vec<ToolSpec>,
    pub temperature: f64,
    pub max_tokens: u64,
}

/// Provider failures, split by whether a retry could help.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Interface to an LLM completion backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, params: CompletionParams) -> Result<CompletionOutcome, ProviderError>;
}

/// Pool of named model tiers (e.g. "default", "consolidation", "subagent").
///
/// An explicitly constructed, immutable lookup table — components that need a
/// model receive this at construction. Unknown tier names fall back to
/// "default", which must always be present (validated at construction).
#[derive(Clone)]
pub struct ModelPool {
    /// tier -> (provider, model_name_for_logging)
    models: HashMap<String, (Arc<dyn ChatProvider>, String)>,
}

impl ModelPool {
    /// Create a new ModelPool. Panics if no "default" tier is present.
    pub fn new(models: HashMap<String, (Arc<dyn ChatProvider>, String)>) -> Self {
        assert!(
            models.contains_key("default"),
            "ModelPool must contain a \"default\" tier"
        );
        Self { models }
    }

    /// Get a specific tier. Falls back to "default" if the tier is not found.
    pub fn get(&self, tier: &str) -> (&Arc<dyn ChatProvider>, &str) {
        let (provider, name) = self
            .models
            .get(tier)
            .or_else(|| self.models.get("default"))
            .expect("default tier must exist");
        (provider, name)
    }

    /// List all available tier names.
    pub fn tiers(&self) -> Vec<&str> {
        self.models.keys().map(|k| k.as_str()).collect()
    }
}

/// Classify a provider error message as retryable or not.
fn is_transient_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    [
        "timeout",
        "timed out",
        "429",
        "rate limit",
        "too many requests",
        "overloaded",
        "connection",
        "temporarily unavailable",
        "500",
        "502",
        "503",
        "504",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// ChatProvider backed by a rig completion model.
#[allow(deprecated)]
pub struct RigProvider {
    handle: CompletionModelHandle<'static>,
}

#[allow(deprecated)]
impl RigProvider {
    pub fn new(handle: CompletionModelHandle<'static>) -> Self {
        Self { handle }
    }

    fn to_rig_messages(messages: &[PromptMessage]) -> (Option<String>, Vec<Message>) {
        let mut preamble: Option<String> = None;
        let mut history: Vec<Message> = Vec::new();

        for msg in messages {
            match msg {
                PromptMessage::System(text) => match preamble {
                    Some(ref mut p) => {
                        p.push_str("\n\n");
                        p.push_str(text);
                    }
                    None => preamble = Some(text.clone()),
                },
                PromptMessage::User(text) => {
                    history.push(Message::User {
                        content: OneOrMany::one(UserContent::Text(Text { text: text.clone() })),
                    });
                }
                PromptMessage::Assistant(text) => {
                    history.push(Message::Assistant {
                        id: None,
                        content: OneOrMany::one(AssistantContent::Text(Text {
                            text: text.clone(),
                        })),
                    });
                }
                PromptMessage::ToolCalls { text, calls } => {
                    let mut parts: Vec<AssistantContent> = Vec::new();
                    if !text.is_empty() {
                        parts.push(AssistantContent::Text(Text { text: text.clone() }));
                    }
                    for call in calls {
                        parts.push(AssistantContent::ToolCall(ToolCall {
                            id: call.id.clone(),
                            call_id: call.call_id.clone(),
                            function: ToolFunction {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                            signature: None,
                            additional_params: None,
                        }));
                    }
                    if let Ok(content) = OneOrMany::many(parts) {
                        history.push(Message::Assistant { id: None, content });
                    }
                }
                PromptMessage::ToolResults(results) => {
                    let contents: Vec<UserContent> = results
                        .iter()
                        .map(|r| {
                            UserContent::ToolResult(ToolResult {
                                id: r.id.clone(),
                                call_id: r.call_id.clone(),
                                content: OneOrMany::one(ToolResultContent::Text(Text {
                                    text: r.content.clone(),
                                })),
                            })
                        })
                        .collect();
                    if let Ok(content) = OneOrMany::many(contents) {
                        history.push(Message::User { content });
                    }
                }
            }
        }

        (preamble, history)
    }
}

#[allow(deprecated)]
#[async_trait]
impl ChatProvider for RigProvider {
    async fn complete(&self, params: CompletionParams) -> Result<CompletionOutcome, ProviderError> {
        let (preamble, history) = Self::to_rig_messages(&params.messages);
        let chat_history = OneOrMany::many(history)
            .map_err(|_| ProviderError::Fatal("completion request has no messages".into()))?;

        let tools: Vec<ToolDefinition> = params
            .tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect();

        let request = CompletionRequest {
            preamble,
            chat_history,
            documents: Vec::new(),
            tools,
            temperature: Some(params.temperature),
            max_tokens: Some(params.max_tokens),
            tool_choice: None,
            additional_params: None,
        };

        let response = self.handle.completion(request).await.map_err(|e| {
            let message = e.to_string();
            if is_transient_error(&message) {
                ProviderError::Transient(message)
            } else {
                ProviderError::Fatal(message)
            }
        })?;

        let mut outcome = CompletionOutcome::default();
        for content in response.choice.iter() {
            match content {
                AssistantContent::Text(t) => outcome.text.push_str(&t.text),
                AssistantContent::ToolCall(tc) => outcome.tool_calls.push(ToolInvocation {
                    id: tc.id.clone(),
                    call_id: tc.call_id.clone(),
                    name: tc.function.name.clone(),
                    arguments: tc.function.arguments.clone(),
                }),
                _ => {}
            }
        }

        Ok(outcome)
    }
}
