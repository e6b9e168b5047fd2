use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::agent::context::ContextBuilder;
use crate::agent::memory::Consolidator;
use crate::provider::{
    ChatProvider, CompletionOutcome, CompletionParams, ModelPool, PromptMessage, ProviderError,
    ToolOutput, ToolSpec,
};
use crate::session::{SessionMessage, SessionStore};
use crate::tools::ToolRegistry;

/// Appended after each round of tool results, before handing back to the model.
const REFLECT_DIRECTIVE: &str =
    "If more tool calls are needed, make them. Otherwise, respond with the result.";

/// Response used when the provider stays unreachable for a whole turn.
const PROVIDER_FAILURE_REPLY: &str =
    "Sorry, I couldn't reach my language model after several attempts. Please try again in a moment.";

/// Consecutive all-tools-failed iterations before the turn is cut short.
const MAX_CONSECUTIVE_ERRORS: usize = 3;

/// Find the largest byte index <= `max` that is a UTF-8 char boundary.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn preview(text: &str, max: usize) -> String {
    if text.len() > max {
        let end = floor_char_boundary(text, max);
        format!("{}... ({} chars)", &text[..end], text.len())
    } else {
        text.to_string()
    }
}

/// Result of processing one inbound message.
pub struct TurnOutcome {
    pub response: String,
    /// Set when the session tail has outgrown the context budget; the caller
    /// runs consolidation after delivering the response.
    pub needs_consolidation: bool,
}

/// Core agent processing loop.
///
/// One `process_message` call is one turn: build context, call the model,
/// execute any requested tools, repeat until the model produces plain text
/// (or a bound trips), then record and return the response. The caller is
/// responsible for never running two turns for the same session key at once.
pub struct AgentLoop {
    pub models: ModelPool,
    pub sessions: Arc<SessionStore>,
    pub context: ContextBuilder,
    pub tools: Arc<ToolRegistry>,
    pub consolidator: Consolidator,
    pub max_iterations: usize,
    pub temperature: f64,
    pub max_tokens: u64,
    pub provider_retries: u32,
}

impl AgentLoop {
    /// Process a single user message and return the assistant's response plus
    /// a flag indicating whether memory consolidation is due.
    pub async fn process_message(
        &self,
        session_key: &str,
        user_message: &str,
        media: Option<&[String]>,
    ) -> Result<TurnOutcome> {
        // Build the prompt from prior history plus the new message, then
        // append the message to the session before any model call. A
        // persistence fault here aborts the turn unprocessed.
        let session = self.sessions.load(session_key).await?;
        let history = session.recent(self.context.history_window());
        let messages = self.context.build_messages(history, user_message, media)?;
        self.sessions
            .append(session_key, &SessionMessage::new("user", user_message))
            .await?;

        let tool_specs = self.tools.schemas();
        let (response, tools_used) = self.run_loop(session_key, messages, &tool_specs).await?;
        if !tools_used.is_empty() {
            debug!("Turn for '{session_key}' used tools: {}", tools_used.join(", "));
        }

        self.sessions
            .append(session_key, &SessionMessage::new("assistant", &response))
            .await?;

        let session_len = self.sessions.load(session_key).await?.messages.len();
        Ok(TurnOutcome {
            response,
            needs_consolidation: self.context.consolidation_due(session_len),
        })
    }

    /// Fold old session messages into long-term memory.
    pub async fn consolidate(&self, session_key: &str, archive_all: bool) -> Result<bool> {
        let (provider, _) = self.models.get("consolidation");
        self.consolidator
            .consolidate(provider, &self.sessions, session_key, archive_all)
            .await
    }

    /// Run the model <> tool cycle until the model produces a text response
    /// or a bound trips. Returns (response_text, tools_used).
    async fn run_loop(
        &self,
        session_key: &str,
        mut messages: Vec<PromptMessage>,
        tool_specs: &[ToolSpec],
    ) -> Result<(String, Vec<String>)> {
        let (provider, model_name) = self.models.get("default");
        let mut tools_used: Vec<String> = Vec::new();
        let mut consecutive_errors: usize = 0;
        let mut last_error = String::new();

        for iteration in 0..self.max_iterations {
            debug!(
                "Model request [{}/{}] ({model_name}): {} messages",
                iteration + 1,
                self.max_iterations,
                messages.len()
            );

            let outcome = match self
                .complete_with_retry(
                    provider,
                    CompletionParams {
                        messages: messages.clone(),
                        tools: tool_specs.to_vec(),
                        temperature: self.temperature,
                        max_tokens: self.max_tokens,
                    },
                )
                .await
            {
                Ok(o) => o,
                Err(e) => {
                    error!("Model call failed for '{session_key}': {e}");
                    return Ok((PROVIDER_FAILURE_REPLY.to_string(), tools_used));
                }
            };

            if outcome.tool_calls.is_empty() {
                let text = if outcome.text.is_empty() {
                    "I've completed processing but have no response to give.".to_string()
                } else {
                    outcome.text
                };
                return Ok((text, tools_used));
            }

            // Record the tool-call turn before executing anything.
            let call_names: Vec<String> =
                outcome.tool_calls.iter().map(|c| c.name.clone()).collect();
            tools_used.extend(call_names.iter().cloned());
            self.sessions
                .append(
                    session_key,
                    &SessionMessage::with_tools("assistant", &outcome.text, call_names),
                )
                .await?;

            for call in &outcome.tool_calls {
                info!(
                    "Tool call [{}/{}]: {}({})",
                    iteration + 1,
                    self.max_iterations,
                    call.name,
                    preview(&call.arguments.to_string(), 200)
                );
            }

            // Tool calls within one turn have no cross-dependency: run them
            // concurrently, collect every result before the next model call.
            let results: Vec<String> = join_all(
                outcome
                    .tool_calls
                    .iter()
                    .map(|call| self.tools.execute(&call.name, call.arguments.clone())),
            )
            .await;

            let mut iteration_has_success = false;
            let mut tool_outputs = Vec::new();
            for (call, result) in outcome.tool_calls.iter().zip(results) {
                if result.starts_with("Error") {
                    last_error.clone_from(&result);
                } else {
                    iteration_has_success = true;
                }
                debug!("Tool result [{}]: {}", call.name, preview(&result, 200));

                self.sessions
                    .append(
                        session_key,
                        &SessionMessage::new("tool", &format!("[{}] {result}", call.name)),
                    )
                    .await?;
                tool_outputs.push(ToolOutput {
                    id: call.id.clone(),
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    content: result,
                });
            }

            messages.push(PromptMessage::ToolCalls {
                text: outcome.text,
                calls: outcome.tool_calls,
            });
            messages.push(PromptMessage::ToolResults(tool_outputs));
            messages.push(PromptMessage::User(REFLECT_DIRECTIVE.into()));

            // Circuit breaker: bail if all tool calls keep failing (e.g. the
            // model insists on malformed parameters).
            if iteration_has_success {
                consecutive_errors = 0;
            } else {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    warn!(
                        "Circuit breaker: {consecutive_errors} consecutive iterations with all tool calls failing"
                    );
                    return Ok((
                        format!(
                            "I'm having trouble using a tool correctly and had to stop retrying. \
                             Last error: {last_error}. Could you try rephrasing your request?"
                        ),
                        tools_used,
                    ));
                }
            }
        }

        warn!(
            "Agent loop reached max iterations ({}) without final response",
            self.max_iterations
        );
        Ok((
            "I've been working on this but reached the maximum number of iterations. Here's what I've done so far.".to_string(),
            tools_used,
        ))
    }

    /// Call the provider, retrying transient failures with exponential
    /// backoff. Fatal errors and retry exhaustion surface to the caller.
    async fn complete_with_retry(
        &self,
        provider: &Arc<dyn ChatProvider>,
        params: CompletionParams,
    ) -> std::result::Result<CompletionOutcome, ProviderError> {
        let attempts = self.provider_retries.max(1);
        let mut delay = Duration::from_millis(500);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match provider.complete(params.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!("Transient provider error (attempt {attempt}/{attempts}): {e}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
