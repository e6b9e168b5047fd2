//! End-to-end tests for the agent loop and conversation router, driven by
//! scripted mock providers.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::timeout;

use coracle_core::agent::{AgentLoop, Consolidator, ContextBuilder};
use coracle_core::bus::{BusMessage, MessageBus, OutboundMessage};
use coracle_core::provider::{
    ChatProvider, CompletionOutcome, CompletionParams, ModelPool, PromptMessage, ProviderError,
    ToolInvocation,
};
use coracle_core::router::ConversationRouter;
use coracle_core::session::SessionStore;
use coracle_core::tools::filesystem::ListDirTool;
use coracle_core::tools::{Tool, ToolRegistry};

// ---------------------------------------------------------------------------
// Mock providers
// ---------------------------------------------------------------------------

/// Plays back a fixed script of responses, then repeats the fallback forever.
struct ScriptedProvider {
    steps: Mutex<VecDeque<Result<CompletionOutcome, ProviderError>>>,
    fallback: Box<dyn Fn() -> Result<CompletionOutcome, ProviderError> + Send + Sync>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(steps: Vec<Result<CompletionOutcome, ProviderError>>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: Box::new(|| Ok(text_outcome("done"))),
            calls: AtomicUsize::new(0),
        }
    }

    fn with_fallback(
        steps: Vec<Result<CompletionOutcome, ProviderError>>,
        fallback: impl Fn() -> Result<CompletionOutcome, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: Box::new(fallback),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn complete(&self, _params: CompletionParams) -> Result<CompletionOutcome, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.steps.lock().await.pop_front() {
            Some(step) => step,
            None => (self.fallback)(),
        }
    }
}

/// Echoes the latest user message, optionally sleeping first when the
/// message asks it to (content containing "slow").
struct EchoProvider {
    slow_delay: Duration,
}

#[async_trait]
impl ChatProvider for EchoProvider {
    async fn complete(&self, params: CompletionParams) -> Result<CompletionOutcome, ProviderError> {
        let text = params
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                PromptMessage::User(t) => Some(t.clone()),
                _ => None,
            })
            .unwrap_or_default();

        if text.contains("slow") {
            tokio::time::sleep(self.slow_delay).await;
        }
        Ok(text_outcome(&format!("echo: {text}")))
    }
}

fn text_outcome(text: &str) -> CompletionOutcome {
    CompletionOutcome {
        text: text.to_string(),
        tool_calls: Vec::new(),
    }
}

fn tool_call_outcome(name: &str, arguments: serde_json::Value) -> CompletionOutcome {
    CompletionOutcome {
        text: String::new(),
        tool_calls: vec![ToolInvocation {
            id: "call-1".into(),
            call_id: None,
            name: name.into(),
            arguments,
        }],
    }
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the input back."
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {"type": "string"}
            },
            "required": ["text"]
        })
    }
    async fn execute(&self, params: serde_json::Value) -> anyhow::Result<String> {
        Ok(params
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    _workspace: tempfile::TempDir,
    _sessions: tempfile::TempDir,
    agent: Arc<AgentLoop>,
}

fn make_agent(provider: Arc<dyn ChatProvider>, tools: ToolRegistry, window: usize) -> Harness {
    let workspace = tempfile::tempdir().unwrap();
    let sessions_dir = tempfile::tempdir().unwrap();

    let mut models: HashMap<String, (Arc<dyn ChatProvider>, String)> = HashMap::new();
    models.insert("default".into(), (provider.clone(), "mock".into()));
    models.insert("consolidation".into(), (provider, "mock".into()));

    let agent = Arc::new(AgentLoop {
        models: ModelPool::new(models),
        sessions: Arc::new(SessionStore::new(sessions_dir.path().to_path_buf())),
        context: ContextBuilder::new(workspace.path(), window),
        tools: Arc::new(tools),
        consolidator: Consolidator::new(workspace.path(), window / 2),
        max_iterations: 20,
        temperature: 0.7,
        max_tokens: 1024,
        provider_retries: 3,
    });

    Harness {
        _workspace: workspace,
        _sessions: sessions_dir,
        agent,
    }
}

fn memory_dir(harness: &Harness) -> &Path {
    harness._workspace.path()
}

async fn recv_outbound(
    rx: &mut tokio::sync::broadcast::Receiver<BusMessage>,
) -> Option<OutboundMessage> {
    loop {
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(BusMessage::Outbound(msg))) => return Some(msg),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tool_call_turn_records_full_transcript() {
    // Scenario: user asks for a listing, model calls list_dir, registry
    // returns the listing, model answers. Session must hold exactly: user,
    // assistant tool-call, tool result, assistant final text.
    let listing_dir = tempfile::tempdir().unwrap();
    std::fs::write(listing_dir.path().join("notes.txt"), "").unwrap();

    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(tool_call_outcome(
            "list_dir",
            serde_json::json!({"path": listing_dir.path().to_str().unwrap()}),
        )),
        Ok(text_outcome("There's one file: notes.txt")),
    ]));

    let mut tools = ToolRegistry::new();
    tools.register(Box::new(ListDirTool::new(None))).unwrap();

    let harness = make_agent(provider.clone(), tools, 50);
    let outcome = harness
        .agent
        .process_message("cli:1", "list files in my notes dir", None)
        .await
        .unwrap();

    assert_eq!(outcome.response, "There's one file: notes.txt");
    assert_eq!(provider.calls(), 2);

    let session = harness.agent.sessions.load("cli:1").await.unwrap();
    let roles: Vec<&str> = session.messages.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, vec!["user", "assistant", "tool", "assistant"]);
    assert_eq!(
        session.messages[1].tools_used,
        Some(vec!["list_dir".to_string()])
    );
    assert!(session.messages[2].content.contains("notes.txt"));
}

#[tokio::test]
async fn iteration_cap_forces_a_response() {
    // Model never stops calling tools; cycle 21 must not happen.
    let provider = Arc::new(ScriptedProvider::with_fallback(Vec::new(), || {
        Ok(tool_call_outcome("echo", serde_json::json!({"text": "again"})))
    }));

    let mut tools = ToolRegistry::new();
    tools.register(Box::new(EchoTool)).unwrap();

    let harness = make_agent(provider.clone(), tools, 200);
    let outcome = harness
        .agent
        .process_message("cli:1", "loop forever", None)
        .await
        .unwrap();

    assert_eq!(provider.calls(), 20);
    assert!(outcome.response.contains("maximum number of iterations"));
}

#[tokio::test]
async fn repeated_tool_failures_trip_the_circuit_breaker() {
    // The model insists on a tool that always fails; after three consecutive
    // all-failed rounds the turn ends early instead of burning the full
    // iteration budget.
    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "Always fails."
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _params: serde_json::Value) -> anyhow::Result<String> {
            anyhow::bail!("disk on fire")
        }
    }

    let provider = Arc::new(ScriptedProvider::with_fallback(Vec::new(), || {
        Ok(tool_call_outcome("broken", serde_json::json!({})))
    }));

    let mut tools = ToolRegistry::new();
    tools.register(Box::new(BrokenTool)).unwrap();

    let harness = make_agent(provider.clone(), tools, 200);
    let outcome = harness
        .agent
        .process_message("cli:1", "please break", None)
        .await
        .unwrap();

    assert_eq!(provider.calls(), 3);
    assert!(outcome.response.contains("trouble using a tool"));
    assert!(outcome.response.contains("disk on fire"));
}

#[tokio::test]
async fn transient_provider_errors_are_retried() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Err(ProviderError::Transient("timeout".into())),
        Err(ProviderError::Transient("429".into())),
        Ok(text_outcome("recovered")),
    ]));

    let harness = make_agent(provider.clone(), ToolRegistry::new(), 50);
    let outcome = harness
        .agent
        .process_message("cli:1", "hello", None)
        .await
        .unwrap();

    assert_eq!(outcome.response, "recovered");
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn retry_exhaustion_degrades_to_apology() {
    let provider = Arc::new(ScriptedProvider::with_fallback(Vec::new(), || {
        Err(ProviderError::Transient("timeout".into()))
    }));

    let harness = make_agent(provider.clone(), ToolRegistry::new(), 50);
    let outcome = harness
        .agent
        .process_message("cli:1", "hello", None)
        .await
        .unwrap();

    assert_eq!(provider.calls(), 3);
    assert!(outcome.response.contains("couldn't reach"));

    // The apology is still a completed turn: user + assistant recorded.
    let session = harness.agent.sessions.load("cli:1").await.unwrap();
    assert_eq!(session.messages.len(), 2);
}

#[tokio::test]
async fn fatal_provider_error_fails_without_retry() {
    let provider = Arc::new(ScriptedProvider::with_fallback(
        vec![Err(ProviderError::Fatal("invalid api key".into()))],
        || Ok(text_outcome("should not be reached")),
    ));

    let harness = make_agent(provider.clone(), ToolRegistry::new(), 50);
    let outcome = harness
        .agent
        .process_message("cli:1", "hello", None)
        .await
        .unwrap();

    assert_eq!(provider.calls(), 1);
    assert!(outcome.response.contains("couldn't reach"));
}

#[tokio::test]
async fn invalid_tool_arguments_surface_to_the_model() {
    // First round: model omits the required "text" argument. The validation
    // failure must come back as a tool result, not abort the turn.
    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(tool_call_outcome("echo", serde_json::json!({}))),
        Ok(text_outcome("sorry, let me fix that")),
    ]));

    let mut tools = ToolRegistry::new();
    tools.register(Box::new(EchoTool)).unwrap();

    let harness = make_agent(provider.clone(), tools, 50);
    let outcome = harness
        .agent
        .process_message("cli:1", "echo nothing", None)
        .await
        .unwrap();

    assert_eq!(outcome.response, "sorry, let me fix that");
    let session = harness.agent.sessions.load("cli:1").await.unwrap();
    let tool_entry = session
        .messages
        .iter()
        .find(|m| m.role == "tool")
        .expect("tool result recorded");
    assert!(tool_entry.content.contains("invalid parameters"));
    assert!(tool_entry.content.contains("required field missing"));
}

#[tokio::test]
async fn consolidation_signal_fires_past_window() {
    let provider = Arc::new(EchoProvider {
        slow_delay: Duration::from_millis(0),
    });
    let harness = make_agent(provider, ToolRegistry::new(), 3);

    let first = harness
        .agent
        .process_message("cli:1", "one", None)
        .await
        .unwrap();
    assert!(!first.needs_consolidation); // 2 messages <= 3

    let second = harness
        .agent
        .process_message("cli:1", "two", None)
        .await
        .unwrap();
    assert!(second.needs_consolidation); // 4 messages > 3
}

// ---------------------------------------------------------------------------
// Consolidation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn consolidation_trims_session_and_appends_history_once() {
    let consolidation_json = serde_json::json!({
        "history_entry": "[2025-06-01 10:00] Discussed grocery planning.",
        "memory_update": "User shops on Saturdays."
    })
    .to_string();

    let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_outcome(
        &consolidation_json,
    ))]));

    // window 8 -> keep_recent 4
    let harness = make_agent(provider.clone(), ToolRegistry::new(), 8);
    for i in 0..10 {
        harness
            .agent
            .sessions
            .append(
                "cli:1",
                &coracle_core::session::SessionMessage::new("user", &format!("m{i}")),
            )
            .await
            .unwrap();
    }

    let ran = harness.agent.consolidate("cli:1", false).await.unwrap();
    assert!(ran);
    assert_eq!(provider.calls(), 1);

    let session = harness.agent.sessions.load("cli:1").await.unwrap();
    assert_eq!(session.messages.len(), 4);
    assert_eq!(session.messages[0].content, "m6");
    assert_eq!(session.consolidated_count, 6);

    let memory = std::fs::read_to_string(
        memory_dir(&harness).join("memory").join("MEMORY.md"),
    )
    .unwrap();
    assert_eq!(memory, "User shops on Saturdays.");

    let history = std::fs::read_to_string(
        memory_dir(&harness).join("memory").join("HISTORY.md"),
    )
    .unwrap();
    assert_eq!(history.matches("grocery planning").count(), 1);

    // Retrying against the already-trimmed tail is a no-op: no extra model
    // call, no duplicate history entry.
    let ran_again = harness.agent.consolidate("cli:1", false).await.unwrap();
    assert!(!ran_again);
    assert_eq!(provider.calls(), 1);
    let history = std::fs::read_to_string(
        memory_dir(&harness).join("memory").join("HISTORY.md"),
    )
    .unwrap();
    assert_eq!(history.matches("grocery planning").count(), 1);
}

#[tokio::test]
async fn archive_all_empties_the_session() {
    let consolidation_json = serde_json::json!({
        "history_entry": "[2025-06-01 10:00] Archived conversation.",
        "memory_update": "nothing new"
    })
    .to_string();
    let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_outcome(
        &consolidation_json,
    ))]));

    let harness = make_agent(provider, ToolRegistry::new(), 8);
    for i in 0..3 {
        harness
            .agent
            .sessions
            .append(
                "cli:1",
                &coracle_core::session::SessionMessage::new("user", &format!("m{i}")),
            )
            .await
            .unwrap();
    }

    assert!(harness.agent.consolidate("cli:1", true).await.unwrap());
    let session = harness.agent.sessions.load("cli:1").await.unwrap();
    assert!(session.messages.is_empty());
    assert_eq!(session.consolidated_count, 3);
}

// ---------------------------------------------------------------------------
// Subagents
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subagent_reports_back_to_parent_conversation() {
    use coracle_core::agent::SubagentManager;

    let workspace = tempfile::tempdir().unwrap();
    let sessions_dir = tempfile::tempdir().unwrap();

    let provider: Arc<dyn ChatProvider> = Arc::new(ScriptedProvider::new(vec![Ok(text_outcome(
        "research complete",
    ))]));
    let mut models: HashMap<String, (Arc<dyn ChatProvider>, String)> = HashMap::new();
    models.insert("default".into(), (provider, "mock".into()));

    let bus = Arc::new(MessageBus::new());
    let mut out_rx = bus.subscribe_outbound().await;

    let manager = SubagentManager::new(
        ModelPool::new(models),
        workspace.path().to_path_buf(),
        sessions_dir.path().to_path_buf(),
        bus.clone(),
        coracle_config::Config::default(),
    );

    let id = manager
        .spawn("look into crabs", "crab-research", "cli", "1")
        .await
        .unwrap();

    // The result arrives as an outbound message addressed to the parent
    // conversation, tagged with the subagent id.
    let msg = recv_outbound(&mut out_rx).await.unwrap();
    assert_eq!(msg.conversation_key(), "cli:1");
    assert!(msg.content.contains("research complete"));
    assert!(msg.content.contains("crab-research"));
    assert_eq!(
        msg.metadata.get("subagent_id"),
        Some(&serde_json::Value::String(id.clone()))
    );
    assert_eq!(
        msg.metadata.get("status"),
        Some(&serde_json::Value::String("completed".into()))
    );

    // Finished subagents leave the running set.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.list().await.is_empty());
    assert!(!manager.cancel(&id).await);
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

async fn start_router(agent: Arc<AgentLoop>, bus: Arc<MessageBus>) {
    let router = Arc::new(ConversationRouter::new(agent, bus));
    tokio::spawn(router.run());
    // Let the router subscribe before tests publish
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn router_processes_one_conversation_in_order() {
    let provider = Arc::new(EchoProvider {
        slow_delay: Duration::from_millis(100),
    });
    let harness = make_agent(provider, ToolRegistry::new(), 200);

    let bus = Arc::new(MessageBus::new());
    let mut out_rx = bus.subscribe_outbound().await;
    start_router(harness.agent.clone(), bus.clone()).await;

    // "slow" forces the first turn to take longer than the rest; ordering
    // must hold anyway.
    for content in ["slow first", "second", "third"] {
        bus.publish_inbound(coracle_core::bus::InboundMessage::new(
            "cli", "user", "a", content,
        ))
        .await;
    }

    let mut responses = Vec::new();
    for _ in 0..3 {
        responses.push(recv_outbound(&mut out_rx).await.unwrap().content);
    }
    assert_eq!(
        responses,
        vec!["echo: slow first", "echo: second", "echo: third"]
    );
}

#[tokio::test]
async fn router_runs_distinct_conversations_concurrently() {
    let provider = Arc::new(EchoProvider {
        slow_delay: Duration::from_millis(300),
    });
    let harness = make_agent(provider, ToolRegistry::new(), 200);

    let bus = Arc::new(MessageBus::new());
    let mut out_rx = bus.subscribe_outbound().await;
    start_router(harness.agent.clone(), bus.clone()).await;

    bus.publish_inbound(coracle_core::bus::InboundMessage::new(
        "cli",
        "user",
        "a",
        "slow question",
    ))
    .await;
    bus.publish_inbound(coracle_core::bus::InboundMessage::new(
        "cli", "user", "b", "quick one",
    ))
    .await;

    // B's answer must land while A is still thinking.
    let first = recv_outbound(&mut out_rx).await.unwrap();
    assert_eq!(first.chat_id, "b");
    let second = recv_outbound(&mut out_rx).await.unwrap();
    assert_eq!(second.chat_id, "a");
}

#[tokio::test]
async fn router_publishes_exactly_one_outbound_per_turn() {
    let listing_dir = tempfile::tempdir().unwrap();
    std::fs::write(listing_dir.path().join("a.txt"), "").unwrap();

    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(tool_call_outcome(
            "list_dir",
            serde_json::json!({"path": listing_dir.path().to_str().unwrap()}),
        )),
        Ok(text_outcome("one file")),
    ]));
    let mut tools = ToolRegistry::new();
    tools.register(Box::new(ListDirTool::new(None))).unwrap();
    let harness = make_agent(provider, tools, 200);

    let bus = Arc::new(MessageBus::new());
    let mut out_rx = bus.subscribe_outbound().await;
    start_router(harness.agent.clone(), bus.clone()).await;

    bus.publish_inbound(coracle_core::bus::InboundMessage::new(
        "cli",
        "user",
        "1",
        "list files in /tmp",
    ))
    .await;

    let msg = recv_outbound(&mut out_rx).await.unwrap();
    assert_eq!(msg.conversation_key(), "cli:1");
    assert_eq!(msg.content, "one file");

    // No second outbound for this turn
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(out_rx.try_recv().is_err());
}

#[tokio::test]
async fn router_new_command_archives_and_clears_the_session() {
    let consolidation_json = serde_json::json!({
        "history_entry": "[2025-06-01 10:00] Wrapped up the conversation.",
        "memory_update": "nothing new"
    })
    .to_string();
    let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_outcome(
        &consolidation_json,
    ))]));
    let harness = make_agent(provider, ToolRegistry::new(), 200);

    for i in 0..3 {
        harness
            .agent
            .sessions
            .append(
                "cli:1",
                &coracle_core::session::SessionMessage::new("user", &format!("m{i}")),
            )
            .await
            .unwrap();
    }

    let bus = Arc::new(MessageBus::new());
    let mut out_rx = bus.subscribe_outbound().await;
    start_router(harness.agent.clone(), bus.clone()).await;

    bus.publish_inbound(coracle_core::bus::InboundMessage::new(
        "cli", "user", "1", "/new",
    ))
    .await;

    let msg = recv_outbound(&mut out_rx).await.unwrap();
    assert!(msg.content.contains("New session started"));

    let session = harness.agent.sessions.load("cli:1").await.unwrap();
    assert!(session.messages.is_empty());
    assert_eq!(session.consolidated_count, 3);
}

#[tokio::test]
async fn router_help_command_short_circuits_the_agent() {
    let provider = Arc::new(ScriptedProvider::with_fallback(Vec::new(), || {
        panic!("model must not be called for /help")
    }));
    let harness = make_agent(provider, ToolRegistry::new(), 200);

    let bus = Arc::new(MessageBus::new());
    let mut out_rx = bus.subscribe_outbound().await;
    start_router(harness.agent.clone(), bus.clone()).await;

    bus.publish_inbound(coracle_core::bus::InboundMessage::new(
        "cli", "user", "1", "/help",
    ))
    .await;

    let msg = recv_outbound(&mut out_rx).await.unwrap();
    assert!(msg.content.contains("/new"));
}
