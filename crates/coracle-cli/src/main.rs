use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use coracle_channels::manager::ChannelManager;
use coracle_config::{find_config_path, load_config, resolve_workspace, save_config};
use coracle_core::agent::subagent::SubagentManager;
use coracle_core::agent::{AgentLoop, Consolidator, ContextBuilder};
use coracle_core::bus::MessageBus;
use coracle_core::cron::{CronSchedule, CronService};
use coracle_core::heartbeat::HeartbeatService;
use coracle_core::provider::{ChatProvider, ModelPool, RigProvider};
use coracle_core::router::{ConversationRouter, OriginAware};
use coracle_core::session::SessionStore;
use coracle_core::tools::cron::CronTool;
use coracle_core::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use coracle_core::tools::message::MessageTool;
use coracle_core::tools::shell::ExecTool;
use coracle_core::tools::spawn::SpawnTool;
use coracle_core::tools::web::{WebFetchTool, WebSearchTool};
use coracle_core::tools::{Tool, ToolRegistry};
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::client::{CompletionClient, Nothing};
use rig::providers::{anthropic, groq, ollama, openai, openrouter};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::Mutex;

#[derive(Parser)]
#[command(name = "coracle", about = "Personal AI assistant runtime", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run interactive CLI chat
    Agent {
        /// Single message mode (non-interactive)
        #[arg(short, long)]
        message: Option<String>,

        /// Session key for conversation tracking
        #[arg(short, long, default_value = "cli:interactive")]
        session: String,
    },
    /// Start gateway: channels, router, cron, and heartbeat
    Serve,
    /// Initialize configuration and workspace
    Onboard,
    /// Show system status and configuration
    Status,
    /// Manage scheduled cron jobs
    Cron {
        #[command(subcommand)]
        action: CronCommands,
    },
}

#[derive(Subcommand)]
enum CronCommands {
    /// List scheduled jobs
    List {
        /// Include disabled jobs
        #[arg(short, long)]
        all: bool,
    },
    /// Add a new scheduled job
    Add {
        /// Job name
        #[arg(long)]
        name: String,
        /// Message to send when triggered
        #[arg(long)]
        message: String,
        /// Interval in seconds (recurring)
        #[arg(long)]
        every: Option<u64>,
        /// Cron expression (e.g. "0 9 * * *")
        #[arg(long)]
        cron: Option<String>,
        /// One-time execution at ISO datetime (e.g. "2025-06-01T09:00:00Z")
        #[arg(long)]
        at: Option<String>,
    },
    /// Remove a job by ID
    Remove {
        /// Job ID to remove
        job_id: String,
    },
    /// Enable or disable a job
    Enable {
        /// Job ID
        job_id: String,
        /// Disable instead of enable
        #[arg(long)]
        disable: bool,
    },
    /// Fire a job immediately, regardless of its schedule
    Run {
        /// Job ID
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(base_filter))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(find_config_path);

    match cli.command {
        Commands::Onboard => return run_onboard(&config_path),
        Commands::Status => return run_status(&config_path),
        Commands::Cron { action } => {
            return run_cron_command(action).await;
        }
        _ => {}
    }

    let config = load_config(&config_path)?;
    let workspace = resolve_workspace(&config.agents.defaults.workspace);
    std::fs::create_dir_all(&workspace)?;

    match cli.command {
        Commands::Agent { message, session } => {
            let bus = Arc::new(MessageBus::new());
            let runtime = build_runtime(&config, &workspace, bus)?;

            // Point context-aware tools at the CLI conversation
            let (channel, chat_id) = session.split_once(':').unwrap_or(("cli", session.as_str()));
            for tool in &runtime.origin_tools {
                tool.set_origin(channel, chat_id).await;
            }

            if let Some(msg) = message {
                run_single_message(&runtime.agent, &session, &msg).await?;
            } else {
                run_interactive(&runtime.agent, &session).await?;
            }
        }
        Commands::Serve => {
            run_gateway(&config, &workspace).await?;
        }
        _ => unreachable!(),
    }

    Ok(())
}

/// Resolve an API key from config, falling back to an environment variable.
fn resolve_api_key(
    provider_cfg: &Option<coracle_config::ProviderConfig>,
    env_var: &str,
) -> Option<String> {
    provider_cfg
        .as_ref()
        .and_then(|c| c.api_key.clone())
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.is_empty()))
}

/// Create a completion model for a specific provider + model combination.
///
/// Errors clearly if provider is unknown or has no API key.
#[allow(deprecated)]
fn create_model_for(
    provider: &str,
    model_name: &str,
    config: &coracle_config::Config,
) -> Result<CompletionModelHandle<'static>> {
    if provider.is_empty() || model_name.is_empty() {
        anyhow::bail!(
            "No provider/model configured.\n\
             Valid providers: anthropic, openai, openrouter, ollama, groq"
        );
    }

    match provider {
        "anthropic" => {
            let key = resolve_api_key(&config.providers.anthropic, "ANTHROPIC_API_KEY")
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Anthropic provider selected but no API key found. \
                     Set providers.anthropic.apiKey in config.json or ANTHROPIC_API_KEY env var."
                    )
                })?;
            let client: anthropic::Client = anthropic::Client::builder()
                .api_key(&key)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Anthropic client: {e}"))?;
            let model = client.completion_model(model_name).with_prompt_caching();
            tracing::info!(
                "Using Anthropic provider with model '{model_name}' (prompt caching enabled)"
            );
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "openai" => {
            let key =
                resolve_api_key(&config.providers.openai, "OPENAI_API_KEY").ok_or_else(|| {
                    anyhow::anyhow!(
                        "OpenAI provider selected but no API key found. \
                     Set providers.openai.apiKey in config.json or OPENAI_API_KEY env var."
                    )
                })?;
            let mut builder = openai::CompletionsClient::builder().api_key(&key);
            if let Some(ref base) = config
                .providers
                .openai
                .as_ref()
                .and_then(|c| c.api_base.clone())
                .filter(|b| !b.is_empty())
            {
                builder = builder.base_url(base);
                tracing::info!("Using OpenAI provider with custom base: {base}");
            }
            let client: openai::CompletionsClient = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create OpenAI client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using OpenAI provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "openrouter" => {
            let key = resolve_api_key(&config.providers.openrouter, "OPENROUTER_API_KEY")
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "OpenRouter provider selected but no API key found. \
                     Set providers.openrouter.apiKey in config.json or OPENROUTER_API_KEY env var."
                    )
                })?;
            let client: openrouter::Client = openrouter::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create OpenRouter client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using OpenRouter provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "ollama" => {
            let mut builder = ollama::Client::builder().api_key(Nothing);
            if let Some(ref base) = config
                .providers
                .ollama
                .as_ref()
                .and_then(|c| c.api_base.clone())
                .filter(|b| !b.is_empty())
            {
                builder = builder.base_url(base);
            }
            let client: ollama::Client = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Ollama client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using Ollama provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "groq" => {
            let key = resolve_api_key(&config.providers.groq, "GROQ_API_KEY").ok_or_else(|| {
                anyhow::anyhow!(
                    "Groq provider selected but no API key found. \
                     Set providers.groq.apiKey in config.json or GROQ_API_KEY env var."
                )
            })?;
            let client: groq::Client = groq::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create Groq client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using Groq provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        other => {
            anyhow::bail!(
                "Unknown provider '{other}'. \
                 Valid providers: anthropic, openai, openrouter, ollama, groq"
            );
        }
    }
}

/// Build a ModelPool from config. Requires a "default" tier.
fn create_model_pool(config: &coracle_config::Config) -> Result<ModelPool> {
    if config.agents.models.is_empty() {
        anyhow::bail!(
            "No models configured. Set agents.models in config.json with at least a \"default\" entry.\n\
             Example:\n  \
             \"models\": {{ \"default\": {{ \"provider\": \"ollama\", \"model\": \"llama3\" }} }}"
        );
    }
    if !config.agents.models.contains_key("default") {
        anyhow::bail!("config.agents.models must contain at least a \"default\" entry.");
    }

    let mut models: HashMap<String, (Arc<dyn ChatProvider>, String)> = HashMap::new();
    for (tier, model_ref) in &config.agents.models {
        let handle = create_model_for(&model_ref.provider, &model_ref.model, config)
            .map_err(|e| anyhow::anyhow!("Failed to create model for tier '{tier}': {e}"))?;
        tracing::info!(
            "Model tier '{tier}': {} / {}",
            model_ref.provider,
            model_ref.model
        );
        models.insert(
            tier.clone(),
            (
                Arc::new(RigProvider::new(handle)) as Arc<dyn ChatProvider>,
                model_ref.model.clone(),
            ),
        );
    }

    Ok(ModelPool::new(models))
}

/// Wrapper to register an `Arc<T: Tool>` in the ToolRegistry (which expects `Box<dyn Tool>`).
struct ArcTool<T: Tool>(Arc<T>);

#[async_trait::async_trait]
impl<T: Tool + 'static> Tool for ArcTool<T> {
    fn name(&self) -> &str {
        self.0.name()
    }
    fn description(&self) -> &str {
        self.0.description()
    }
    fn parameters_schema(&self) -> serde_json::Value {
        self.0.parameters_schema()
    }
    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        self.0.execute(params).await
    }
}

/// Everything the gateway and REPL share.
struct Runtime {
    agent: Arc<AgentLoop>,
    cron_service: Arc<Mutex<CronService>>,
    origin_tools: Vec<Arc<dyn OriginAware>>,
}

fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".coracle")
}

/// Wire up the agent loop with its full tool set.
fn build_runtime(
    config: &coracle_config::Config,
    workspace: &Path,
    bus: Arc<MessageBus>,
) -> Result<Runtime> {
    let defaults = &config.agents.defaults;
    let models = create_model_pool(config)?;

    let sessions_dir = state_dir().join("sessions");
    let sessions = Arc::new(SessionStore::new(sessions_dir.clone()));
    let context = ContextBuilder::new(workspace, defaults.memory_window);

    let mut tools = ToolRegistry::new();
    let allowed_dir: Option<PathBuf> = if config.tools.restrict_to_workspace {
        Some(workspace.to_path_buf())
    } else {
        None
    };
    tools.register(Box::new(ReadFileTool::new(allowed_dir.clone())))?;
    tools.register(Box::new(WriteFileTool::new(allowed_dir.clone())))?;
    tools.register(Box::new(EditFileTool::new(allowed_dir.clone())))?;
    tools.register(Box::new(ListDirTool::new(allowed_dir)))?;
    tools.register(Box::new(ExecTool::new(
        workspace.to_path_buf(),
        config.tools.exec.timeout_secs,
        config.tools.restrict_to_workspace,
    )))?;

    let brave_api_key = if config.tools.web.search.api_key.is_empty() {
        std::env::var("BRAVE_API_KEY").unwrap_or_default()
    } else {
        config.tools.web.search.api_key.clone()
    };
    tools.register(Box::new(WebSearchTool::new(
        brave_api_key,
        config.tools.web.search.max_results,
    )))?;
    tools.register(Box::new(WebFetchTool::new(50_000)))?;

    // Message tool
    let message_tool = Arc::new(MessageTool::new(bus.clone()));
    tools.register(Box::new(ArcTool(message_tool.clone())))?;

    // Subagent manager + spawn tool
    let subagent_manager = Arc::new(SubagentManager::new(
        models.clone(),
        workspace.to_path_buf(),
        sessions_dir,
        bus.clone(),
        config.clone(),
    ));
    let spawn_tool = Arc::new(SpawnTool::new(subagent_manager));
    tools.register(Box::new(ArcTool(spawn_tool.clone())))?;

    // Cron service + cron tool
    let cron_store_path = state_dir().join("cron").join("jobs.json");
    let cron_service = Arc::new(Mutex::new(CronService::new(cron_store_path, bus.clone())));
    let cron_tool = Arc::new(CronTool::new(cron_service.clone()));
    tools.register(Box::new(ArcTool(cron_tool.clone())))?;

    let agent = Arc::new(AgentLoop {
        models,
        sessions,
        context,
        tools: Arc::new(tools),
        consolidator: Consolidator::new(workspace, defaults.memory_window / 2),
        max_iterations: defaults.max_tool_iterations as usize,
        temperature: defaults.temperature as f64,
        max_tokens: defaults.max_tokens as u64,
        provider_retries: defaults.provider_retries,
    });

    let origin_tools: Vec<Arc<dyn OriginAware>> = vec![message_tool, spawn_tool, cron_tool];

    Ok(Runtime {
        agent,
        cron_service,
        origin_tools,
    })
}

/// Run the full gateway: channels + conversation router + cron + heartbeat.
async fn run_gateway(config: &coracle_config::Config, workspace: &Path) -> Result<()> {
    tracing::info!("Starting gateway...");

    let bus = Arc::new(MessageBus::new());
    let runtime = build_runtime(config, workspace, bus.clone())?;

    // Router first, so nothing published later is dropped
    let mut router = ConversationRouter::new(runtime.agent.clone(), bus.clone());
    for tool in &runtime.origin_tools {
        router.add_origin_tool(tool.clone());
    }
    let router = Arc::new(router);
    let router_handle = tokio::spawn(router.run());

    // Give the router a chance to subscribe before producers start
    tokio::task::yield_now().await;

    if config.cron.enabled {
        let mut cron = runtime.cron_service.lock().await;
        if let Err(e) = cron.start().await {
            tracing::warn!("Failed to start cron service: {e}");
        }
    }

    let mut heartbeat = HeartbeatService::new(
        workspace.to_path_buf(),
        bus.clone(),
        Some(config.heartbeat.interval_secs),
    );
    if config.heartbeat.enabled {
        heartbeat.start();
    }

    // Channel adapters register here; none ship in-tree, so a bare gateway
    // serves cron/heartbeat traffic only.
    let mut channel_manager = ChannelManager::new(bus.clone());
    let enabled = channel_manager.enabled_channels().await;
    if enabled.is_empty() {
        tracing::warn!("No channels registered. Gateway serves cron/heartbeat traffic only.");
    }
    channel_manager.start_all().await?;

    tracing::info!("Gateway running. Press Ctrl-C to stop.");
    tokio::select! {
        _ = router_handle => {
            tracing::warn!("Router stopped unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
        }
    }

    channel_manager.stop_all().await?;
    heartbeat.stop();
    runtime.cron_service.lock().await.stop();
    tracing::info!("Gateway stopped");

    Ok(())
}

async fn run_single_message(agent: &AgentLoop, session_key: &str, message: &str) -> Result<()> {
    let outcome = agent.process_message(session_key, message, None).await?;
    println!("{}", outcome.response);
    if outcome.needs_consolidation {
        agent.consolidate(session_key, false).await?;
    }
    Ok(())
}

async fn run_interactive(agent: &AgentLoop, session_key: &str) -> Result<()> {
    let history_dir = state_dir().join("history");
    std::fs::create_dir_all(&history_dir)?;
    let history_path = history_dir.join("cli_history");

    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    println!("coracle interactive mode (type /help for commands, Ctrl-D to quit)");
    println!();

    loop {
        let readline = rl.readline("you> ");
        match readline {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(input);

                if matches!(input, "exit" | "quit" | "/exit" | "/quit" | ":q") {
                    break;
                }

                match input {
                    "/help" => {
                        println!("Commands:");
                        println!("  /new   - Start a new conversation (consolidates memory)");
                        println!("  /help  - Show this help");
                        println!("  /quit  - Exit");
                        println!();
                        continue;
                    }
                    "/new" => {
                        println!("Consolidating memory...");
                        if let Err(e) = agent.consolidate(session_key, true).await {
                            eprintln!("Consolidation failed: {e}");
                        }
                        if let Err(e) = agent.sessions.clear(session_key).await {
                            eprintln!("Failed to clear session: {e}");
                        }
                        println!("New session started.");
                        println!();
                        continue;
                    }
                    _ => {}
                }

                match agent.process_message(session_key, input, None).await {
                    Ok(outcome) => {
                        println!();
                        println!("{}", outcome.response);
                        println!();
                        if outcome.needs_consolidation {
                            if let Err(e) = agent.consolidate(session_key, false).await {
                                tracing::warn!("Consolidation failed: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        eprintln!("Error: {e}");
                        println!();
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Error: {err}");
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}

/// Initialize configuration and workspace with default templates.
fn run_onboard(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        println!("To reset, delete it and run `coracle onboard` again.");
    } else {
        let mut config = coracle_config::Config::default();
        config.agents.models.insert(
            "default".into(),
            coracle_config::ModelRef {
                provider: "ollama".into(),
                model: "llama3".into(),
            },
        );
        save_config(config_path, &config)?;
        println!("Wrote config: {}", config_path.display());
    }

    let workspace = resolve_workspace(&coracle_config::Config::default().agents.defaults.workspace);
    std::fs::create_dir_all(workspace.join("memory"))?;
    std::fs::create_dir_all(workspace.join("skills"))?;

    let soul = workspace.join("SOUL.md");
    if !soul.exists() {
        std::fs::write(
            &soul,
            "# Persona\n\nDescribe how your assistant should behave here.\n",
        )?;
    }

    println!("Workspace ready: {}", workspace.display());
    println!("Next: set your provider API key and run `coracle agent`.");
    Ok(())
}

/// Show system status and configuration.
fn run_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let workspace = resolve_workspace(&config.agents.defaults.workspace);

    println!("Config:    {}", config_path.display());
    println!("Workspace: {}", workspace.display());
    println!();

    if config.agents.models.is_empty() {
        println!("Models:    (none configured)");
    } else {
        println!("Models:");
        for (tier, model_ref) in &config.agents.models {
            println!("  {tier}: {} / {}", model_ref.provider, model_ref.model);
        }
    }
    println!();

    let sessions = SessionStore::new(state_dir().join("sessions"));
    let infos = sessions.list_sessions();
    if infos.is_empty() {
        println!("Sessions:  (none)");
    } else {
        println!("Sessions:");
        for info in infos {
            println!("  {} (created {})", info.key, info.created_at);
        }
    }

    Ok(())
}

/// Manage cron jobs from the command line. The service runs against the
/// persisted store; published messages go nowhere without a gateway.
async fn run_cron_command(action: CronCommands) -> Result<()> {
    let bus = Arc::new(MessageBus::new());
    let store_path = state_dir().join("cron").join("jobs.json");
    let mut service = CronService::new(store_path, bus);
    service.start().await?;

    match action {
        CronCommands::List { all } => {
            let jobs = service.list_jobs(all);
            if jobs.is_empty() {
                println!("No cron jobs.");
            } else {
                for job in jobs {
                    let state = if job.enabled { "enabled" } else { "disabled" };
                    println!("[{}] '{}' ({state})", job.id, job.name);
                }
            }
        }
        CronCommands::Add {
            name,
            message,
            every,
            cron,
            at,
        } => {
            let schedule = if let Some(secs) = every {
                CronSchedule::every(secs as i64 * 1000)
            } else if let Some(expr) = cron {
                CronSchedule::cron(&expr)
            } else if let Some(at_str) = at {
                let dt = chrono::DateTime::parse_from_rfc3339(&at_str)
                    .map_err(|e| anyhow::anyhow!("invalid datetime '{at_str}': {e}"))?;
                CronSchedule::at(dt.timestamp_millis())
            } else {
                anyhow::bail!("specify one of --every, --cron, or --at");
            };

            let job = service.add_job(&name, schedule, &message, None, None)?;
            println!("Added job '{}' (ID: {})", job.name, job.id);
        }
        CronCommands::Remove { job_id } => {
            if service.remove_job(&job_id) {
                println!("Removed job {job_id}");
            } else {
                println!("Job {job_id} not found");
            }
        }
        CronCommands::Enable { job_id, disable } => {
            match service.enable_job(&job_id, !disable) {
                Some(job) => println!(
                    "Job '{}' is now {}",
                    job.name,
                    if job.enabled { "enabled" } else { "disabled" }
                ),
                None => println!("Job {job_id} not found"),
            }
        }
        CronCommands::Run { job_id } => {
            service.run_job_now(&job_id).await?;
            println!("Fired job {job_id}");
        }
    }

    service.stop();
    Ok(())
}
