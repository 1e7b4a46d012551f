//! switchyard CLI - interactive chat, one-shot requests, and routing commands.
//!
//! Usage:
//!   switchyard chat          - Start an interactive chat session
//!   switchyard ask "..."     - Process one message and print the JSON response
//!   switchyard tools         - Print the tool schema export
//!   switchyard models        - Show the model catalog with live availability
//!   switchyard use <model>   - Persist a preferred model
//!   switchyard onboard       - Create a default configuration
//!   switchyard status        - Show current configuration and health

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use switchyard_core::agent::{AgentConfig, Orchestrator, ProcessRequest};
use switchyard_core::config::Config;
use switchyard_core::provider::openai::OpenAiProvider;
use switchyard_core::provider::types::ChatMessage;
use switchyard_core::provider::ProviderSet;
use switchyard_core::response::{ApiResponse, Status};
use switchyard_core::router::ledger::UsageLedger;
use switchyard_core::router::state::{RouterState, StateStore};
use switchyard_core::router::ProviderRouter;
use switchyard_core::tools::filesystem::{
    FileExistsTool, FileLimits, FileSandbox, ListDirTool, ReadFileTool, WriteFileTool,
};
use switchyard_core::tools::shell::{CommandPolicy, TerminalTool};
use switchyard_core::tools::web::{WebFetchTool, WebSearchTool};
use switchyard_core::tools::{ToolExecutor, ToolRegistry};

#[derive(Parser)]
#[command(
    name = "switchyard",
    version,
    about = "Tool-calling assistant with usage-aware model routing",
    long_about = "switchyard - routes each request to a model with headroom, lets it run \
                  sandboxed tools, and returns one structured response."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat {
        /// Session name, echoed in logs
        #[arg(short, long, default_value = "default")]
        session: String,

        /// Preferred model for this session (must be in the catalog)
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Process one message and print the JSON response
    Ask {
        /// The message to send
        message: String,

        /// Preferred model for this request
        #[arg(short, long)]
        model: Option<String>,

        /// Opaque session identifier
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Print the tool schema export
    Tools,

    /// Show the model catalog with live availability
    Models,

    /// Persist a preferred model
    Use {
        /// Model id from the catalog
        model: String,
    },

    /// Create or reset the default configuration
    Onboard,

    /// Show configuration status and health
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Chat { session, model }) => cmd_chat(&session, model.as_deref()).await?,
        Some(Commands::Ask {
            message,
            model,
            session,
        }) => cmd_ask(message, model, session).await?,
        Some(Commands::Tools) => cmd_tools()?,
        Some(Commands::Models) => cmd_models()?,
        Some(Commands::Use { model }) => cmd_use(&model)?,
        Some(Commands::Onboard) => cmd_onboard()?,
        Some(Commands::Status) => cmd_status()?,
        None => cmd_chat("default", None).await?,
    }

    Ok(())
}

// ── Shared Setup ────────────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<()> {
    if let Err(errors) = config.validate() {
        eprintln!("\n  \x1b[31mConfiguration errors:\x1b[0m");
        for e in &errors {
            eprintln!("     • {}", e);
        }
        eprintln!();
        anyhow::bail!("Fix the above {} error(s) in config.json", errors.len());
    }
    Ok(())
}

/// Router over the configured catalog; the default model seeds the
/// persisted preference.
fn build_router(config: &Config) -> Arc<ProviderRouter> {
    let default_model = &config.agents.defaults.model;
    let default_provider = config
        .models
        .iter()
        .find(|m| &m.id == default_model)
        .map(|m| m.provider.as_str())
        .unwrap_or("groq");

    let store = StateStore::new(
        config.state_path(),
        RouterState::new(default_provider, default_model),
        Duration::from_secs(config.router.state_cache_ttl_seconds),
    );
    let ledger = Arc::new(UsageLedger::new(config.router.backoff.policy()));
    Arc::new(ProviderRouter::new(config.models.clone(), ledger, store))
}

fn build_registry(config: &Config, client: &reqwest::Client) -> Result<ToolRegistry> {
    let workspace = config.workspace_path();
    let sandbox = Arc::new(
        FileSandbox::new(&workspace, FileLimits::from(&config.tools.files))
            .with_context(|| format!("cannot prepare workspace {}", workspace.display()))?,
    );
    let policy = CommandPolicy::from_config(&config.tools.exec)
        .context("invalid pattern in tools.exec.deniedPatterns")?;
    let web_timeout = Duration::from_secs(config.tools.web.timeout_seconds.max(1));

    let mut tools = ToolRegistry::new();
    tools.register(Box::new(ReadFileTool::new(Arc::clone(&sandbox))))?;
    tools.register(Box::new(WriteFileTool::new(Arc::clone(&sandbox))))?;
    tools.register(Box::new(ListDirTool::new(Arc::clone(&sandbox))))?;
    tools.register(Box::new(FileExistsTool::new(Arc::clone(&sandbox))))?;
    tools.register(Box::new(TerminalTool::new(policy, Arc::clone(&sandbox))))?;
    tools.register(Box::new(WebFetchTool::new(client.clone(), &config.tools.web)))?;
    if !config.tools.web_search.api_key.is_empty() {
        tools.register(Box::new(WebSearchTool::new(
            client.clone(),
            &config.tools.web_search,
            web_timeout,
        )))?;
    }
    Ok(tools)
}

/// Load config, validate it, and build a fully wired `Orchestrator`.
fn setup_orchestrator(config: &Config) -> Result<Orchestrator> {
    let active = config.providers.find_all_active();
    if active.is_empty() {
        anyhow::bail!(
            "No LLM provider configured with a real API key. \
             Run `switchyard onboard` first, then edit config.json"
        );
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(
            config.agents.defaults.request_timeout_seconds.max(1),
        ))
        .build()
        .context("failed to build HTTP client")?;

    let mut providers = ProviderSet::new();
    for (name, entry) in active {
        let p = OpenAiProvider::new(name, &entry.api_key, entry.api_base.as_deref(), client.clone());
        providers.insert(name, Arc::new(p));
    }

    let registry = build_registry(config, &client)?;
    Ok(Orchestrator::new(
        build_router(config),
        providers,
        ToolExecutor::new(Arc::new(registry)),
        AgentConfig::from_config(config),
    ))
}

/// Run one request, cancelling it on Ctrl+C.
async fn run_request(
    orchestrator: &Orchestrator,
    request: &ProcessRequest,
    history: &[ChatMessage],
) -> ApiResponse {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let response = orchestrator.handle(request, history, &cancel).await;
    watcher.abort();
    response
}

// ── Commands ────────────────────────────────────────────────────────

async fn cmd_chat(session: &str, model: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    validate_config(&config)?;
    let orchestrator = setup_orchestrator(&config)?;
    let preference = orchestrator.router().preference();

    println!();
    println!("  switchyard v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Providers: {} | Model: {}",
        config
            .providers
            .find_all_active()
            .iter()
            .map(|(n, _)| *n)
            .collect::<Vec<_>>()
            .join(", "),
        model.unwrap_or(&preference.model_id)
    );
    println!(
        "  Session: {} | Workspace: {}",
        session,
        orchestrator.config().workspace.display()
    );
    println!();
    println!("  Type your message, or /quit to exit. Ctrl+C cancels a running request.");
    println!("  ─────────────────────────────────────");
    println!();

    let mut history: Vec<ChatMessage> = Vec::new();
    let stdin = io::stdin();
    loop {
        print!("  \x1b[36m>\x1b[0m ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" | "/q" => {
                println!("  Goodbye!");
                break;
            }
            "/clear" => {
                history.clear();
                println!("  History cleared.");
                continue;
            }
            "/models" => {
                print_models(orchestrator.router());
                continue;
            }
            _ => {}
        }

        let request = ProcessRequest {
            message: input.to_string(),
            model_id: model.map(|m| m.to_string()),
            session_id: Some(session.to_string()),
        };
        println!();
        let response = run_request(&orchestrator, &request, &history).await;
        print_response(&response);

        if let Some(text) = response.response() {
            history.push(ChatMessage::user(input));
            history.push(ChatMessage::assistant(text));
        }
    }

    Ok(())
}

async fn cmd_ask(message: String, model: Option<String>, session: Option<String>) -> Result<()> {
    let config = Config::load()?;
    validate_config(&config)?;
    let orchestrator = setup_orchestrator(&config)?;

    let request = ProcessRequest {
        message,
        model_id: model,
        session_id: session,
    };
    let response = run_request(&orchestrator, &request, &[]).await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if response.status() == Status::Error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_tools() -> Result<()> {
    let config = Config::load()?;
    let registry = build_registry(&config, &reqwest::Client::new())?;
    println!("{}", serde_json::to_string_pretty(&registry.export_schema())?);
    Ok(())
}

fn cmd_models() -> Result<()> {
    let config = Config::load()?;
    print_models(&build_router(&config));
    Ok(())
}

fn cmd_use(model: &str) -> Result<()> {
    let config = Config::load()?;
    let router = build_router(&config);
    let state = router
        .set_preference(model)
        .with_context(|| format!("cannot switch to '{}'", model))?;
    println!(
        "  Preferred model set to {} ({}).",
        state.model_id, state.provider
    );
    Ok(())
}

fn cmd_onboard() -> Result<()> {
    let path = Config::write_default_template()?;
    println!();
    println!("  Configuration created at:");
    println!("     {}", path.display());
    println!();
    println!("  Next steps:");
    println!("  1. Edit the config file and add your API key");
    println!("  2. Run `switchyard chat` to start chatting");
    println!();
    Ok(())
}

fn cmd_status() -> Result<()> {
    let config_path = Config::default_path();
    let config = Config::load()?;

    println!();
    println!("  switchyard status");
    println!("  ─────────────────────────────────────");

    if config_path.exists() {
        println!("  Config:     {}", config_path.display());
    } else {
        println!("  Config:     not found (run `switchyard onboard`)");
    }

    let active = config.providers.find_all_active();
    if active.is_empty() {
        println!("  Providers:  none configured");
    } else {
        let names: Vec<&str> = active.iter().map(|(n, _)| *n).collect();
        println!("  Providers:  {}", names.join(", "));
    }

    let router = build_router(&config);
    let preference = router.preference();
    println!(
        "  Preferred:  {} ({})",
        preference.model_id, preference.provider
    );
    println!("  Catalog:    {} models", router.catalog().len());
    println!("  State file: {}", config.state_path().display());

    let ws = config.workspace_path();
    println!(
        "  Workspace:  {} {}",
        ws.display(),
        if ws.exists() { "" } else { "(will be created)" }
    );

    if let Err(errors) = config.validate() {
        println!();
        for e in errors {
            println!("  \x1b[33m! {}\x1b[0m", e);
        }
    }
    println!();
    Ok(())
}

// ── Output ──────────────────────────────────────────────────────────

fn print_models(router: &ProviderRouter) {
    let preferred = router.preference().model_id;
    println!();
    println!(
        "  {:<2}{:<40} {:<12} {:>6} {:>8} {:>7} {:>5}  {}",
        "", "MODEL", "PROVIDER", "RPM", "TPM", "RPD", "PRIO", "STATUS"
    );
    for s in router.snapshot() {
        let marker = if s.model.id == preferred { "*" } else { "" };
        let status = match s.blacklisted_until {
            Some(until) => format!("blacklisted until {}", until.format("%H:%M:%S UTC")),
            None if s.available => format!("available ({} req this minute)", s.req_this_minute),
            None => "at limit".to_string(),
        };
        println!(
            "  {:<2}{:<40} {:<12} {:>6} {:>8} {:>7} {:>5}  {}",
            marker,
            s.model.id,
            s.model.provider,
            s.model.rpm,
            s.model.tpm,
            s.model.rpd,
            s.model.priority_score,
            status
        );
    }
    println!();
}

fn print_response(response: &ApiResponse) {
    for tool in response.tools_used() {
        println!("  \x1b[2m[tool] {} {}\x1b[0m", tool.name, tool.args);
    }

    match response.status() {
        Status::Success => {
            println!("  \x1b[32m{}\x1b[0m", response.response().unwrap_or_default());
        }
        Status::PartialSuccess => {
            println!("  \x1b[33m{}\x1b[0m", response.response().unwrap_or_default());
            println!("  \x1b[33m(partial result)\x1b[0m");
        }
        Status::Error => {
            if let Some(err) = response.error() {
                eprintln!("  \x1b[31m{}: {}\x1b[0m", err.code, err.message);
                if let Some(secs) = err.retry_after {
                    eprintln!("  Retry after {} seconds.", secs);
                }
                for hint in &err.suggestions {
                    eprintln!("  - {}", hint);
                }
            }
        }
        Status::Processing => println!("  (still processing)"),
    }

    if let Some(info) = response.model_info() {
        println!(
            "  \x1b[2m{} via {} in {:.1}s\x1b[0m",
            info.model_id,
            info.provider,
            response.execution_time()
        );
    }
    println!();
}
