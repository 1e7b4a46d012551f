//! switchyard-core: tool-calling orchestration and rate-limited model routing.
//!
//! This crate contains the building blocks between a chat client and the
//! outside world:
//!
//! - [`config`] - Typed configuration loading from JSON
//! - [`provider`] - LLM provider trait and OpenAI-compatible implementation
//! - [`tools`] - Tool trait, registry, executor, and built-in shell/filesystem/web tools
//! - [`router`] - Model selection, per-model usage ledger, persisted preference
//! - [`response`] - The `ApiResponse` wire format and its builder
//! - [`agent`] - The orchestrator loop and system prompt assembly
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use switchyard_core::agent::{AgentConfig, Orchestrator};
//! use switchyard_core::config::Config;
//! use switchyard_core::provider::{openai::OpenAiProvider, ProviderSet};
//! use switchyard_core::router::{ledger::UsageLedger, state::{RouterState, StateStore}, ProviderRouter};
//! use switchyard_core::tools::{ToolExecutor, ToolRegistry};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//!
//! let mut providers = ProviderSet::new();
//! for (name, entry) in config.providers.find_all_active() {
//!     let client = reqwest::Client::new();
//!     let p = OpenAiProvider::new(name, &entry.api_key, entry.api_base.as_deref(), client);
//!     providers.insert(name, Arc::new(p));
//! }
//!
//! let store = StateStore::new(
//!     config.state_path(),
//!     RouterState::new("groq", &config.agents.defaults.model),
//!     Duration::from_secs(5),
//! );
//! let ledger = Arc::new(UsageLedger::new(config.router.backoff.policy()));
//! let router = Arc::new(ProviderRouter::new(config.models.clone(), ledger, store));
//!
//! let executor = ToolExecutor::new(Arc::new(ToolRegistry::new()));
//! let orchestrator = Orchestrator::new(router, providers, executor, AgentConfig::from_config(&config));
//!
//! let response = orchestrator.process("Hello!", &[], None).await;
//! println!("{}", response.to_json());
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod provider;
pub mod response;
pub mod router;
pub mod tools;
