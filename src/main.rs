//! agent-relay - console entry point
//!
//! Reads chat messages from stdin and relays them to the configured coding
//! agent backend, printing the streamed reply.

use std::sync::Arc;

use agent_relay::admission::{AdmissionConfig, AdmissionController, RelayRequest};
use agent_relay::backend::anthropic::client::AnthropicConfig;
use agent_relay::backend::claudecode::client::ClaudeCodeConfig;
use agent_relay::backend::{anthropic, claudecode, BackendRegistry};
use agent_relay::config::Config;
use agent_relay::delivery::{ChatTransport, ConsoleTransport, DeliveryConfig};
use agent_relay::policy::{KeywordThinkingPolicy, PatternSafetyPolicy};
use agent_relay::session::{SessionContext, SessionDispatcher, SessionManager, SessionSettings};
use agent_relay::store::create_session_store;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONSOLE_SESSION: &str = "console";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    info!(
        backend = %config.default_backend,
        max_concurrent = config.max_concurrent,
        max_queue_size = config.max_queue_size,
        "Loaded configuration"
    );

    let mut registry = BackendRegistry::new(config.default_backend.clone());
    registry.register(claudecode::registry_entry(ClaudeCodeConfig {
        cli_path: config.claude_cli_path.clone(),
        api_key: config.anthropic_api_key.clone(),
        default_model: config.default_model.clone(),
    }));
    let mut api_config = AnthropicConfig {
        api_key: config.anthropic_api_key.clone(),
        ..AnthropicConfig::default()
    };
    if let Some(base_url) = &config.anthropic_base_url {
        api_config.base_url = base_url.clone();
    }
    if let Some(model) = &config.default_model {
        api_config.default_model = model.clone();
    }
    registry.register(anthropic::registry_entry(api_config));

    let defaults = KeywordThinkingPolicy::default();
    let thinking = match (&config.thinking_keywords, &config.thinking_deep_keywords) {
        (None, None) => defaults,
        (keywords, deep) => KeywordThinkingPolicy::new(
            keywords.clone().unwrap_or_else(|| defaults.keywords().to_vec()),
            deep.clone().unwrap_or_else(|| defaults.deep_keywords().to_vec()),
        ),
    };
    let safety = PatternSafetyPolicy::new()
        .with_blocked_patterns(config.blocked_patterns.clone())
        .with_allowed_roots(config.allowed_paths.clone());

    let store = create_session_store(config.session_store_path.clone()).await?;
    if !store.is_persistent() {
        warn!("SESSION_STORE_PATH not set, backend sessions will not survive a restart");
    }

    let registry = Arc::new(registry);
    let context = SessionContext {
        registry: Arc::clone(&registry),
        safety: Arc::new(safety),
        thinking: Arc::new(thinking),
        store,
    };
    let manager = Arc::new(SessionManager::new(
        context,
        SessionSettings {
            working_dir: config.working_dir.clone(),
            provider: Some(config.default_backend.clone()),
            model: config.default_model.clone(),
            stale_run_timeout: config.stale_run_timeout,
        },
    ));
    if let Err(e) = manager.restore().await {
        warn!("Could not restore sessions: {}", e);
    }

    let dispatcher = Arc::new(SessionDispatcher::new(
        Arc::clone(&manager),
        config.message_format.formatter(),
        DeliveryConfig {
            edit_throttle: config.edit_throttle,
            message_limit: config.message_limit,
        },
        config.interrupt_on_new_message,
    ));
    let controller = AdmissionController::new(
        AdmissionConfig {
            max_concurrent: config.max_concurrent,
            max_queue_size: config.max_queue_size,
        },
        dispatcher,
    );
    let transport: Arc<dyn ChatTransport> = Arc::new(ConsoleTransport::new("relay"));

    info!("Ready. Commands: /stop, /new, /status, /clear, /sessions, /backends");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/stop" => {
                let stopped = manager
                    .get(CONSOLE_SESSION)
                    .map_or(false, |session| session.stop());
                info!(stopped, "Stop command");
            }
            "/new" => {
                let session = manager.get_or_create(CONSOLE_SESSION).await;
                if let Err(e) = session.reset() {
                    warn!("{}", e);
                }
            }
            "/status" => {
                let status = controller.status();
                info!(
                    queued = status.queued,
                    pending = status.pending,
                    max_size = status.max_size,
                    in_flight = status.in_flight,
                    max_concurrent = status.max_concurrent,
                    oldest_wait = ?status.oldest_wait,
                    "Queue status"
                );
            }
            "/clear" => {
                let cleared = controller.clear();
                info!(cleared, "Queue cleared");
            }
            "/sessions" => {
                println!("{}", serde_json::to_string_pretty(&manager.list())?);
            }
            "/backends" => {
                println!("{}", serde_json::to_string_pretty(&registry.list())?);
            }
            message => {
                let controller = controller.clone();
                let request = RelayRequest::new(
                    CONSOLE_SESSION,
                    "console",
                    message,
                    Arc::clone(&transport),
                );
                tokio::spawn(async move {
                    if let Err(e) = controller.submit(request).await {
                        info!("Request ended: {}", e);
                    }
                });
            }
        }
    }

    info!("Input closed, shutting down");
    manager.stop_all();
    manager.flush_all().await;
    Ok(())
}
