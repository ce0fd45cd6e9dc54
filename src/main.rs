use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use halo_core::capabilities;
use halo_core::config::AppConfig;
use halo_core::guardrails::Guardrails;
use halo_core::task_profile::{TaskProfileResolver, TASK_PROFILES};
use halo_gateway::GatewayServer;

#[derive(Parser)]
#[command(name = "halo", version, about = "OpenAI-compatible gateway for Azure OpenAI, OpenAI, and Foundry models")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "halo.toml", env = "HALO_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway (default)
    Serve {
        /// Override `gateway.bind`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Show the resolved configuration with secrets redacted
    Config,
    /// List registered models and their capabilities
    Models,
    /// List task profiles and guardrail profiles
    Profiles,
}

/// File (when present) overlaid with the process environment.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let mut config = if path.exists() {
        info!(path = %path.display(), "Loading config");
        AppConfig::load(path)?
    } else {
        warn!(path = %path.display(), "No config file found; using defaults and environment");
        AppConfig::default()
    };
    config.apply_env(std::env::vars())?;
    Ok(config)
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "-"
    }
}

fn print_models() {
    println!(
        "{:<28} {:<6} {:<6} {:<6} {:<6} {:<6} {:<6} {:>10} {:>8}",
        "MODEL", "CHAT", "VISION", "IMAGE", "TOOLS", "JSON", "REASON", "CONTEXT", "OUTPUT"
    );
    for (id, caps) in capabilities::registered_models() {
        println!(
            "{:<28} {:<6} {:<6} {:<6} {:<6} {:<6} {:<6} {:>10} {:>8}",
            id,
            yes_no(caps.chat),
            yes_no(caps.vision),
            yes_no(caps.image_generate),
            yes_no(caps.tool_calls),
            yes_no(caps.json_mode),
            yes_no(caps.reasoning),
            caps.max_context_tokens,
            caps.max_output_tokens,
        );
    }
}

fn print_profiles(config: &AppConfig) {
    let resolver = TaskProfileResolver::new(&config.defaults);
    println!("Task profiles:");
    for profile in TASK_PROFILES {
        let temperature = profile
            .temperature
            .map(|t| format!(", temperature {t}"))
            .unwrap_or_default();
        let effort = profile
            .reasoning_effort
            .map(|e| format!(", effort {}", e.as_str()))
            .unwrap_or_default();
        println!(
            "  {:<16} {:<14} {}{effort}{temperature}",
            profile.name,
            resolver.model_for(profile.model),
            profile.description,
        );
    }

    let guardrails = Guardrails::from_config(&config.guardrails);
    println!("\nGuardrail profiles:");
    for name in guardrails.names() {
        let description = guardrails
            .get(name)
            .and_then(|g| g.description.as_deref())
            .unwrap_or("");
        println!("  {name:<16} {description}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("HALO_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("halo=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.gateway.bind = bind;
            }
            let server = GatewayServer::new(config);

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config.redacted())?);
        }
        Commands::Models => print_models(),
        Commands::Profiles => print_profiles(&config),
    }

    Ok(())
}
