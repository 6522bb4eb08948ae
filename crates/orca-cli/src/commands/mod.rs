use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use orca_config::{ConfigLoader, OrcaConfig};
use orca_runtime::{CapabilityRegistry, Engine};

mod chat;
mod conversations;

/// Orca: a tool-augmented conversational agent
#[derive(Parser, Debug)]
#[command(name = "orca", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to orca.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Address to listen on (overrides server.listen)
        #[arg(long)]
        listen: Option<String>,
    },
    /// Interactive chat in the terminal
    Chat {
        /// Wait for the whole reply instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },
    /// List stored conversations, most recent first
    Conversations {
        /// Number of conversations to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Show the effective configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Run with no capabilities registered.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_with(CapabilityRegistry::new()).await
    }

    /// Run with `capabilities` offered to the model by `serve` and `chat`.
    pub async fn run_with(self, capabilities: CapabilityRegistry) -> anyhow::Result<()> {
        let capabilities = Arc::new(capabilities);
        let config = ConfigLoader::load(self.config.as_deref())?.into_config();

        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            self.log_level
                .as_deref()
                .unwrap_or(config.logging.level.as_str())
        };
        init_tracing(log_level, &config.logging.format);

        match self.command {
            Commands::Serve { listen } => Self::cmd_serve(config, listen, capabilities).await,
            Commands::Chat { no_stream } => {
                let engine = build_engine(&config, capabilities).await?;
                chat::cmd_chat(engine, !no_stream).await
            }
            Commands::Conversations { limit } => {
                conversations::cmd_conversations(&config, limit).await
            }
            Commands::Config { json } => Self::cmd_config(&config, json),
        }
    }

    async fn cmd_serve(
        mut config: OrcaConfig,
        listen: Option<String>,
        capabilities: Arc<CapabilityRegistry>,
    ) -> anyhow::Result<()> {
        if let Some(listen) = listen {
            config.server.listen = listen;
        }
        let engine = build_engine(&config, capabilities).await?;
        println!("Orca listening on http://{}", config.server.listen);
        orca_server::start_server(engine, &config.server).await?;
        Ok(())
    }

    fn cmd_config(config: &OrcaConfig, json: bool) -> anyhow::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(config).context("failed to render config as TOML")?
            );
        }
        Ok(())
    }
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Wire the configured store and backend into an initialized engine.
async fn build_engine(
    config: &OrcaConfig,
    capabilities: Arc<CapabilityRegistry>,
) -> anyhow::Result<Arc<Engine>> {
    let memory = orca_memory::open_store(&config.memory.backend, &config.memory.data_dir)
        .await
        .with_context(|| format!("failed to open {} store", config.memory.backend))?;
    let backend = orca_llm::build_backend(&config.backend)?;

    if capabilities.is_empty() {
        warn!("no capabilities registered, the model will answer without tools");
    } else {
        info!(tools = ?capabilities.names(), "capabilities registered");
    }

    let engine = Arc::new(Engine::new(config.agent.clone(), memory));
    engine.initialize(backend, capabilities).await?;
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orca_core::{Capability, Params};

    #[test]
    fn test_parse_serve_with_listen() {
        let cli = Cli::try_parse_from(["orca", "serve", "--listen", "0.0.0.0:9000"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Serve {
                listen: Some("0.0.0.0:9000".into())
            }
        );
    }

    #[test]
    fn test_parse_chat_defaults_to_streaming() {
        let cli = Cli::try_parse_from(["orca", "chat"]).unwrap();
        assert_eq!(cli.command, Commands::Chat { no_stream: false });

        let cli = Cli::try_parse_from(["orca", "chat", "--no-stream"]).unwrap();
        assert_eq!(cli.command, Commands::Chat { no_stream: true });
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["orca", "conversations", "-n", "5", "--verbose"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.command, Commands::Conversations { limit: 5 });
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["orca", "config", "-v", "-q"]).is_err());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["orca"]).is_err());
    }

    struct Echo;

    #[async_trait::async_trait]
    impl Capability for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "repeats the text parameter"
        }

        async fn execute(&self, params: &Params) -> orca_core::Result<serde_json::Value> {
            Ok(params.get("text").cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_built_engine_offers_registered_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OrcaConfig::default();
        config.memory.data_dir = dir.path().to_path_buf();

        let registry = CapabilityRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let engine = build_engine(&config, Arc::new(registry)).await.unwrap();

        assert!(engine.registry().unwrap().contains("echo"));
        let mut params = Params::new();
        params.insert("text".into(), "hi".into());
        assert_eq!(engine.execute_tool("echo", &params).await.unwrap(), "hi");
    }
}
