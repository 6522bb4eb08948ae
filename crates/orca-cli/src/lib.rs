//! # orca-cli
//!
//! Command-line interface for the Orca agent engine.
//!
//! Commands:
//! - `orca serve` starts the HTTP API
//! - `orca chat` opens an interactive terminal session
//! - `orca conversations` lists stored conversations
//! - `orca config` prints the effective configuration
//!
//! The stock binary registers no capabilities. A binary that ships its own
//! registers them and hands the registry to [`Cli::run_with`]:
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use clap::Parser;
//! use orca_runtime::CapabilityRegistry;
//!
//! let registry = CapabilityRegistry::new();
//! // registry.register(Arc::new(MyTool))?;
//! orca_cli::Cli::parse().run_with(registry).await
//! # }
//! ```

pub mod commands;

pub use commands::Cli;
