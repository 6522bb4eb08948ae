//! # orca-config
//!
//! Configuration for the Orca engine. Reads `orca.toml`, then applies
//! environment variable overrides on top.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    AgentConfig, BackendConfig, ConfigWarning, LoggingConfig, MemoryConfig, OrcaConfig,
    ServerConfig, WarningSeverity,
};
