use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::schema::OrcaConfig;
use orca_core::{OrcaError, Result};

/// Loads the Orca configuration from disk and the environment.
pub struct ConfigLoader {
    config: OrcaConfig,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > ORCA_CONFIG env > ./orca.toml > ~/.orca/orca.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("ORCA_CONFIG") {
            return PathBuf::from(p);
        }
        let local = PathBuf::from("orca.toml");
        if local.exists() {
            return local;
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".orca")
            .join("orca.toml")
    }

    /// Load the config, falling back to defaults when the file is absent.
    /// An explicitly requested file that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            Self::parse(&raw, &config_path)?
        } else if path.is_some() {
            return Err(OrcaError::Config(format!(
                "config file not found: {}",
                config_path.display()
            )));
        } else {
            warn!(?config_path, "config file not found, using defaults");
            OrcaConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => return Err(OrcaError::Config(e)),
        }

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Parse a TOML document into a config.
    pub fn parse(raw: &str, origin: &Path) -> Result<OrcaConfig> {
        toml::from_str::<OrcaConfig>(raw).map_err(|e| {
            OrcaError::Config(format!("failed to parse {}: {}", origin.display(), e))
        })
    }

    pub fn get(&self) -> &OrcaConfig {
        &self.config
    }

    pub fn into_config(self) -> OrcaConfig {
        self.config
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(config: OrcaConfig) -> OrcaConfig {
        Self::apply_overrides(config, |key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides(
        mut config: OrcaConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> OrcaConfig {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("OLLAMA_BASE_URL") {
            config.backend.base_url = v;
        }
        if let Some(v) = non_empty("OLLAMA_MODEL") {
            config.backend.model = v;
        }
        if let Some(v) = non_empty("AGENT_PROMPT") {
            config.agent.system_prompt = v;
        }
        if let Some(v) = non_empty("ORCA_LISTEN") {
            config.server.listen = v;
        }
        if let Some(v) = non_empty("ORCA_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = non_empty("ORCA_DATA_DIR") {
            config.memory.data_dir = PathBuf::from(v);
        }
        // The file wins for the API key; env only fills a gap.
        if config.backend.api_key.is_none() {
            if let Some(v) = non_empty("OPENAI_API_KEY") {
                config.backend.api_key = Some(v);
            }
        }
        config
    }
}
