use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_ENV_FILE: &str = "configs/config.dev";
pub const DEFAULT_SECRETS_DIR: &str = "secrets";
pub const DEFAULT_CONFIG_FILE: &str = "configs/config.json";
pub const DEFAULT_CALLBACK_URL: &str = "http://localhost:5555";
pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 300;

const SANDBOX_HOST: &str = "https://sandbox.evernote.com";
const PRODUCTION_HOST: &str = "https://www.evernote.com";

// Process-wide settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub consumer_key: Option<String>,
    pub consumer_secret: Option<String>,
    pub token_production: Option<String>,
    pub token_sandbox: Option<String>,
    pub callback_url: String,
    pub sandbox: bool,
    pub directory: Option<PathBuf>,
    pub config_file: PathBuf,
    pub service_host: Option<String>,
    pub callback_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            consumer_key: None,
            consumer_secret: None,
            token_production: None,
            token_sandbox: None,
            callback_url: DEFAULT_CALLBACK_URL.to_string(),
            sandbox: true,
            directory: None,
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            service_host: None,
            callback_timeout: Duration::from_secs(DEFAULT_CALLBACK_TIMEOUT_SECS),
        }
    }
}

impl Settings {
    /// Load settings from the environment after applying `env_file` (if it exists).
    /// Keys not set in the environment fall back to files under `secrets/`.
    pub fn load(env_file: Option<&Path>) -> Result<Self> {
        let env_file = env_file.unwrap_or(Path::new(DEFAULT_ENV_FILE));
        if env_file.exists() {
            dotenvy::from_path(env_file)
                .map_err(|e| Error::Config(format!("{}: {}", env_file.display(), e)))?;
            debug!(env_file = %env_file.display(), "env file loaded");
        }

        let secrets_dir = PathBuf::from(DEFAULT_SECRETS_DIR);
        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| read_secret(&secrets_dir, key))
        })
    }

    /// Build settings from an arbitrary key lookup (upper-case env names).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Settings::default();

        let sandbox = match get("SANDBOX") {
            Some(v) => parse_bool(&v)
                .ok_or_else(|| Error::Config(format!("SANDBOX must be a boolean, got '{}'", v)))?,
            None => defaults.sandbox,
        };

        let callback_timeout = match get("CALLBACK_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(v.parse().map_err(|_| {
                Error::Config(format!("CALLBACK_TIMEOUT_SECS must be a number, got '{}'", v))
            })?),
            None => defaults.callback_timeout,
        };

        Ok(Self {
            consumer_key: get("CONSUMER_KEY"),
            consumer_secret: get("CONSUMER_SECRET"),
            token_production: get("TOKEN_PRODUCTION"),
            token_sandbox: get("TOKEN_SANDBOX"),
            callback_url: get("CALLBACK_URL").unwrap_or(defaults.callback_url),
            sandbox,
            directory: get("DIRECTORY").map(PathBuf::from),
            config_file: get("CONFIG_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_file),
            service_host: get("SERVICE_HOST"),
            callback_timeout,
        })
    }

    /// Access token for the configured target (sandbox or production).
    pub fn token(&self) -> Result<&str> {
        let (token, key) = if self.sandbox {
            (&self.token_sandbox, "TOKEN_SANDBOX")
        } else {
            (&self.token_production, "TOKEN_PRODUCTION")
        };
        token
            .as_deref()
            .ok_or_else(|| Error::Config(format!("{} is not set", key)))
    }

    pub fn consumer(&self) -> Result<(&str, &str)> {
        let key = self
            .consumer_key
            .as_deref()
            .ok_or_else(|| Error::Config("CONSUMER_KEY is not set".to_string()))?;
        let secret = self
            .consumer_secret
            .as_deref()
            .ok_or_else(|| Error::Config("CONSUMER_SECRET is not set".to_string()))?;
        Ok((key, secret))
    }

    pub fn root_directory(&self) -> Result<&Path> {
        self.directory
            .as_deref()
            .ok_or_else(|| Error::Config("DIRECTORY is not set".to_string()))
    }

    /// Base URL of the remote service.
    pub fn service_host(&self) -> &str {
        match self.service_host.as_deref() {
            Some(host) => host.trim_end_matches('/'),
            None if self.sandbox => SANDBOX_HOST,
            None => PRODUCTION_HOST,
        }
    }

    pub fn target_label(&self) -> &'static str {
        if self.sandbox {
            "sandbox"
        } else {
            "production"
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// Secrets are stored one value per file, named after the lower-cased key
fn read_secret(dir: &Path, key: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(key.to_lowercase()))
        .ok()
        .map(|s| s.trim().to_string())
}

// ── Import configuration ───────────────────────────────────────────────────

/// Policy for one configured subdirectory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImportPolicy {
    #[serde(rename = "target notebook")]
    pub target_notebook: String,
    /// Notebook stack, applied when the notebook has to be created
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Search phrase used by the re-filer
    #[serde(default)]
    pub search: Option<String>,
    /// Title template used by the re-filer
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImportConfiguration {
    #[serde(rename = "autofile")]
    pub policies: BTreeMap<String, ImportPolicy>,
}

impl ImportConfiguration {
    /// Load the configuration file. YAML when the extension says so, JSON otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = if ext == "yaml" || ext == "yml" {
            Self::from_yaml(&content)?
        } else {
            Self::from_json(&content)?
        };
        debug!(config_file = %path.display(), policies = config.policies.len(), "configuration loaded");
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn policy(&self, key: &str) -> Option<&ImportPolicy> {
        self.policies.get(key)
    }

    fn validate(&self) -> Result<()> {
        for (key, policy) in &self.policies {
            if key.trim().is_empty() {
                return Err(Error::Config("empty subdirectory name".to_string()));
            }
            if policy.target_notebook.trim().is_empty() {
                return Err(Error::Config(format!(
                    "'{}' has an empty target notebook",
                    key
                )));
            }
        }
        Ok(())
    }
}
