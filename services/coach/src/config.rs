//! Application Configuration Module
//!
//! Settings come from environment variables (optionally seeded from a `.env`
//! file) and are validated once at startup.

use secrecy::SecretString;
use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_DATA_DIR: &str = ".lingo";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
/// Quiet by default so log lines do not interleave with the conversation.
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Which evaluator backs the session, with its credentials.
#[derive(Debug)]
pub enum Backend {
    Gemini { api_key: SecretString },
    OpenAI { api_key: SecretString },
    /// Local heuristics, no network.
    Offline,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Gemini { .. } => "gemini",
            Backend::OpenAI { .. } => "openai",
            Backend::Offline => "offline",
        }
    }
}

/// Holds all configuration loaded from the environment.
#[derive(Debug)]
pub struct Config {
    pub backend: Backend,
    pub chat_model: String,
    pub data_dir: PathBuf,
    pub log_filter: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Unknown EVALUATOR_PROVIDER '{0}', expected gemini, openai or offline")]
    UnknownProvider(String),
    #[error("Invalid log filter provided for RUST_LOG: {0}")]
    InvalidLogFilter(String),
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `EVALUATOR_PROVIDER`: "gemini" (default), "openai" or "offline".
    // *   `GEMINI_API_KEY`: Required if provider is "gemini".
    // *   `OPENAI_API_KEY`: Required if provider is "openai".
    // *   `CHAT_MODEL`: (Optional) Model name. Defaults per provider.
    // *   `LINGO_DATA_DIR`: (Optional) Where the level preference is kept. Defaults to ".lingo".
    // *   `RUST_LOG`: (Optional) Log filter directives. Defaults to "warn".
    //
    // `force_offline` overrides the provider and skips the key check.
    pub fn from_env(force_offline: bool) -> Result<Self, ConfigError> {
        // Load .env file. This is useful for local development and is ignored if not present.
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok(), force_offline)
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        force_offline: bool,
    ) -> Result<Self, ConfigError> {
        let provider = if force_offline {
            "offline".to_string()
        } else {
            lookup("EVALUATOR_PROVIDER")
                .map(|p| p.trim().to_lowercase())
                .unwrap_or_else(|| "gemini".to_string())
        };

        let require = |name: &str| -> Result<SecretString, ConfigError> {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from)
                .ok_or_else(|| {
                    ConfigError::MissingVar(format!("{name} must be set for {provider} provider"))
                })
        };

        let backend = match provider.as_str() {
            "gemini" => Backend::Gemini {
                api_key: require("GEMINI_API_KEY")?,
            },
            "openai" => Backend::OpenAI {
                api_key: require("OPENAI_API_KEY")?,
            },
            "offline" => Backend::Offline,
            other => return Err(ConfigError::UnknownProvider(other.to_string())),
        };

        let chat_model = lookup("CHAT_MODEL").unwrap_or_else(|| match &backend {
            Backend::OpenAI { .. } => DEFAULT_OPENAI_MODEL.to_string(),
            _ => gemini_client::client::DEFAULT_MODEL.to_string(),
        });

        let data_dir = lookup("LINGO_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let log_filter = lookup("RUST_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        EnvFilter::try_new(&log_filter)
            .map_err(|_| ConfigError::InvalidLogFilter(log_filter.clone()))?;

        Ok(Self {
            backend,
            chat_model,
            data_dir,
            log_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)], offline: bool) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned(), offline)
    }

    #[test]
    fn defaults_to_gemini() {
        let config = load(&[("GEMINI_API_KEY", "g-key")], false).unwrap();
        assert_eq!(config.backend.name(), "gemini");
        assert_eq!(config.chat_model, gemini_client::client::DEFAULT_MODEL);
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn missing_key_for_the_chosen_provider_is_an_error() {
        let err = load(&[("EVALUATOR_PROVIDER", "openai")], false).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(msg) if msg.contains("OPENAI_API_KEY")));

        let err = load(&[("GEMINI_API_KEY", "  ")], false).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(_)));
    }

    #[test]
    fn openai_gets_its_own_default_model() {
        let config = load(
            &[("EVALUATOR_PROVIDER", "OpenAI"), ("OPENAI_API_KEY", "sk-test")],
            false,
        )
        .unwrap();
        assert_eq!(config.backend.name(), "openai");
        assert_eq!(config.chat_model, DEFAULT_OPENAI_MODEL);
    }

    #[test]
    fn offline_flag_needs_no_key() {
        let config = load(&[("EVALUATOR_PROVIDER", "gemini")], true).unwrap();
        assert!(matches!(config.backend, Backend::Offline));
    }

    #[test]
    fn rejects_unknown_provider_and_bad_filters() {
        assert_eq!(
            load(&[("EVALUATOR_PROVIDER", "claude")], false).unwrap_err(),
            ConfigError::UnknownProvider("claude".to_string())
        );
        assert!(matches!(
            load(&[("RUST_LOG", "lingo=loud")], true).unwrap_err(),
            ConfigError::InvalidLogFilter(_)
        ));
    }

    #[test]
    fn explicit_settings_win() {
        let config = load(
            &[
                ("CHAT_MODEL", "gemini-1.5-pro"),
                ("LINGO_DATA_DIR", "/tmp/lingo"),
                ("RUST_LOG", "lingo_core=debug"),
            ],
            true,
        )
        .unwrap();
        assert_eq!(config.chat_model, "gemini-1.5-pro");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/lingo"));
        assert_eq!(config.log_filter, "lingo_core=debug");
    }
}
