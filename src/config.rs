//! Configuration Loader
//! - CLI argument parsing with clap
//! - The KITTY_PREWARM_CONFIG environment contract: the controller hands the
//!   supervisor its configuration as JSON at spawn and again on every
//!   reload_kitty_config frame.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Environment variable carrying the config envelope.
pub const CONFIG_ENV_VAR: &str = "KITTY_PREWARM_CONFIG";

// =============================================================================
// CLI Configuration
// =============================================================================

/// prewarm-core CLI - prewarmed fork server for terminal windows
#[derive(Parser)]
#[command(name = "prewarm-core", version, about = "Prewarmed fork server for terminal windows")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor event loop (spawned by the controller)
    Supervise {
        /// Inherited fd on which child deaths are reported to the controller
        #[arg(long)]
        notify_fd: i32,
    },
    /// Run a single kitten against the current stdio
    Kitten {
        /// Kitten name as registered in the dispatch table
        name: String,
        /// Arguments handed to the kitten
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

// =============================================================================
// Prewarm configuration envelope
// =============================================================================

/// Raw configuration as sent by the controller: config file paths plus
/// `key=value` override strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PrewarmConfig {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub overrides: Vec<String>,
}

impl PrewarmConfig {
    /// Decode the envelope from the environment contract. A missing variable
    /// means an empty configuration, not an error.
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("decode {CONFIG_ENV_VAR}")),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("serialize prewarm config")
    }
}

/// The options snapshot kittens observe.
///
/// Parsing of the config files named in `config_paths` belongs to the wider
/// application; the snapshot records the paths and the parsed overrides so a
/// forked child sees the configuration that was active at its fork.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Options {
    pub config_paths: Vec<String>,
    pub overrides: BTreeMap<String, String>,
}

impl Options {
    pub fn load(config: &PrewarmConfig) -> Self {
        let mut overrides = BTreeMap::new();
        for item in &config.overrides {
            match item.split_once('=') {
                Some((key, value)) => {
                    overrides.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => eprintln!("[config] Ignoring malformed override: {item}"),
            }
        }
        Self {
            config_paths: config.paths.clone(),
            overrides,
        }
    }
}

/// Rebuild the options from the environment contract. Used at supervisor
/// startup and whenever a reload frame arrives.
pub fn reload_from_env() -> anyhow::Result<Options> {
    Ok(Options::load(&PrewarmConfig::from_env()?))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_envelope() {
        let config: PrewarmConfig =
            serde_json::from_str(r#"{"paths":["/etc/kitty.conf"],"overrides":["font_size=12"]}"#)
                .unwrap();
        assert_eq!(config.paths, vec!["/etc/kitty.conf".to_string()]);
        assert_eq!(config.overrides, vec!["font_size=12".to_string()]);
    }

    #[test]
    fn test_parse_empty_envelope() {
        let config: PrewarmConfig = serde_json::from_str("{}").unwrap();
        assert!(config.paths.is_empty());
        assert!(config.overrides.is_empty());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let config = PrewarmConfig {
            paths: vec!["/a".to_string(), "/b".to_string()],
            overrides: vec!["x=1".to_string()],
        };
        let back: PrewarmConfig = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_options_parse_overrides() {
        let config = PrewarmConfig {
            paths: vec!["/a".to_string()],
            overrides: vec![
                "scrollback_lines = 10000".to_string(),
                "broken-override".to_string(),
                "shell=/bin/zsh".to_string(),
            ],
        };
        let options = Options::load(&config);
        assert_eq!(options.config_paths, vec!["/a".to_string()]);
        assert_eq!(
            options.overrides.get("scrollback_lines").map(String::as_str),
            Some("10000")
        );
        assert_eq!(
            options.overrides.get("shell").map(String::as_str),
            Some("/bin/zsh")
        );
        assert_eq!(options.overrides.len(), 2);
    }

    #[test]
    fn test_options_serialize_for_kitten_output() {
        let options = Options::load(&PrewarmConfig {
            paths: vec!["/a".to_string()],
            overrides: vec!["k=v".to_string()],
        });
        let json = serde_json::to_string(&options).unwrap();
        assert!(json.contains("\"config_paths\":[\"/a\"]"));
        assert!(json.contains("\"k\":\"v\""));
    }
}
