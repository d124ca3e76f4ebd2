use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::core::message::ModelSlot;

/// Errors that can occur when loading configuration from disk.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Failed to write the configuration file.
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config at {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config at {}: {}", path.display(), source)
            }
            ConfigError::Write { path, source } => {
                write!(f, "Failed to write config at {}: {}", path.display(), source)
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } | ConfigError::Write { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// One configured model backend. Instance indices come from list position,
/// so selecting the same model twice just means listing it twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub provider: String,
    pub api_format: String,
    pub model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the gateway's REST API.
    pub gateway_base_url: Option<String>,

    /// API key for the gateway. The `ENSEMBLE_API_KEY` environment variable
    /// takes precedence when set.
    pub api_key: Option<String>,

    /// Models pre-selected for new conversations.
    #[serde(default)]
    pub default_models: Vec<ModelEntry>,
}

impl Config {
    pub fn load() -> Result<Config, ConfigError> {
        match default_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Config::default()),
        }
    }

    pub fn load_from_path(config_path: &Path) -> Result<Config, ConfigError> {
        if !config_path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<(), ConfigError> {
        let serialized = toml::to_string_pretty(self).map_err(|source| ConfigError::Write {
            path: config_path.to_path_buf(),
            source: std::io::Error::other(source),
        })?;

        let dir = config_path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
            path: config_path.to_path_buf(),
            source,
        })?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(|source| ConfigError::Write {
            path: config_path.to_path_buf(),
            source,
        })?;
        tmp.write_all(serialized.as_bytes())
            .map_err(|source| ConfigError::Write {
                path: config_path.to_path_buf(),
                source,
            })?;
        tmp.persist(config_path).map_err(|e| ConfigError::Write {
            path: config_path.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }

    /// The configured default models as slots, instance-indexed by position.
    pub fn default_selections(&self) -> Vec<ModelSlot> {
        self.default_models
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                ModelSlot::new(
                    entry.provider.clone(),
                    entry.api_format.clone(),
                    entry.model.clone(),
                    index as u32,
                )
            })
            .collect()
    }

    /// Gateway API key: environment first, then the config file.
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var("ENSEMBLE_API_KEY")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.api_key.clone())
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "permacommons", "ensemble")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempdir().expect("tempdir");
        let config =
            Config::load_from_path(&dir.path().join("config.toml")).expect("load defaults");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parses_gateway_and_model_entries() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
gateway_base_url = "https://gateway.example/api"

[[default_models]]
provider = "openrouter"
api_format = "openai"
model = "gpt-4o"

[[default_models]]
provider = "anthropic"
api_format = "anthropic"
model = "claude-sonnet"
"#,
        )
        .expect("write config");

        let config = Config::load_from_path(&path).expect("load config");
        assert_eq!(
            config.gateway_base_url.as_deref(),
            Some("https://gateway.example/api")
        );

        let selections = config.default_selections();
        assert_eq!(selections.len(), 2);
        assert_eq!(selections[0].instance_index, 0);
        assert_eq!(selections[1].instance_index, 1);
        assert_eq!(selections[1].model, "claude-sonnet");
    }

    #[test]
    fn invalid_toml_reports_a_parse_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "gateway_base_url = [broken").expect("write config");

        match Config::load_from_path(&path) {
            Err(ConfigError::Parse { .. }) => {}
            other => panic!("expected parse error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            gateway_base_url: Some("https://gateway.example/api".into()),
            api_key: Some("k-123".into()),
            default_models: vec![ModelEntry {
                provider: "openai".into(),
                api_format: "openai".into(),
                model: "gpt-4o".into(),
            }],
        };
        config.save_to_path(&path).expect("save config");

        let loaded = Config::load_from_path(&path).expect("reload config");
        assert_eq!(loaded, config);
    }
}
