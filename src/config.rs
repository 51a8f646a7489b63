use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::SamplingSettings;

pub const CONFIG_ENV: &str = "MPLLM_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "mediapipe_llm_bridge.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {}", .path.display(), .source)]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid config {}: {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub listen_addr: String,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub memory: MemorySettings,
    pub defaults: SamplingSettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6380".to_string(),
            storage: StorageConfig::default(),
            engine: EngineConfig::default(),
            memory: MemorySettings::default(),
            defaults: SamplingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Bundled model assets shipped with the host.
    pub assets_dir: PathBuf,
    /// Writable directory assets are copied into before loading.
    pub files_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            assets_dir: PathBuf::from("assets"),
            files_dir: PathBuf::from("workspace/models"),
        }
    }
}

/// Command line of the external engine runner. Arguments may contain
/// `{model_path}`, `{prompt}`, `{max_tokens}`, `{top_k}`, `{temperature}`
/// and `{random_seed}`; without `{prompt}` the prompt goes to stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "llm_inference".to_string(),
            args: vec![
                "--model_path={model_path}".to_string(),
                "--max_tokens={max_tokens}".to_string(),
                "--topk={top_k}".to_string(),
                "--temperature={temperature}".to_string(),
                "--random_seed={random_seed}".to_string(),
                "--input_prompt={prompt}".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub heap_limit_mb: Option<u64>,
    pub large_heap: bool,
}

impl BridgeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Missing file means defaults; a present but broken file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(Path::new(&path))
    }
}
