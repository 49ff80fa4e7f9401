use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ipc::protocol::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub gemini: GeminiConfig,
    pub generation: GenerationConfig,
    pub wake: WakeConfig,
    pub capture: CaptureConfig,
    pub whisper: WhisperConfig,
    pub cloud_stt: CloudSttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub endpoint: String,
    pub default_model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_corrections: u32,
    /// Delivered scripts kept per connection for execution-error reports.
    pub max_delivered: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    pub model_path: PathBuf,
    pub phrases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub chunk_ms: u64,
    pub energy_threshold: f32,
    pub dynamic_energy_ratio: f32,
    pub calibration_ms: u64,
    pub pause_threshold_ms: u64,
    pub phrase_time_limit_secs: u64,
    pub listen_timeout_secs: u64,
    pub pre_roll_ms: u64,
    pub recordings_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    pub model_dir: PathBuf,
    pub model_size: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSttConfig {
    pub endpoint: String,
    pub language_code: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 65432,
            read_timeout_ms: 500,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com".to_string(),
            default_model: "gemini-1.5-flash".to_string(),
            temperature: 0.2,
            top_p: 0.8,
            top_k: 40,
            max_output_tokens: 8096,
            request_timeout_secs: 60,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retry_backoff_ms: 500,
            max_corrections: 2,
            max_delivered: 4,
        }
    }
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/vosk-model-small-en-us-0.15"),
            phrases: vec!["okay blender".to_string()],
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None, // Use default device
            sample_rate: 16000,
            chunk_ms: 100,
            energy_threshold: 300.0,
            dynamic_energy_ratio: 1.5,
            calibration_ms: 1000,
            pause_threshold_ms: 800,
            phrase_time_limit_secs: 15,
            listen_timeout_secs: 5,
            pre_roll_ms: 300,
            recordings_dir: None,
        }
    }
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            model_size: "small".to_string(),
            language: Some("en".to_string()),
        }
    }
}

impl Default for CloudSttConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://speech.googleapis.com/v1/speech:recognize".to_string(),
            language_code: "en-US".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl GenerationConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl CaptureConfig {
    /// Samples per frame handed to the wake-word recognizer.
    pub fn chunk_samples(&self) -> usize {
        (self.sample_rate as u64 * self.chunk_ms / 1000).max(1) as usize
    }
}

impl WhisperConfig {
    /// ggml model file for a given size, e.g. `models/ggml-small.bin`.
    pub fn model_path(&self, size: &str) -> PathBuf {
        self.model_dir.join(format!("ggml-{}.bin", size))
    }
}

impl Config {
    /// Default location: `$XDG_CONFIG_HOME/articulate/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("articulate").join("config.yaml"))
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `ARTICULATE_*`, `VOSK_MODEL_PATH` and `WHISPER_MODEL_DIR`
    /// overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("ARTICULATE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("ARTICULATE_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "ARTICULATE_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(path) = lookup("VOSK_MODEL_PATH") {
            self.wake.model_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("WHISPER_MODEL_DIR") {
            self.whisper.model_dir = PathBuf::from(dir);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 7000\ngeneration:\n  max_attempts: 3\nwake:\n  phrases: [\"hey blender\"]\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.generation.max_attempts, 3);
        assert_eq!(config.generation.retry_backoff_ms, 500);
        assert_eq!(config.generation.max_delivered, 4);
        assert_eq!(config.wake.phrases, vec!["hey blender".to_string()]);
        assert_eq!(config.capture.sample_rate, 16000);
    }

    #[test]
    fn serialized_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.gemini.default_model = "gemini-2.0-flash".to_string();
        std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.gemini.default_model, "gemini-2.0-flash");
    }

    #[test]
    fn env_overrides_are_applied_and_validated() {
        let vars: HashMap<&str, &str> = [("ARTICULATE_PORT", "9001"), ("VOSK_MODEL_PATH", "/opt/vosk")]
            .into_iter()
            .collect();
        let mut config = Config::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.wake.model_path, PathBuf::from("/opt/vosk"));

        let err = config
            .apply_overrides(|name| (name == "ARTICULATE_PORT").then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn derived_values() {
        let config = Config::default();
        assert_eq!(config.capture.chunk_samples(), 1600);
        assert_eq!(config.server.bind_address(), "127.0.0.1:65432");
        assert_eq!(
            config.whisper.model_path("small"),
            PathBuf::from("models/ggml-small.bin")
        );
    }
}
