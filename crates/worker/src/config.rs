//! Worker configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use comfyrun_comfyui::api::ComfyUIApi;
use comfyrun_comfyui::bridge::{BridgeSettings, JobBridge};
use comfyrun_core::artifact::ArtifactDelivery;
use comfyrun_core::volume::{DEFAULT_EXTRA_MODEL_PATHS, DEFAULT_VOLUME_PATH};

/// Extra time an HTTP request may take beyond the configured job timeout.
const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(60);

/// Connect timeout for the pooled HTTP client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

impl LogFormat {
    /// `LOG_FORMAT`, falling back to text. Used before configuration is
    /// loaded, so invalid values are reported by [`WorkerConfig::from_env`].
    pub fn from_env_or_default() -> Self {
        std::env::var("LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
}

/// Everything the worker reads from its environment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub comfy_host: String,
    pub comfy_port: u16,
    /// Defaults for every invocation.
    pub bridge: BridgeSettings,
    /// Run volume diagnostics before serving.
    pub volume_debug: bool,
    pub volume_path: PathBuf,
    pub extra_model_paths: PathBuf,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                           |
    /// |-------------------------------|-----------------------------------|
    /// | `COMFY_HOST`                  | `127.0.0.1`                       |
    /// | `COMFY_PORT`                  | `8188`                            |
    /// | `COMFY_POLL_INTERVAL_MS`      | `250`                             |
    /// | `COMFY_MAX_POLL_INTERVAL_MS`  | `5000`                            |
    /// | `COMFY_JOB_TIMEOUT_SECS`      | `600`                             |
    /// | `COMFY_SUBMIT_TIMEOUT_SECS`   | `30`                              |
    /// | `COMFY_SUBMIT_RETRY_DELAY_MS` | `1000`                            |
    /// | `COMFY_POLL_MAX_RETRIES`      | `3`                               |
    /// | `ARTIFACT_DELIVERY`           | `inline`                          |
    /// | `NETWORK_VOLUME_DEBUG`        | `true`                            |
    /// | `NETWORK_VOLUME_PATH`         | `/runpod-volume`                  |
    /// | `COMFY_EXTRA_MODEL_PATHS`     | `/comfyui/extra_model_paths.yaml` |
    /// | `LOG_FORMAT`                  | `text`                            |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let delivery = match env.get("ARTIFACT_DELIVERY") {
            None => ArtifactDelivery::default(),
            Some(value) => ArtifactDelivery::from_name(&value).map_err(|_| ConfigError::Invalid {
                var: "ARTIFACT_DELIVERY",
                value,
                expected: "'inline' or 'reference'",
            })?,
        };

        let log_format = match env.get("LOG_FORMAT") {
            None => LogFormat::default(),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: "LOG_FORMAT",
                value,
                expected: "'text' or 'json'",
            })?,
        };

        let max_poll_interval_ms = env.positive("COMFY_MAX_POLL_INTERVAL_MS", 5000)?;
        let submit_retry_delay_ms =
            env.parsed("COMFY_SUBMIT_RETRY_DELAY_MS", 1000, "a non-negative integer")?;

        let bridge = BridgeSettings {
            poll_interval: Duration::from_millis(env.positive("COMFY_POLL_INTERVAL_MS", 250)?),
            max_poll_interval: Duration::from_millis(max_poll_interval_ms),
            job_timeout: Duration::from_secs(env.positive("COMFY_JOB_TIMEOUT_SECS", 600)?),
            submit_timeout: Duration::from_secs(env.positive("COMFY_SUBMIT_TIMEOUT_SECS", 30)?),
            submit_retry_delay: Duration::from_millis(submit_retry_delay_ms),
            max_poll_retries: env.parsed("COMFY_POLL_MAX_RETRIES", 3, "a non-negative integer")?,
            delivery,
        };

        Ok(Self {
            comfy_host: env.get("COMFY_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            comfy_port: env.parsed("COMFY_PORT", 8188, "a valid port number")?,
            bridge,
            volume_debug: env.flag("NETWORK_VOLUME_DEBUG", true)?,
            volume_path: env
                .get("NETWORK_VOLUME_PATH")
                .map_or_else(|| PathBuf::from(DEFAULT_VOLUME_PATH), PathBuf::from),
            extra_model_paths: env
                .get("COMFY_EXTRA_MODEL_PATHS")
                .map_or_else(|| PathBuf::from(DEFAULT_EXTRA_MODEL_PATHS), PathBuf::from),
            log_format,
        })
    }

    /// Base URL of the ComfyUI HTTP API.
    pub fn comfy_url(&self) -> String {
        format!("http://{}:{}", self.comfy_host, self.comfy_port)
    }

    /// Upper bound on one HTTP invocation: the job timeout plus a margin
    /// for submission and collection.
    pub fn request_timeout(&self) -> Duration {
        self.bridge.job_timeout.saturating_add(REQUEST_TIMEOUT_MARGIN)
    }

    /// Build the job bridge over a pooled HTTP client.
    pub fn build_bridge(&self) -> Result<JobBridge<ComfyUIApi>, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let api = ComfyUIApi::with_client(client, self.comfy_url());
        Ok(JobBridge::new(api, self.bridge.clone()))
    }
}

/// Variable lookup with typed accessors. Empty values count as unset.
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: FromStr>(
        &self,
        var: &'static str,
        default: T,
        expected: &'static str,
    ) -> Result<T, ConfigError> {
        match self.get(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var,
                value,
                expected,
            }),
        }
    }

    fn positive(&self, var: &'static str, default: u64) -> Result<u64, ConfigError> {
        let expected = "a positive integer";
        let n = self.parsed(var, default, expected)?;
        if n == 0 {
            return Err(ConfigError::Invalid {
                var,
                value: n.to_string(),
                expected,
            });
        }
        Ok(n)
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(var).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => Ok(false),
            Some(value) => Err(ConfigError::Invalid {
                var,
                value,
                expected: "a boolean",
            }),
        }
    }
}
