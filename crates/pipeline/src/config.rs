use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use atelier_comfyui::reconnect::ReconnectConfig;

/// Errors from loading [`EngineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Engine and job settings loaded from environment variables.
///
/// All fields have defaults suitable for a ComfyUI instance running on
/// the local machine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `host:port` of the engine (default: `127.0.0.1:8188`).
    pub server: String,
    /// HTTP connect/response bound (default: 10s).
    pub request_timeout: Duration,
    /// Push-channel silence before falling back to polling (default: 15s).
    pub liveness_threshold: Duration,
    /// Minimum spacing between fallback polls (default: 5s).
    pub poll_interval: Duration,
    /// Total ceiling per job; `None` waits indefinitely (default: 600s).
    pub job_timeout: Option<Duration>,
    /// Minimum spacing between progress callbacks (default: 500ms).
    pub progress_interval: Duration,
    /// Push-channel reconnect bound (default: `3`).
    pub reconnect_attempts: u32,
    /// Where fetched artifacts are written (default: `output`).
    pub output_dir: PathBuf,
    /// Directories searched by the fallback scan, in precedence order.
    pub fallback_dirs: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:8188".into(),
            request_timeout: Duration::from_secs(10),
            liveness_threshold: Duration::from_secs(15),
            poll_interval: Duration::from_secs(5),
            job_timeout: Some(Duration::from_secs(600)),
            progress_interval: Duration::from_millis(500),
            reconnect_attempts: 3,
            output_dir: PathBuf::from("output"),
            fallback_dirs: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default          |
    /// |--------------------------------|------------------|
    /// | `COMFYUI_SERVER`               | `127.0.0.1:8188` |
    /// | `COMFYUI_REQUEST_TIMEOUT_SECS` | `10`             |
    /// | `LIVENESS_THRESHOLD_SECS`      | `15`             |
    /// | `POLL_INTERVAL_SECS`           | `5`              |
    /// | `JOB_TIMEOUT_SECS`             | `600` (0 = none) |
    /// | `PROGRESS_INTERVAL_MS`         | `500`            |
    /// | `RECONNECT_ATTEMPTS`           | `3`              |
    /// | `OUTPUT_DIR`                   | `output`         |
    /// | `FALLBACK_DIRS`                | (empty)          |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let server = lookup("COMFYUI_SERVER")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.server);

        let request_timeout_secs: u64 = parse_var(&lookup, "COMFYUI_REQUEST_TIMEOUT_SECS", 10)?;
        let liveness_threshold_secs: u64 = parse_var(&lookup, "LIVENESS_THRESHOLD_SECS", 15)?;
        let poll_interval_secs: u64 = parse_var(&lookup, "POLL_INTERVAL_SECS", 5)?;
        let job_timeout_secs: u64 = parse_var(&lookup, "JOB_TIMEOUT_SECS", 600)?;
        let progress_interval_ms: u64 = parse_var(&lookup, "PROGRESS_INTERVAL_MS", 500)?;
        let reconnect_attempts: u32 = parse_var(&lookup, "RECONNECT_ATTEMPTS", 3)?;

        if request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "COMFYUI_REQUEST_TIMEOUT_SECS",
                value: "0".into(),
            });
        }

        let output_dir = lookup("OUTPUT_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);

        let fallback_dirs: Vec<PathBuf> = lookup("FALLBACK_DIRS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();

        Ok(Self {
            server,
            request_timeout: Duration::from_secs(request_timeout_secs),
            liveness_threshold: Duration::from_secs(liveness_threshold_secs),
            poll_interval: Duration::from_secs(poll_interval_secs),
            job_timeout: (job_timeout_secs > 0).then(|| Duration::from_secs(job_timeout_secs)),
            progress_interval: Duration::from_millis(progress_interval_ms),
            reconnect_attempts,
            output_dir,
            fallback_dirs,
        })
    }

    /// HTTP base URL of the engine.
    pub fn api_url(&self) -> String {
        format!("http://{}", self.server)
    }

    /// Reconnect policy for the push channel.
    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: self.reconnect_attempts,
            ..ReconnectConfig::default()
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
