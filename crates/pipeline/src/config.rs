//! Bridge configuration loaded from `MIKTOS_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::executor::{ComfyUIExecutorConfig, ExecutorKind};

/// Largest accepted `MIKTOS_PROGRESS_BUFFER`. Each task's channel
/// allocates its full ring buffer on submission.
pub const MAX_PROGRESS_BUFFER: usize = miktos_events::broadcaster::MAX_CAPACITY;

/// Errors produced while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime configuration of the bridge.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Which executor variant to construct.
    pub executor: ExecutorKind,
    /// Settings for the ComfyUI executor.
    pub comfyui: ComfyUIExecutorConfig,
    /// Simulated duration of each standalone stage.
    pub standalone_stage_delay: Duration,
    /// Directory standalone output locations point into.
    pub output_dir: PathBuf,
    /// How long finished tasks stay queryable.
    pub task_retention: Duration,
    /// How often the retention sweeper runs.
    pub retention_sweep_interval: Duration,
    /// Per-subscriber progress buffer.
    pub progress_buffer: usize,
    /// Optional JSON file with extra workflow definitions.
    pub workflows_file: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorKind::Standalone,
            comfyui: ComfyUIExecutorConfig::default(),
            standalone_stage_delay: Duration::from_millis(500),
            output_dir: PathBuf::from("./output"),
            task_retention: Duration::from_secs(3600),
            retention_sweep_interval: Duration::from_secs(60),
            progress_buffer: 64,
            workflows_file: None,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                               | Default                 |
    /// |---------------------------------------|-------------------------|
    /// | `MIKTOS_EXECUTOR`                     | `standalone`            |
    /// | `MIKTOS_COMFYUI_URL`                  | `http://localhost:8188` |
    /// | `MIKTOS_COMFYUI_CONNECT_TIMEOUT_SECS` | `5`                     |
    /// | `MIKTOS_COMFYUI_REQUEST_TIMEOUT_SECS` | `30`                    |
    /// | `MIKTOS_EXECUTION_TIMEOUT_SECS`       | `300`                   |
    /// | `MIKTOS_STANDALONE_STAGE_DELAY_MS`    | `500`                   |
    /// | `MIKTOS_OUTPUT_DIR`                   | `./output`              |
    /// | `MIKTOS_TASK_RETENTION_SECS`          | `3600`                  |
    /// | `MIKTOS_RETENTION_SWEEP_SECS`         | `60`                    |
    /// | `MIKTOS_PROGRESS_BUFFER`              | `64` (max 65536)        |
    /// | `MIKTOS_WORKFLOWS_FILE`               | unset                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from an arbitrary
    /// source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let executor = match get("MIKTOS_EXECUTOR") {
            Some(value) => ExecutorKind::from_str(&value).map_err(|reason| ConfigError::Invalid {
                var: "MIKTOS_EXECUTOR",
                value,
                reason,
            })?,
            None => defaults.executor,
        };

        let comfyui = ComfyUIExecutorConfig {
            base_url: get("MIKTOS_COMFYUI_URL").unwrap_or(defaults.comfyui.base_url),
            connect_timeout: secs(
                &get,
                "MIKTOS_COMFYUI_CONNECT_TIMEOUT_SECS",
                defaults.comfyui.connect_timeout,
            )?,
            request_timeout: secs(
                &get,
                "MIKTOS_COMFYUI_REQUEST_TIMEOUT_SECS",
                defaults.comfyui.request_timeout,
            )?,
            execution_timeout: secs(
                &get,
                "MIKTOS_EXECUTION_TIMEOUT_SECS",
                defaults.comfyui.execution_timeout,
            )?,
            poll_backoff: defaults.comfyui.poll_backoff,
        };

        let standalone_stage_delay = match get("MIKTOS_STANDALONE_STAGE_DELAY_MS") {
            Some(value) => Duration::from_millis(parse(&value, "MIKTOS_STANDALONE_STAGE_DELAY_MS")?),
            None => defaults.standalone_stage_delay,
        };

        let progress_buffer = match get("MIKTOS_PROGRESS_BUFFER") {
            Some(value) => match parse::<usize>(&value, "MIKTOS_PROGRESS_BUFFER")? {
                0 => {
                    return Err(ConfigError::Invalid {
                        var: "MIKTOS_PROGRESS_BUFFER",
                        value,
                        reason: "must be greater than zero".into(),
                    })
                }
                n if n > MAX_PROGRESS_BUFFER => {
                    return Err(ConfigError::Invalid {
                        var: "MIKTOS_PROGRESS_BUFFER",
                        value,
                        reason: format!("must be at most {MAX_PROGRESS_BUFFER}"),
                    })
                }
                n => n,
            },
            None => defaults.progress_buffer,
        };

        Ok(Self {
            executor,
            comfyui,
            standalone_stage_delay,
            output_dir: get("MIKTOS_OUTPUT_DIR").map_or(defaults.output_dir, PathBuf::from),
            task_retention: secs(&get, "MIKTOS_TASK_RETENTION_SECS", defaults.task_retention)?,
            retention_sweep_interval: secs(
                &get,
                "MIKTOS_RETENTION_SWEEP_SECS",
                defaults.retention_sweep_interval,
            )?,
            progress_buffer,
            workflows_file: get("MIKTOS_WORKFLOWS_FILE").map(PathBuf::from),
        })
    }
}

fn parse<T>(value: &str, var: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// A strictly positive number of seconds.
fn secs(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(value) = get(var) else {
        return Ok(default);
    };
    match parse::<u64>(&value, var)? {
        0 => Err(ConfigError::Invalid {
            var,
            value,
            reason: "must be greater than zero".into(),
        }),
        n => Ok(Duration::from_secs(n)),
    }
}
