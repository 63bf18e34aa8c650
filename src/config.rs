//! Configuration loader and validator for the imagine bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    pub sd: Sd,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Dispatch tick for the generation queue worker.
    pub queue_poll_ms: u64,
    /// Interval between progress reports while a job renders.
    pub progress_poll_ms: u64,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    pub allowed_users: Vec<i64>,
}

/// Stable Diffusion web UI API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sd {
    pub host: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.queue_poll_ms == 0 {
        return Err(ConfigError::Invalid("app.queue_poll_ms must be > 0"));
    }
    if cfg.app.progress_poll_ms == 0 {
        return Err(ConfigError::Invalid("app.progress_poll_ms must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }

    if cfg.sd.host.trim().is_empty() {
        return Err(ConfigError::Invalid("sd.host must be non-empty"));
    }
    if !cfg.sd.host.starts_with("http://") && !cfg.sd.host.starts_with("https://") {
        return Err(ConfigError::Invalid("sd.host must start with http:// or https://"));
    }

    Ok(())
}

/// Example YAML document matching the schema above.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  queue_poll_ms: 1000
  progress_poll_ms: 2000

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  allowed_users:
    - 123456789

sd:
  host: "http://127.0.0.1:7860"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_bot_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.telegram.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("telegram.bot_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_sd_host() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sd.host = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sd.host = "127.0.0.1:7860".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("sd.host")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_intervals() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.queue_poll_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.progress_poll_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(example().as_bytes()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.telegram.allowed_users, vec![123456789]);
        assert_eq!(cfg.sd.host, "http://127.0.0.1:7860");
    }
}
