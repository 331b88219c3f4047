use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_ALLOWED_MODULES: &str = "os,sys,math,datetime,json,re,random";
pub const DEFAULT_SANDBOX_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.6;
const ENV_PREFIX: &str = "DESKMATE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
}

/// Process-wide settings. Built once in `main` and handed by reference to the
/// catalogue loader, the assistant and the sandbox.
#[derive(Debug, Clone)]
pub struct Config {
    pub allowed_modules: Vec<String>,
    pub sandbox_timeout: Duration,
    pub confidence_threshold: f64,
    /// Command line used by isolated mode; the script path is appended.
    pub isolated_interpreter: Vec<String>,
    pub ui_settle_delay: Duration,
    pub dry_run: bool,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub intents_file: Option<PathBuf>,
    pub enable_code_execution: bool,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            allowed_modules: split_list(DEFAULT_ALLOWED_MODULES),
            sandbox_timeout: Duration::from_secs(DEFAULT_SANDBOX_TIMEOUT_SECS),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            isolated_interpreter: vec!["python3".to_string()],
            ui_settle_delay: Duration::from_millis(500),
            dry_run: true,
            data_dir: home.join(".deskmate"),
            log_level: "warn".to_string(),
            intents_file: None,
            enable_code_execution: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    allowed_modules: Option<Vec<String>>,
    sandbox_timeout: Option<u64>,
    confidence_threshold: Option<f64>,
    isolated_interpreter: Option<Vec<String>>,
    ui_settle_delay_ms: Option<u64>,
    dry_run: Option<bool>,
    data_dir: Option<String>,
    log_level: Option<String>,
    intents_file: Option<String>,
    enable_code_execution: Option<bool>,
}

impl Config {
    /// Defaults, then the TOML file (explicit path, or `<data_dir>/config.toml`
    /// when it exists), then `DESKMATE_*` environment variables.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        let candidate = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let default_path = config.data_dir.join("config.toml");
                default_path.exists().then_some(default_path)
            }
        };
        if let Some(path) = candidate {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            config.apply_toml(&path, &text)?;
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_toml(&mut self, path: &Path, text: &str) -> Result<(), ConfigError> {
        let file: FileConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "applying config file");

        if let Some(modules) = file.allowed_modules {
            self.allowed_modules = modules;
        }
        if let Some(secs) = file.sandbox_timeout {
            self.sandbox_timeout = Duration::from_secs(secs);
        }
        if let Some(threshold) = file.confidence_threshold {
            self.confidence_threshold = check_threshold("confidence_threshold", threshold)?;
        }
        if let Some(cmd) = file.isolated_interpreter {
            if cmd.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "isolated_interpreter".to_string(),
                    value: "[]".to_string(),
                });
            }
            self.isolated_interpreter = cmd;
        }
        if let Some(ms) = file.ui_settle_delay_ms {
            self.ui_settle_delay = Duration::from_millis(ms);
        }
        if let Some(dry_run) = file.dry_run {
            self.dry_run = dry_run;
        }
        if let Some(dir) = file.data_dir {
            self.data_dir = expand_path(&dir);
        }
        if let Some(level) = file.log_level {
            self.log_level = level;
        }
        if let Some(intents) = file.intents_file {
            self.intents_file = Some(expand_path(&intents));
        }
        if let Some(enabled) = file.enable_code_execution {
            self.enable_code_execution = enabled;
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, value)) = get("ALLOWED_MODULES") {
            self.allowed_modules = split_list(&value);
        }
        if let Some((key, value)) = get("SANDBOX_TIMEOUT") {
            let secs = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue { key, value: value.clone() })?;
            self.sandbox_timeout = Duration::from_secs(secs);
        }
        if let Some((key, value)) = get("CONFIDENCE_THRESHOLD") {
            let threshold = value
                .trim()
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidValue { key: key.clone(), value: value.clone() })?;
            self.confidence_threshold = check_threshold(&key, threshold)?;
        }
        if let Some((key, value)) = get("INTERPRETER") {
            let cmd: Vec<String> = value.split_whitespace().map(str::to_string).collect();
            if cmd.is_empty() {
                return Err(ConfigError::InvalidValue { key, value });
            }
            self.isolated_interpreter = cmd;
        }
        if let Some((_, value)) = get("LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some((key, value)) = get("DRY_RUN") {
            self.dry_run = parse_flag(&key, &value)?;
        }
        if let Some((_, value)) = get("DATA_DIR") {
            self.data_dir = expand_path(&value);
        }
        if let Some((_, value)) = get("INTENTS") {
            self.intents_file = Some(expand_path(&value));
        }
        Ok(())
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("journal.json")
    }

    pub fn repl_history_path(&self) -> PathBuf {
        self.data_dir.join("repl_history.txt")
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn check_threshold(key: &str, value: f64) -> Result<f64, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Expands `~` and `$VARS`; falls back to the raw text when expansion fails.
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(
            config.allowed_modules,
            vec!["os", "sys", "math", "datetime", "json", "re", "random"]
        );
        assert_eq!(config.sandbox_timeout, Duration::from_secs(30));
        assert_eq!(config.confidence_threshold, 0.6);
        assert!(config.dry_run);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::default();
        config
            .apply_toml(
                Path::new("config.toml"),
                "sandbox_timeout = 5\nallowed_modules = [\"math\"]\n",
            )
            .unwrap();
        assert_eq!(config.sandbox_timeout, Duration::from_secs(5));

        let env: HashMap<&str, &str> = HashMap::from([
            ("DESKMATE_SANDBOX_TIMEOUT", "2"),
            ("DESKMATE_ALLOWED_MODULES", "math, json ,"),
            ("DESKMATE_DRY_RUN", "off"),
        ]);
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.sandbox_timeout, Duration::from_secs(2));
        assert_eq!(config.allowed_modules, vec!["math", "json"]);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == "DESKMATE_CONFIDENCE_THRESHOLD").then(|| "1.5".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("DESKMATE_CONFIDENCE_THRESHOLD"));

        let err = config
            .apply_toml(Path::new("c.toml"), "unknown_key = 1")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
