//! TOML configuration for scriptseq.
//!
//! Layered lookup: an explicit path (CLI flag), the `SCRIPTSEQ_CONFIG`
//! environment variable, `./scriptseq.toml`, then compiled-in defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "SCRIPTSEQ_CONFIG";

/// Config file picked up from the working directory.
pub const LOCAL_CONFIG_FILE: &str = "scriptseq.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration using the layered lookup order.
    ///
    /// A file that is named explicitly (flag or environment) must load; the
    /// working-directory file is optional.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            if !env_path.is_empty() {
                return Self::load(Path::new(&env_path))
                    .with_context(|| format!("{} points at an unusable file", CONFIG_ENV));
            }
        }

        let local = Path::new(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Self::load(local);
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// JSON form of the effective config, persisted with every run.
    pub fn snapshot(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// How each script process is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Program that receives the script path as its last argument
    /// (e.g. `python3`). Scripts are executed directly when unset.
    pub interpreter: Option<String>,
    /// Arguments placed between the interpreter and the script path.
    pub interpreter_args: Vec<String>,
    /// Working directory for every script. Inherited when unset.
    pub working_dir: Option<PathBuf>,
    /// Ordered decoder names tried on each output line. Lossy UTF-8 is
    /// always appended as the last resort.
    pub encodings: Vec<String>,
    /// Time allowed between SIGTERM and SIGKILL when a script is stopped.
    pub terminate_grace_ms: u64,
    /// Extra environment for every script.
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let env = [
            ("PYTHONIOENCODING", "utf-8"),
            ("PYTHONUNBUFFERED", "1"),
            ("LC_ALL", "C.UTF-8"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            interpreter: None,
            interpreter_args: Vec::new(),
            working_dir: None,
            encodings: vec!["utf-8".to_string(), "latin-1".to_string()],
            terminate_grace_ms: 5000,
            env,
        }
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Tokens and markers used to classify script output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub pass_token: String,
    /// Usually a superstring of `pass_token`.
    pub fail_token: String,
    /// Lines starting with one of these (after leading whitespace) are ignored.
    pub noise_markers: Vec<String>,
    /// Phrases that announce a final result; matched case-insensitively.
    pub end_markers: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            pass_token: "OK".to_string(),
            fail_token: "NOT-OK".to_string(),
            noise_markers: vec!["DEBUG:".to_string(), "TRACE:".to_string(), "#".to_string()],
            end_markers: vec![
                "final result".to_string(),
                "test result".to_string(),
                "overall result".to_string(),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Attempts made after a busy/locked error before giving up on a write.
    pub busy_retries: u32,
    /// Base backoff between busy retries; grows linearly per attempt.
    pub busy_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/scriptseq.db"),
            busy_retries: 5,
            busy_backoff_ms: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON log lines instead of the human format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[runner]\ninterpreter = \"python3\"\n\n[classifier]\npass_token = \"PASS\"\nfail_token = \"NO PASS\""
        )
        .unwrap();

        let cfg = AppConfig::load(file.path()).unwrap();
        assert_eq!(cfg.runner.interpreter.as_deref(), Some("python3"));
        assert_eq!(cfg.runner.terminate_grace_ms, 5000);
        assert_eq!(cfg.classifier.fail_token, "NO PASS");
        assert_eq!(cfg.storage.db_path, PathBuf::from("data/scriptseq.db"));
        assert_eq!(cfg.runner.env.get("PYTHONIOENCODING").map(String::as_str), Some("utf-8"));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        assert!(AppConfig::resolve(Some(Path::new("/nonexistent/scriptseq.toml"))).is_err());
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.classifier.pass_token, "OK");
        assert_eq!(parsed.runner.encodings, vec!["utf-8", "latin-1"]);
    }

    #[test]
    fn test_snapshot_is_json() {
        let snap = AppConfig::default().snapshot();
        let v: serde_json::Value = serde_json::from_str(&snap).unwrap();
        assert_eq!(v["classifier"]["fail_token"], "NOT-OK");
    }
}
