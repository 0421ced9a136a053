//! TOML application settings.
//!
//! Settings are layered: the file named by `BEIWE_PIPELINE_CONFIG`, then
//! `/etc/beiwe-pipeline/pipeline.toml`, then compiled-in defaults. Every
//! section may be omitted. Pipeline object names (queue, job definition,
//! parameter names) are resolved separately by `pipeline::config`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::pipeline::Frequency;

pub const CONFIG_ENV_VAR: &str = "BEIWE_PIPELINE_CONFIG";
const SYSTEM_CONFIG_PATH: &str = "/etc/beiwe-pipeline/pipeline.toml";

// ---------------------------------------------------------------------------
// Top-level settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub setup: SetupSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl AppSettings {
    /// Load settings from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse settings file: {}", path.display()))?;
        info!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// Try the env-var path, then the system path, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(settings) => return settings,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{} set but file could not be loaded, trying fallback",
                        CONFIG_ENV_VAR
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(settings) => return settings,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system settings file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no settings file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub db_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/beiwe-pipeline.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// JSON file with pipeline object names; environment variables override it.
    pub object_names_path: PathBuf,
    /// Region passed to provisioned job definitions.
    pub region_name: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            object_names_path: PathBuf::from("pipeline/configs/aws-object-names.json"),
            region_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Talk to the batch and parameter store gateways over HTTP.
    Gateway,
    /// Keep everything in process memory.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub mode: BackendMode,
    pub batch_endpoint: String,
    pub ssm_endpoint: String,
    pub timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            mode: BackendMode::Gateway,
            batch_endpoint: "http://127.0.0.1:9400".to_string(),
            ssm_endpoint: "http://127.0.0.1:9401".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Frequencies the daemon triggers on its own. `manually` is ignored.
    pub frequencies: Vec<Frequency>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupSettings {
    /// Directory holding `compute-environment.json` and `container-props.json`.
    pub configs_dir: PathBuf,
    /// Status polls while waiting for a compute environment.
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for SetupSettings {
    fn default() -> Self {
        Self {
            configs_dir: PathBuf::from("pipeline/configs"),
            max_attempts: 120,
            delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Used when `RUST_LOG` is not set.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let s = AppSettings::default();
        assert_eq!(s.server.bind, "0.0.0.0:8080");
        assert_eq!(s.storage.db_path, PathBuf::from("data/beiwe-pipeline.db"));
        assert_eq!(s.backend.mode, BackendMode::Gateway);
        assert_eq!(s.backend.timeout_secs, 30);
        assert!(s.schedule.frequencies.is_empty());
        assert_eq!(s.setup.max_attempts, 120);
        assert_eq!(s.logging.level, "info");
        assert!(!s.logging.json);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[server]
bind = "127.0.0.1:9000"

[storage]
db_path = "/var/lib/beiwe/pipeline.db"

[pipeline]
object_names_path = "/etc/beiwe/aws-object-names.json"
region_name = "us-east-1"

[backend]
mode = "local"
timeout_secs = 5

[schedule]
frequencies = ["daily", "weekly"]

[setup]
max_attempts = 10
delay_ms = 50

[logging]
level = "debug"
json = true
"#;
        let s: AppSettings = toml::from_str(toml_str).unwrap();
        assert_eq!(s.server.bind, "127.0.0.1:9000");
        assert_eq!(s.pipeline.region_name.as_deref(), Some("us-east-1"));
        assert_eq!(s.backend.mode, BackendMode::Local);
        assert_eq!(s.backend.timeout_secs, 5);
        assert_eq!(s.schedule.frequencies, vec![Frequency::Daily, Frequency::Weekly]);
        assert_eq!(s.setup.delay_ms, 50);
        assert!(s.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let s: AppSettings = toml::from_str("[backend]\nmode = \"local\"\n").unwrap();
        assert_eq!(s.backend.mode, BackendMode::Local);
        assert_eq!(s.backend.batch_endpoint, "http://127.0.0.1:9400");
        assert_eq!(s.server.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_unknown_frequency_is_rejected() {
        let result: Result<AppSettings, _> = toml::from_str("[schedule]\nfrequencies = [\"yearly\"]\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "[server]\nbind = \"0.0.0.0:9999\"\n").unwrap();

        let s = AppSettings::load(&path).unwrap();
        assert_eq!(s.server.bind, "0.0.0.0:9999");
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(AppSettings::load(Path::new("/nonexistent/pipeline.toml")).is_err());
    }
}
