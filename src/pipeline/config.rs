//! Pipeline object names: a JSON file overlaid by environment variables.
//!
//! A missing file is not an error (the environment alone may be enough); a
//! file that exists but cannot be parsed is. After the overlay every
//! required key must be present, and all missing keys are reported together.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::Frequency;

pub const QUEUE_NAME: &str = "queue_name";
pub const JOB_DEFN_NAME: &str = "job_defn_name";
pub const JOB_NAME: &str = "job_name";
pub const ACCESS_KEY_SSM_NAME: &str = "access_key_ssm_name";
pub const SECRET_KEY_SSM_NAME: &str = "secret_key_ssm_name";

pub const AMI_NAME: &str = "ami_name";
pub const ECR_REPO_NAME: &str = "ecr_repo_name";
pub const INSTANCE_PROFILE: &str = "instance_profile";
pub const COMP_ENV_NAME: &str = "comp_env_name";
pub const COMP_ENV_ROLE: &str = "comp_env_role";
pub const SECURITY_GROUP: &str = "security_group";

pub const REGION_NAME: &str = "region_name";
pub const SERVER_URL: &str = "server_url";

/// Keys steady-state job submission and credential rotation need.
pub const JOB_SUBMISSION_KEYS: [&str; 5] = [
    QUEUE_NAME,
    JOB_DEFN_NAME,
    JOB_NAME,
    ACCESS_KEY_SSM_NAME,
    SECRET_KEY_SSM_NAME,
];

/// Keys only infrastructure setup needs.
pub const INFRASTRUCTURE_KEYS: [&str; 6] = [
    AMI_NAME,
    ECR_REPO_NAME,
    INSTANCE_PROFILE,
    COMP_ENV_NAME,
    COMP_ENV_ROLE,
    SECURITY_GROUP,
];

const OPTIONAL_KEYS: [&str; 2] = [REGION_NAME, SERVER_URL];

/// Placeholder in the `job_name` template.
pub const FREQ_PLACEHOLDER: &str = "{freq}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find the following settings: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("configuration file {} is malformed: {message}", .path.display())]
    Malformed { path: PathBuf, message: String },

    #[error("failed to read configuration file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Who is resolving the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationContext {
    /// The always-on web process: only the keys needed to rotate and submit.
    Webserver,
    /// Offline scripts and setup: the full generic key set.
    Script,
}

impl InvocationContext {
    pub fn required_keys(&self) -> Vec<&'static str> {
        match self {
            InvocationContext::Webserver => JOB_SUBMISSION_KEYS.to_vec(),
            InvocationContext::Script => JOB_SUBMISSION_KEYS
                .iter()
                .chain(INFRASTRUCTURE_KEYS.iter())
                .copied()
                .collect(),
        }
    }
}

/// Source of environment overrides.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Resolved key/value settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedConfig {
    values: BTreeMap<String, String>,
}

impl ResolvedConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::Missing(vec![key.to_string()]))
    }

    /// Job name with the frequency substituted into the template.
    pub fn job_name(&self, freq: Frequency) -> Result<String, ConfigError> {
        Ok(self.require(JOB_NAME)?.replace(FREQ_PLACEHOLDER, freq.as_str()))
    }

    /// Parameter-store names for the access and secret key of `freq`.
    pub fn ssm_names(&self, freq: Frequency) -> Result<(String, String), ConfigError> {
        Ok((
            format!("{}-{}", self.require(ACCESS_KEY_SSM_NAME)?, freq),
            format!("{}-{}", self.require(SECRET_KEY_SSM_NAME)?, freq),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ConfigResolver<E = ProcessEnv> {
    path: Option<PathBuf>,
    env: E,
}

impl ConfigResolver<ProcessEnv> {
    /// Resolve from `path` and the process environment.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            env: ProcessEnv,
        }
    }
}

impl<E: EnvSource> ConfigResolver<E> {
    pub fn with_env(path: Option<PathBuf>, env: E) -> Self {
        Self { path, env }
    }

    pub fn resolve_for(&self, context: InvocationContext) -> Result<ResolvedConfig, ConfigError> {
        self.resolve(&context.required_keys())
    }

    /// Load the file (if any), overlay the environment, then check `required`.
    pub fn resolve(&self, required: &[&str]) -> Result<ResolvedConfig, ConfigError> {
        let mut values = match &self.path {
            Some(path) => load_file(path)?,
            None => BTreeMap::new(),
        };

        let known = JOB_SUBMISSION_KEYS
            .iter()
            .chain(INFRASTRUCTURE_KEYS.iter())
            .chain(OPTIONAL_KEYS.iter());
        for key in known {
            if let Some(value) = self.env.var(key) {
                values.insert(key.to_string(), value);
            }
        }
        for key in required {
            if let Some(value) = self.env.var(key) {
                values.insert(key.to_string(), value);
            }
        }

        let mut seen = BTreeSet::new();
        let missing: Vec<String> = required
            .iter()
            .filter(|key| !values.contains_key(**key) && seen.insert(**key))
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        Ok(ResolvedConfig { values })
    }
}

fn load_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no pipeline object names file, using environment only");
            return Ok(BTreeMap::new());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let malformed = |message: String| ConfigError::Malformed {
        path: path.to_path_buf(),
        message,
    };

    let parsed: serde_json::Value = serde_json::from_str(&content).map_err(|e| malformed(e.to_string()))?;
    let object = parsed
        .as_object()
        .ok_or_else(|| malformed("top level must be a JSON object".to_string()))?;

    let mut values = BTreeMap::new();
    for (key, value) in object {
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Null => continue,
            _ => return Err(malformed(format!("value of '{}' must be a string", key))),
        };
        values.insert(key.clone(), text);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("aws-object-names.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(&dir, r#"{"queue_name": "q1"}"#);
        let resolver = ConfigResolver::with_env(Some(path), env(&[("queue_name", "q2")]));

        let config = resolver.resolve(&[QUEUE_NAME]).unwrap();
        assert_eq!(config.get(QUEUE_NAME), Some("q2"));
    }

    #[test]
    fn test_missing_file_falls_back_to_environment() {
        let resolver = ConfigResolver::with_env(
            Some(PathBuf::from("/nonexistent/aws-object-names.json")),
            env(&[("queue_name", "q")]),
        );
        let config = resolver.resolve(&[QUEUE_NAME]).unwrap();
        assert_eq!(config.get(QUEUE_NAME), Some("q"));
    }

    #[test]
    fn test_all_missing_keys_are_enumerated() {
        let resolver = ConfigResolver::with_env(None, env(&[("job_name", "beiwe-{freq}")]));
        let err = resolver.resolve_for(InvocationContext::Webserver).unwrap_err();

        match err {
            ConfigError::Missing(keys) => {
                assert_eq!(
                    keys,
                    vec!["queue_name", "job_defn_name", "access_key_ssm_name", "secret_key_ssm_name"]
                );
            }
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn test_repeated_required_key_is_reported_once() {
        let resolver = ConfigResolver::with_env(None, HashMap::new());
        match resolver.resolve(&[QUEUE_NAME, JOB_NAME, QUEUE_NAME]) {
            Err(ConfigError::Missing(keys)) => assert_eq!(keys, vec!["queue_name", "job_name"]),
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_file_is_fatal_and_distinct() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(&dir, "{ not json");
        let resolver = ConfigResolver::with_env(Some(path), env(&[("queue_name", "q")]));
        assert!(matches!(
            resolver.resolve(&[QUEUE_NAME]),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn test_non_object_file_is_malformed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(&dir, r#"["queue_name"]"#);
        let resolver = ConfigResolver::with_env(Some(path), HashMap::new());
        assert!(matches!(resolver.resolve(&[]), Err(ConfigError::Malformed { .. })));
    }

    #[test]
    fn test_script_context_requires_infrastructure_keys() {
        let mut vars = env(&[]);
        for key in JOB_SUBMISSION_KEYS {
            vars.insert(key.to_string(), "x".to_string());
        }
        let resolver = ConfigResolver::with_env(None, vars);

        assert!(resolver.resolve_for(InvocationContext::Webserver).is_ok());
        match resolver.resolve_for(InvocationContext::Script) {
            Err(ConfigError::Missing(keys)) => assert_eq!(keys.len(), INFRASTRUCTURE_KEYS.len()),
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn test_job_name_and_ssm_names_are_frequency_scoped() {
        let resolver = ConfigResolver::with_env(
            None,
            env(&[
                ("job_name", "beiwe-pipeline-{freq}"),
                ("access_key_ssm_name", "beiwe-access"),
                ("secret_key_ssm_name", "beiwe-secret"),
            ]),
        );
        let config = resolver.resolve(&[JOB_NAME]).unwrap();

        assert_eq!(config.job_name(Frequency::Weekly).unwrap(), "beiwe-pipeline-weekly");
        let (access, secret) = config.ssm_names(Frequency::Daily).unwrap();
        assert_eq!(access, "beiwe-access-daily");
        assert_eq!(secret, "beiwe-secret-daily");
    }

    #[test]
    fn test_numeric_values_are_stringified() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(&dir, r#"{"queue_name": 7, "region_name": null}"#);
        let config = ConfigResolver::with_env(Some(path), HashMap::new())
            .resolve(&[QUEUE_NAME])
            .unwrap();
        assert_eq!(config.get(QUEUE_NAME), Some("7"));
        assert_eq!(config.get(REGION_NAME), None);
    }
}
