use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, TrellisError};

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrellisConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool size per execution. Defaults to the available parallelism.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Iteration cap applied to loops that do not set their own.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl EngineConfig {
    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|n| *n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_max_iterations() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Modules snippets may import. Anything else is refused before execution.
    #[serde(default = "default_allowed_modules")]
    pub allowed_modules: Vec<String>,
    #[serde(default)]
    pub add_traceback: bool,
    /// Interpreter steps allowed per top-level statement.
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Largest single allocation a snippet may request, in bytes.
    #[serde(default = "default_max_alloc_bytes")]
    pub max_alloc_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_modules: default_allowed_modules(),
            add_traceback: false,
            max_steps: default_max_steps(),
            max_depth: default_max_depth(),
            max_alloc_bytes: default_max_alloc_bytes(),
        }
    }
}

fn default_allowed_modules() -> Vec<String> {
    ["math", "json", "random", "re", "statistics", "string", "time"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}
fn default_max_steps() -> u64 {
    1_000_000
}
fn default_max_depth() -> usize {
    64
}
fn default_max_alloc_bytes() -> usize {
    64 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_search_url")]
    pub search_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Search results fetched when a request does not say how many.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Page text is truncated to this many characters.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            search_url: default_search_url(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            max_results: default_max_results(),
            max_length: default_max_length(),
        }
    }
}

fn default_search_url() -> String {
    "https://html.duckduckgo.com/html/".into()
}
fn default_user_agent() -> String {
    format!("Trellis/{}", env!("CARGO_PKG_VERSION"))
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_results() -> usize {
    5
}
fn default_max_length() -> usize {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "trellis=info,warn".into()
}

impl TrellisConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TrellisError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| TrellisError::Config(e.to_string()))?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load from `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Replace `${VAR}` with the environment value, leaving unset variables untouched.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    warn!(var = %var_name, "config references an unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name))
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_TRELLIS_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_TRELLIS_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_TRELLIS_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_TRELLIS_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_TRELLIS_VAR}\"");
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: TrellisConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_iterations, 1024);
        assert!(config.engine.workers.is_none());
        assert!(config.engine.worker_count() >= 1);
        assert!(config.sandbox.allowed_modules.contains(&"math".to_string()));
        assert!(!config.sandbox.add_traceback);
        assert_eq!(config.sandbox.max_depth, 64);
        assert_eq!(config.sandbox.max_alloc_bytes, 64 * 1024 * 1024);
        assert_eq!(config.web.max_results, 5);
        assert_eq!(config.log.filter, "trellis=info,warn");
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
[engine]
workers = 2

[sandbox]
allowed_modules = ["math"]
add_traceback = true
"#;
        let config: TrellisConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.worker_count(), 2);
        assert_eq!(config.engine.max_iterations, 1024);
        assert_eq!(config.sandbox.allowed_modules, vec!["math".to_string()]);
        assert!(config.sandbox.add_traceback);
        assert_eq!(config.sandbox.max_steps, 1_000_000);
    }

    #[test]
    fn test_zero_workers_falls_back() {
        let config = EngineConfig {
            workers: Some(0),
            ..Default::default()
        };
        assert!(config.worker_count() >= 1);
    }
}
