//! TOML-based configuration for reposcope.
//!
//! The backend command can be overridden at runtime through the environment
//! variable named by `backend.command_env`, resolved by
//! [`AppConfig::apply_env_overrides`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::DEFAULT_EVENT_BUFFER;
use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// How to start the backend process.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Client session settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Backend process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Executable speaking the JSON-lines protocol on stdin/stdout.
    #[serde(default = "default_command")]
    pub command: String,

    /// Extra arguments passed to the backend.
    #[serde(default)]
    pub args: Vec<String>,

    /// Repository the backend runs in. Defaults to the current directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Environment variable that, when set, replaces `command`.
    #[serde(default = "default_command_env")]
    pub command_env: String,

    /// How long to wait for the backend to exit after its stdin is closed
    /// before killing it.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_command() -> String {
    "reposcope-server".into()
}
fn default_command_env() -> String {
    "REPOSCOPE_BACKEND".into()
}
fn default_shutdown_grace() -> u64 {
    5
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            working_dir: None,
            command_env: default_command_env(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl BackendConfig {
    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_grace_secs)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Client session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long the CLI waits for a reply before giving up (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Capacity of the event broadcast buffer for subscribers.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_request_timeout() -> u64 {
    30
}
fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write logs to this file.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "warn".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** apply environment overrides -- call
    /// [`apply_env_overrides`](Self::apply_env_overrides) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Replace the backend command with the value of `backend.command_env`
    /// when that variable is set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        if self.backend.command_env.is_empty() {
            return;
        }
        match std::env::var(&self.backend.command_env) {
            Ok(val) if !val.trim().is_empty() => {
                debug!(env_name = %self.backend.command_env, command = %val, "backend command overridden");
                self.backend.command = val.trim().to_string();
            }
            Ok(_) => {
                warn!(env_name = %self.backend.command_env, "env var is set but empty");
            }
            Err(_) => {}
        }
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.command.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "backend.command".into(),
                detail: "backend command must not be empty".into(),
            });
        }
        if let Some(dir) = &self.backend.working_dir {
            if !dir.is_dir() {
                return Err(ConfigError::InvalidValue {
                    field: "backend.working_dir".into(),
                    detail: format!("'{}' is not a directory", dir.display()),
                });
            }
        }
        if self.session.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.request_timeout_secs".into(),
                detail: "request timeout must be > 0".into(),
            });
        }
        if self.session.event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.event_buffer".into(),
                detail: "event buffer must be > 0".into(),
            });
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".into(),
                detail: format!(
                    "'{}' is not one of {}",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            });
        }

        Ok(())
    }

    /// Convenience: load, apply overrides, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// A commented starter configuration, written by `reposcope init`.
    pub fn template() -> String {
        r#"# reposcope configuration

[backend]
# Executable speaking the JSON-lines protocol on stdin/stdout.
command = "reposcope-server"
args = []
# working_dir = "/path/to/repo"
# Set this variable to override `command` without editing the file.
command_env = "REPOSCOPE_BACKEND"
# Seconds to wait for the backend to exit before killing it.
shutdown_grace_secs = 5

[session]
request_timeout_secs = 30
event_buffer = 256

[logging]
level = "warn"
# file = "/tmp/reposcope.log"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[backend]
command = "/usr/local/bin/scm-server"
args = ["--stdio", "--verbose"]
command_env = "TEST_RS_BACKEND_UNUSED"

[session]
request_timeout_secs = 10
event_buffer = 32

[logging]
level = "debug"
file = "/tmp/reposcope.log"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.backend.command, "/usr/local/bin/scm-server");
        assert_eq!(config.backend.args, vec!["--stdio", "--verbose"]);
        assert_eq!(config.session.request_timeout_secs, 10);
        assert_eq!(config.session.event_buffer, 32);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.logging.file.as_deref(),
            Some(Path::new("/tmp/reposcope.log"))
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[backend\ncommand = ").unwrap();
        let result = AppConfig::load_from_file(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.backend.command = "  ".into();
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "backend.command"
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_level() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.logging.level = "loud".into();
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "logging.level"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = AppConfig::default();
        config.session.request_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "session.request_timeout_secs"
        ));
    }

    #[test]
    fn test_env_override_replaces_command() {
        std::env::set_var("TEST_RS_BACKEND", "/opt/backend");

        let mut config: AppConfig = toml::from_str(
            r#"
[backend]
command = "default-server"
command_env = "TEST_RS_BACKEND"
"#,
        )
        .unwrap();
        config.apply_env_overrides();
        assert_eq!(config.backend.command, "/opt/backend");

        // Clean up
        std::env::remove_var("TEST_RS_BACKEND");
    }

    #[test]
    fn test_unset_env_keeps_command() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.apply_env_overrides();
        assert_eq!(config.backend.command, "/usr/local/bin/scm-server");
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.backend.command, "reposcope-server");
        assert_eq!(config.backend.command_env, "REPOSCOPE_BACKEND");
        assert!(config.backend.working_dir.is_none());
        assert_eq!(config.backend.shutdown_grace(), std::time::Duration::from_secs(5));
        assert_eq!(config.session.request_timeout_secs, 30);
        assert_eq!(config.session.event_buffer, DEFAULT_EVENT_BUFFER);
        assert_eq!(config.logging.level, "warn");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_template_parses_and_validates() {
        let config: AppConfig = toml::from_str(&AppConfig::template()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.event_buffer, 256);
    }
}
