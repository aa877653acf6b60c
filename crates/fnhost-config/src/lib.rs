#![warn(missing_docs)]

//! # fnhost-config
//!
//! Configuration loading for the fnhost execution engine.
//!
//! Supports TOML configuration files with environment variable expansion.
//! Every key is optional; absent keys take the engine defaults.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! timeout_ms = 5000
//! max_timeout_ms = 30000
//! max_heap_mb = 64
//! max_heap_ceiling_mb = 256
//! max_concurrent = 8
//! max_code_kb = 64
//! max_output_kb = 1024
//! max_kv_ops = 100
//!
//! [kv]
//! enabled = true
//! max_keys = 1024
//! default_ttl_secs = 3600
//!
//! [audit]
//! enabled = true
//! path = "${FNHOST_HOME}/audit.jsonl"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use fnhost_sandbox::{KvConfig, SandboxConfig};
use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "FNHOST_CONFIG";

/// Config file looked up in the working directory when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_FILE: &str = "fnhost.toml";

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level fnhost configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FnhostConfig {
    /// Sandbox limits.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Key/value store settings.
    #[serde(default)]
    pub kv: KvOverrides,

    /// Audit log settings.
    #[serde(default)]
    pub audit: AuditSettings,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Default execution timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Ceiling for per-function timeouts in milliseconds.
    #[serde(default)]
    pub max_timeout_ms: Option<u64>,

    /// Default V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Ceiling for per-function memory limits in megabytes.
    #[serde(default)]
    pub max_heap_ceiling_mb: Option<usize>,

    /// Maximum concurrent invocations.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum function source size in kilobytes.
    #[serde(default)]
    pub max_code_kb: Option<usize>,

    /// Maximum serialized result size in kilobytes.
    #[serde(default)]
    pub max_output_kb: Option<usize>,

    /// Maximum kv operations per invocation.
    #[serde(default)]
    pub max_kv_ops: Option<usize>,
}

/// Key/value store overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KvOverrides {
    /// Inject the `kv` capability into sandboxes.
    #[serde(default)]
    pub enabled: bool,

    /// Maximum number of live keys.
    #[serde(default)]
    pub max_keys: Option<usize>,

    /// Maximum size of one value in kilobytes.
    #[serde(default)]
    pub max_value_size_kb: Option<usize>,

    /// Maximum combined size of all values in megabytes.
    #[serde(default)]
    pub max_total_size_mb: Option<usize>,

    /// TTL applied when none is given, in seconds.
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,

    /// Ceiling for caller TTLs, in seconds.
    #[serde(default)]
    pub max_ttl_secs: Option<u64>,
}

/// Audit log settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditSettings {
    /// Emit audit entries.
    #[serde(default)]
    pub enabled: bool,

    /// JSON lines file to append to. When unset, entries go to tracing.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl FnhostConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: FnhostConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_with_env(&content)
    }

    /// Load from `$FNHOST_CONFIG`, else `./fnhost.toml`, else defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::load_from(explicit.as_deref(), Path::new("."))
    }

    /// Resolve the config file: `explicit` must exist when given; otherwise
    /// `dir/fnhost.toml` is used if present.
    pub fn load_from(explicit: Option<&Path>, dir: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            tracing::debug!(path = %path.display(), "loading config");
            return Self::from_file_with_env(path);
        }
        let candidate = dir.join(DEFAULT_CONFIG_FILE);
        if candidate.is_file() {
            tracing::debug!(path = %candidate.display(), "loading config");
            return Self::from_file_with_env(&candidate);
        }
        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    /// The sandbox configuration these settings describe.
    pub fn sandbox_config(&self) -> Result<SandboxConfig, ConfigError> {
        let s = &self.sandbox;
        let defaults = SandboxConfig::default();
        Ok(SandboxConfig {
            timeout: s.timeout_ms.map(Duration::from_millis).unwrap_or(defaults.timeout),
            max_timeout: s
                .max_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_timeout),
            max_heap_size: scaled("sandbox.max_heap_mb", s.max_heap_mb, MIB)?
                .unwrap_or(defaults.max_heap_size),
            max_heap_ceiling: scaled("sandbox.max_heap_ceiling_mb", s.max_heap_ceiling_mb, MIB)?
                .unwrap_or(defaults.max_heap_ceiling),
            max_concurrent: s.max_concurrent.unwrap_or(defaults.max_concurrent),
            max_code_size: scaled("sandbox.max_code_kb", s.max_code_kb, KIB)?
                .unwrap_or(defaults.max_code_size),
            max_output_size: scaled("sandbox.max_output_kb", s.max_output_kb, KIB)?
                .unwrap_or(defaults.max_output_size),
            max_kv_ops: s.max_kv_ops.unwrap_or(defaults.max_kv_ops),
        })
    }

    /// The kv store configuration, or `None` when kv is disabled.
    pub fn kv_config(&self) -> Result<Option<KvConfig>, ConfigError> {
        let kv = &self.kv;
        if !kv.enabled {
            return Ok(None);
        }
        let defaults = KvConfig::default();
        Ok(Some(KvConfig {
            max_keys: kv.max_keys.unwrap_or(defaults.max_keys),
            max_value_size: scaled("kv.max_value_size_kb", kv.max_value_size_kb, KIB)?
                .unwrap_or(defaults.max_value_size),
            max_total_size: scaled("kv.max_total_size_mb", kv.max_total_size_mb, MIB)?
                .unwrap_or(defaults.max_total_size),
            default_ttl: kv
                .default_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            max_ttl: kv.max_ttl_secs.map(Duration::from_secs).unwrap_or(defaults.max_ttl),
        }))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sandbox;
        for (name, value) in [
            ("sandbox.timeout_ms", s.timeout_ms.map(|v| v as usize)),
            ("sandbox.max_timeout_ms", s.max_timeout_ms.map(|v| v as usize)),
            ("sandbox.max_heap_mb", s.max_heap_mb),
            ("sandbox.max_heap_ceiling_mb", s.max_heap_ceiling_mb),
            ("sandbox.max_concurrent", s.max_concurrent),
            ("sandbox.max_code_kb", s.max_code_kb),
            ("sandbox.max_output_kb", s.max_output_kb),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("'{name}' must be greater than 0")));
            }
        }

        let sandbox = self.sandbox_config()?;
        if sandbox.timeout > sandbox.max_timeout {
            return Err(ConfigError::Invalid(format!(
                "'sandbox.timeout_ms' ({}) exceeds 'sandbox.max_timeout_ms' ({})",
                sandbox.timeout.as_millis(),
                sandbox.max_timeout.as_millis()
            )));
        }
        if sandbox.max_heap_size > sandbox.max_heap_ceiling {
            return Err(ConfigError::Invalid(format!(
                "'sandbox.max_heap_mb' ({}) exceeds 'sandbox.max_heap_ceiling_mb' ({})",
                sandbox.max_heap_size / MIB,
                sandbox.max_heap_ceiling / MIB
            )));
        }

        if let Some(kv) = self.kv_config()? {
            if kv.max_keys == 0 {
                return Err(ConfigError::Invalid("'kv.max_keys' must be greater than 0".into()));
            }
            if kv.default_ttl > kv.max_ttl {
                return Err(ConfigError::Invalid(format!(
                    "'kv.default_ttl_secs' ({}) exceeds 'kv.max_ttl_secs' ({})",
                    kv.default_ttl.as_secs(),
                    kv.max_ttl.as_secs()
                )));
            }
        }
        Ok(())
    }
}

/// `value` in bytes, or an error if it does not fit in `usize`.
fn scaled(name: &str, value: Option<usize>, unit: usize) -> Result<Option<usize>, ConfigError> {
    value
        .map(|v| {
            v.checked_mul(unit)
                .ok_or_else(|| ConfigError::Invalid(format!("'{name}' ({v}) is too large")))
        })
        .transpose()
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
///
/// `${VAR:-fallback}` uses `fallback` when `VAR` is unset.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut reference = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                reference.push(c);
            }
            let (name, fallback) = match reference.split_once(":-") {
                Some((name, fallback)) => (name, Some(fallback)),
                None => (reference.as_str(), None),
            };
            match (std::env::var(name), fallback) {
                (Ok(value), _) => result.push_str(&value),
                (Err(_), Some(fallback)) => result.push_str(fallback),
                // unresolved references are left in place
                (Err(_), None) => result.push_str(&format!("${{{reference}}}")),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_empty_is_defaults() {
        let config = FnhostConfig::from_toml("").unwrap();
        let sandbox = config.sandbox_config().unwrap();
        assert_eq!(sandbox.timeout, Duration::from_secs(5));
        assert_eq!(sandbox.max_heap_size, 64 * MIB);
        assert_eq!(sandbox.max_concurrent, 8);
        assert!(config.kv_config().unwrap().is_none());
        assert!(!config.audit.enabled);
    }

    #[test]
    fn config_parses_sandbox_overrides() {
        let toml = r#"
            [sandbox]
            timeout_ms = 2500
            max_timeout_ms = 10000
            max_heap_mb = 32
            max_heap_ceiling_mb = 128
            max_concurrent = 4
            max_code_kb = 16
            max_output_kb = 256
            max_kv_ops = 10
        "#;

        let sandbox = FnhostConfig::from_toml(toml).unwrap().sandbox_config().unwrap();
        assert_eq!(sandbox.timeout, Duration::from_millis(2500));
        assert_eq!(sandbox.max_timeout, Duration::from_secs(10));
        assert_eq!(sandbox.max_heap_size, 32 * MIB);
        assert_eq!(sandbox.max_heap_ceiling, 128 * MIB);
        assert_eq!(sandbox.max_concurrent, 4);
        assert_eq!(sandbox.max_code_size, 16 * KIB);
        assert_eq!(sandbox.max_output_size, 256 * KIB);
        assert_eq!(sandbox.max_kv_ops, 10);
    }

    #[test]
    fn config_parses_kv_section() {
        let toml = r#"
            [kv]
            enabled = true
            max_keys = 10
            max_value_size_kb = 4
            default_ttl_secs = 60
            max_ttl_secs = 120
        "#;

        let kv = FnhostConfig::from_toml(toml).unwrap().kv_config().unwrap().unwrap();
        assert_eq!(kv.max_keys, 10);
        assert_eq!(kv.max_value_size, 4 * KIB);
        assert_eq!(kv.max_total_size, 32 * MIB);
        assert_eq!(kv.default_ttl, Duration::from_secs(60));
        assert_eq!(kv.max_ttl, Duration::from_secs(120));
    }

    #[test]
    fn config_rejects_zero_values() {
        for toml in [
            "[sandbox]\ntimeout_ms = 0",
            "[sandbox]\nmax_heap_mb = 0",
            "[sandbox]\nmax_concurrent = 0",
        ] {
            let err = FnhostConfig::from_toml(toml).unwrap_err();
            assert!(err.to_string().contains("greater than 0"), "{toml}: {err}");
        }
    }

    #[test]
    fn config_rejects_sizes_that_overflow() {
        for toml in [
            "[sandbox]\nmax_heap_mb = 9223372036854775807\nmax_heap_ceiling_mb = 9223372036854775807",
            "[sandbox]\nmax_output_kb = 9223372036854775807",
            "[kv]\nenabled = true\nmax_total_size_mb = 9223372036854775807",
        ] {
            let err = FnhostConfig::from_toml(toml).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{toml}: {err}");
            assert!(err.to_string().contains("too large"), "{toml}: {err}");
        }
    }

    #[test]
    fn config_rejects_defaults_above_ceilings() {
        let err = FnhostConfig::from_toml("[sandbox]\ntimeout_ms = 60000").unwrap_err();
        assert!(err.to_string().contains("max_timeout_ms"), "{err}");

        let err = FnhostConfig::from_toml("[sandbox]\nmax_heap_mb = 512").unwrap_err();
        assert!(err.to_string().contains("max_heap_ceiling_mb"), "{err}");

        let err = FnhostConfig::from_toml(
            "[kv]\nenabled = true\ndefault_ttl_secs = 100\nmax_ttl_secs = 10",
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_ttl_secs"), "{err}");
    }

    #[test]
    fn config_rejects_unknown_keys() {
        let err = FnhostConfig::from_toml("[sandbox]\ntimeout_secs = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err}");
    }

    #[test]
    fn config_expands_environment_variables() {
        std::env::set_var("FNHOST_TEST_AUDIT_DIR", "/var/log/fnhost");
        let toml = r#"
            [audit]
            enabled = true
            path = "${FNHOST_TEST_AUDIT_DIR}/audit.jsonl"
        "#;

        let config = FnhostConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(
            config.audit.path.as_deref(),
            Some(Path::new("/var/log/fnhost/audit.jsonl"))
        );
        std::env::remove_var("FNHOST_TEST_AUDIT_DIR");
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_12345} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_12345} suffix");
    }

    #[test]
    fn env_var_expansion_uses_fallback() {
        let result = expand_env_vars("max_concurrent = ${DEFINITELY_NOT_SET_67890:-3}");
        assert_eq!(result, "max_concurrent = 3");
    }

    #[test]
    fn config_loads_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[sandbox]\nmax_concurrent = 2\n").unwrap();

        let config = FnhostConfig::load_from(Some(&path), Path::new("/nonexistent")).unwrap();
        assert_eq!(config.sandbox_config().unwrap().max_concurrent, 2);
    }

    #[test]
    fn config_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let err = FnhostConfig::load_from(Some(&missing), dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn config_falls_back_to_working_directory_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "[kv]\nenabled = true\n").unwrap();

        let config = FnhostConfig::load_from(None, dir.path()).unwrap();
        assert!(config.kv_config().unwrap().is_some());
    }

    #[test]
    fn config_defaults_when_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = FnhostConfig::load_from(None, dir.path()).unwrap();
        assert!(config.kv_config().unwrap().is_none());
        assert_eq!(config.sandbox_config().unwrap().max_kv_ops, 100);
    }
}
