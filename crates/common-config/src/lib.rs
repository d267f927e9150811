//! Shared configuration helpers for services.
//!
//! Configuration is layered: compiled defaults, then an optional TOML file named
//! by `<PREFIX>CONFIG`, then individual `<PREFIX><KEY>` environment overrides.

use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Error type for configuration related failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Implemented by each service's top level configuration struct.
pub trait ServiceConfig: DeserializeOwned + Default {
    /// Environment variable prefix, including the trailing underscore.
    const PREFIX: &'static str;

    /// Apply `<PREFIX><KEY>` overrides on top of the file/default values.
    fn apply_environment_overrides(&mut self, prefix: &str);

    /// Reject combinations of values that deserialize fine but cannot run.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Load a service configuration from defaults, the optional config file and the environment.
pub fn load<C: ServiceConfig>() -> Result<C, ConfigError> {
    let file_var = format!("{}CONFIG", C::PREFIX);
    let mut config = match env::var(&file_var) {
        Ok(path) if !path.is_empty() => {
            tracing::info!(config_file = %path, "loading configuration file");
            from_file::<C>(path)?
        }
        _ => C::default(),
    };
    config.apply_environment_overrides(C::PREFIX);
    config.validate()?;
    Ok(config)
}

/// Parse a configuration struct from a TOML file on disk.
pub fn from_file<C: DeserializeOwned>(path: impl AsRef<Path>) -> Result<C, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Read `<prefix><key>` from the environment, ignoring unset or empty values.
pub fn env_value(prefix: &str, key: &str) -> Option<String> {
    env::var(format!("{prefix}{key}"))
        .ok()
        .filter(|value| !value.is_empty())
}

/// Overwrite `target` with the parsed value of `<prefix><key>` when it is set.
///
/// Unparseable values are logged and leave `target` untouched.
pub fn override_from_env<T>(target: &mut T, prefix: &str, key: &str)
where
    T: FromStr,
    T::Err: Display,
{
    let Some(value) = env_value(prefix, key) else {
        return;
    };
    match value.parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(error) => {
            tracing::warn!(
                var = %format!("{prefix}{key}"),
                %value,
                %error,
                "invalid override, keeping configured value"
            );
        }
    }
}

/// Split a comma separated override into trimmed, non-empty entries.
pub fn list_from_env(prefix: &str, key: &str) -> Option<Vec<String>> {
    env_value(prefix, key).map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        port: u16,
        name: String,
        tags: Vec<String>,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                port: 80,
                name: "sample".to_string(),
                tags: Vec::new(),
            }
        }
    }

    impl ServiceConfig for Sample {
        const PREFIX: &'static str = "COMMON_CONFIG_TEST_";

        fn apply_environment_overrides(&mut self, prefix: &str) {
            override_from_env(&mut self.port, prefix, "PORT");
            if let Some(name) = env_value(prefix, "NAME") {
                self.name = name;
            }
            if let Some(tags) = list_from_env(prefix, "TAGS") {
                self.tags = tags;
            }
        }
    }

    // Each test uses its own variable names; the process environment is shared.

    #[test]
    fn load_without_file_applies_overrides() {
        env::set_var("COMMON_CONFIG_TEST_PORT", "9090");
        env::set_var("COMMON_CONFIG_TEST_TAGS", " a, ,b ");
        let config = load::<Sample>().expect("load");
        env::remove_var("COMMON_CONFIG_TEST_PORT");
        env::remove_var("COMMON_CONFIG_TEST_TAGS");

        assert_eq!(config.port, 9090);
        assert_eq!(config.name, "sample");
        assert_eq!(config.tags, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn invalid_override_keeps_value() {
        env::set_var("COMMON_CONFIG_BAD_PORT", "not-a-port");
        let mut port = 8080u16;
        override_from_env(&mut port, "COMMON_CONFIG_BAD_", "PORT");
        env::remove_var("COMMON_CONFIG_BAD_PORT");
        assert_eq!(port, 8080);
    }

    #[test]
    fn from_file_reads_partial_toml() {
        let path = env::temp_dir().join(format!("common-config-{}.toml", std::process::id()));
        std::fs::write(&path, "name = \"from-file\"\n").expect("write");
        let config: Sample = from_file(&path).expect("parse");
        std::fs::remove_file(&path).ok();

        assert_eq!(config.name, "from-file");
        assert_eq!(config.port, 80);
    }

    #[test]
    fn from_file_reports_missing_file() {
        let result = from_file::<Sample>("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
