use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use common_config::{env_value, list_from_env, override_from_env, ConfigError, ServiceConfig};
use reqwest::Url;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenVerifierConfig {
    pub bind_address: String,
    pub port: u16,
    pub provider: ProviderConfig,
    pub retry: RetrySettings,
    /// Serve inbound traffic over TLS when set; plain HTTP otherwise.
    pub tls: Option<TlsConfig>,
}

/// Where and how to reach the identity provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider domain. A bare host is treated as `https://<host>`.
    pub domain: String,
    pub verify_path: String,
    pub profile_path: String,
    pub timeout_ms: u64,
    /// Channels whose tokens are accepted. Empty accepts any channel.
    pub allowed_client_ids: Vec<String>,
    pub allow_insecure_http: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Extra random delay as a fraction of the computed backoff, in `0.0..=1.0`.
    pub jitter: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for TokenVerifierConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            provider: ProviderConfig::default(),
            retry: RetrySettings::default(),
            tls: None,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            domain: "https://api.line.me".to_string(),
            verify_path: "/oauth2/v2.1/verify".to_string(),
            profile_path: "/v2/profile".to_string(),
            timeout_ms: 5_000,
            allowed_client_ids: Vec::new(),
            allow_insecure_http: false,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
            jitter: 0.2,
        }
    }
}

impl TokenVerifierConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.port).parse()
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolve the configured domain into a base URL, enforcing HTTPS unless opted out.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let domain = self.domain.trim().trim_end_matches('/');
        if domain.is_empty() {
            return Err(ConfigError::Invalid("provider.domain must be set".to_string()));
        }
        let raw = if domain.contains("://") {
            domain.to_string()
        } else {
            format!("https://{domain}")
        };
        let url = Url::parse(&raw)
            .map_err(|err| ConfigError::Invalid(format!("provider.domain {raw:?}: {err}")))?;
        match url.scheme() {
            "https" => Ok(url),
            "http" if self.allow_insecure_http => Ok(url),
            scheme => Err(ConfigError::Invalid(format!(
                "provider.domain must use https, got {scheme}"
            ))),
        }
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ConfigError> {
        self.base_url()?
            .join(path)
            .map_err(|err| ConfigError::Invalid(format!("provider path {path:?}: {err}")))
    }
}

impl ServiceConfig for TokenVerifierConfig {
    const PREFIX: &'static str = "TOKEN_VERIFIER_";

    fn apply_environment_overrides(&mut self, prefix: &str) {
        if let Some(address) = env_value(prefix, "BIND_ADDRESS") {
            self.bind_address = address;
        }
        override_from_env(&mut self.port, prefix, "PORT");

        if let Some(domain) = env_value(prefix, "PROVIDER_DOMAIN") {
            self.provider.domain = domain;
        }
        override_from_env(&mut self.provider.timeout_ms, prefix, "PROVIDER_TIMEOUT_MS");
        override_from_env(
            &mut self.provider.allow_insecure_http,
            prefix,
            "PROVIDER_ALLOW_INSECURE_HTTP",
        );
        if let Some(ids) = list_from_env(prefix, "PROVIDER_ALLOWED_CLIENT_IDS") {
            self.provider.allowed_client_ids = ids;
        }

        override_from_env(&mut self.retry.max_attempts, prefix, "PROVIDER_MAX_ATTEMPTS");

        if let (Some(cert), Some(key)) = (
            env_value(prefix, "TLS_CERT_PATH"),
            env_value(prefix, "TLS_KEY_PATH"),
        ) {
            self.tls = Some(TlsConfig {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            });
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.provider.base_url()?;
        if self.provider.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "provider.timeout_ms must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid(
                "retry.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TokenVerifierConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.provider.timeout(), Duration::from_secs(5));
        assert_eq!(config.socket_addr().unwrap().port(), 8080);
    }

    #[test]
    fn bare_host_gets_https() {
        let provider = ProviderConfig {
            domain: "api.line.me/".to_string(),
            ..ProviderConfig::default()
        };
        assert_eq!(
            provider.endpoint("/oauth2/v2.1/verify").unwrap().as_str(),
            "https://api.line.me/oauth2/v2.1/verify"
        );
    }

    #[test]
    fn plain_http_requires_opt_in() {
        let mut provider = ProviderConfig {
            domain: "http://127.0.0.1:9000".to_string(),
            ..ProviderConfig::default()
        };
        assert!(matches!(provider.base_url(), Err(ConfigError::Invalid(_))));
        provider.allow_insecure_http = true;
        assert!(provider.base_url().is_ok());
    }

    #[test]
    fn placeholder_domain_is_rejected() {
        let provider = ProviderConfig {
            domain: "<your_line_token_verification_server>".to_string(),
            ..ProviderConfig::default()
        };
        assert!(provider.base_url().is_err());
    }

    #[test]
    fn rejects_zero_attempts_and_bad_jitter() {
        let mut config = TokenVerifierConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = TokenVerifierConfig::default();
        config.retry.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml_sections() {
        let config: TokenVerifierConfig = toml_from_str(
            r#"
            port = 9443

            [provider]
            domain = "api.line.me"
            allowed_client_ids = ["1440057261"]

            [tls]
            cert_path = "certs/server.pem"
            key_path = "certs/server.key"
            "#,
        );
        assert_eq!(config.port, 9443);
        assert_eq!(config.provider.allowed_client_ids, vec!["1440057261"]);
        assert_eq!(config.provider.verify_path, "/oauth2/v2.1/verify");
        assert!(config.tls.is_some());
    }

    #[test]
    fn environment_overrides_apply() {
        const PREFIX: &str = "TOKEN_VERIFIER_ENV_TEST_";
        let vars = [
            ("PORT", "9100"),
            ("PROVIDER_DOMAIN", "api.line.test"),
            ("PROVIDER_ALLOWED_CLIENT_IDS", " 1440057261, ,1653000000 "),
            ("PROVIDER_MAX_ATTEMPTS", "5"),
            ("PROVIDER_TIMEOUT_MS", "not-a-number"),
            ("TLS_CERT_PATH", "certs/server.pem"),
        ];
        for (key, value) in vars {
            std::env::set_var(format!("{PREFIX}{key}"), value);
        }

        let mut config = TokenVerifierConfig::default();
        config.apply_environment_overrides(PREFIX);

        assert_eq!(config.port, 9100);
        assert_eq!(config.provider.domain, "api.line.test");
        assert_eq!(
            config.provider.allowed_client_ids,
            vec!["1440057261".to_string(), "1653000000".to_string()]
        );
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.provider.timeout_ms, 5_000);
        // A certificate without a key does not enable TLS.
        assert!(config.tls.is_none());

        std::env::set_var(format!("{PREFIX}TLS_KEY_PATH"), "certs/server.key");
        config.apply_environment_overrides(PREFIX);
        let tls = config.tls.expect("tls enabled");
        assert_eq!(tls.cert_path, PathBuf::from("certs/server.pem"));
        assert_eq!(tls.key_path, PathBuf::from("certs/server.key"));

        for (key, _) in vars {
            std::env::remove_var(format!("{PREFIX}{key}"));
        }
        std::env::remove_var(format!("{PREFIX}TLS_KEY_PATH"));
    }

    fn toml_from_str(contents: &str) -> TokenVerifierConfig {
        let path = std::env::temp_dir().join(format!(
            "token-verifier-config-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, contents).expect("write config");
        let config = common_config::from_file(&path).expect("parse config");
        std::fs::remove_file(&path).ok();
        config
    }
}
