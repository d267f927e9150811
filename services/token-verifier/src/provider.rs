//! Identity provider capability and the LINE Login implementation of it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use common_config::ConfigError;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;

use crate::config::ProviderConfig;

/// What the provider said about a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderResponse {
    Confirmed(ConfirmedToken),
    Rejected { reason: String },
    Expired,
}

/// A token the provider recognised, with the identity it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmedToken {
    /// Channel the token was issued to.
    pub client_id: String,
    /// Seconds of validity left.
    pub expires_in: i64,
    pub subject: String,
    pub claims: BTreeMap<String, String>,
}

/// Failure to get an answer out of the provider at all.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider responded with status {0}")]
    Status(u16),
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::Transport(_) => true,
            ProviderError::Status(code) => *code == 429 || *code >= 500,
            ProviderError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ProviderError::Timeout
        } else if error.is_decode() {
            ProviderError::Decode(error.to_string())
        } else if let Some(status) = error.status() {
            ProviderError::Status(status.as_u16())
        } else {
            ProviderError::Transport(error.to_string())
        }
    }
}

/// The verification capability the service depends on.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify(&self, token: &str) -> Result<ProviderResponse, ProviderError>;
}

/// LINE Login v2.1: `GET /oauth2/v2.1/verify` followed by `GET /v2/profile`.
#[derive(Clone)]
pub struct LineProvider {
    client: reqwest::Client,
    verify_url: Url,
    profile_url: Url,
}

#[derive(Debug, Deserialize)]
struct VerifyBody {
    client_id: String,
    expires_in: i64,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileBody {
    user_id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    picture_url: Option<String>,
    #[serde(default)]
    status_message: Option<String>,
}

/// One provider round trip: either the decoded body or an early verdict.
type Step<T> = Result<Result<T, ProviderResponse>, ProviderError>;

impl LineProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .https_only(!config.allow_insecure_http)
            .build()
            .map_err(|err| ConfigError::Invalid(format!("http client: {err}")))?;
        Ok(Self {
            client,
            verify_url: config.endpoint(&config.verify_path)?,
            profile_url: config.endpoint(&config.profile_path)?,
        })
    }

    async fn check_token(&self, token: &str) -> Step<VerifyBody> {
        let response = self
            .client
            .get(self.verify_url.clone())
            .query(&[("access_token", token)])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(Ok(response.json::<VerifyBody>().await?)),
            StatusCode::BAD_REQUEST => {
                let body = response.json::<ErrorBody>().await.unwrap_or_default();
                Ok(Err(interpret_rejection(body)))
            }
            StatusCode::UNAUTHORIZED => Ok(Err(ProviderResponse::Rejected {
                reason: "token not accepted by provider".to_string(),
            })),
            status => Err(ProviderError::Status(status.as_u16())),
        }
    }

    async fn fetch_profile(&self, token: &str) -> Step<ProfileBody> {
        let response = self
            .client
            .get(self.profile_url.clone())
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(Ok(response.json::<ProfileBody>().await?)),
            StatusCode::UNAUTHORIZED => {
                let body = response.json::<ErrorBody>().await.unwrap_or_default();
                Ok(Err(interpret_rejection(body)))
            }
            status => Err(ProviderError::Status(status.as_u16())),
        }
    }
}

#[async_trait]
impl IdentityProvider for LineProvider {
    async fn verify(&self, token: &str) -> Result<ProviderResponse, ProviderError> {
        let verified = match self.check_token(token).await? {
            Ok(body) => body,
            Err(verdict) => return Ok(verdict),
        };
        if verified.expires_in <= 0 {
            return Ok(ProviderResponse::Expired);
        }

        let profile = match self.fetch_profile(token).await? {
            Ok(profile) => profile,
            Err(verdict) => return Ok(verdict),
        };

        let mut claims = BTreeMap::new();
        claims.insert("client_id".to_string(), verified.client_id.clone());
        let optional = [
            ("scope", verified.scope),
            ("display_name", profile.display_name),
            ("picture_url", profile.picture_url),
            ("status_message", profile.status_message),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                claims.insert(key.to_string(), value);
            }
        }

        Ok(ProviderResponse::Confirmed(ConfirmedToken {
            client_id: verified.client_id,
            expires_in: verified.expires_in,
            subject: profile.user_id,
            claims,
        }))
    }
}

fn interpret_rejection(body: ErrorBody) -> ProviderResponse {
    let reason = body
        .error_description
        .or(body.error)
        .unwrap_or_else(|| "token rejected by provider".to_string());
    if reason.to_ascii_lowercase().contains("expired") {
        ProviderResponse::Expired
    } else {
        ProviderResponse::Rejected { reason }
    }
}
