#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use token_verifier::provider::{
    ConfirmedToken, IdentityProvider, ProviderError, ProviderResponse,
};
use token_verifier::verifier::{RetryPolicy, TokenVerifier};

pub const CHANNEL_ID: &str = "1440057261";

/// Identity provider double whose answer is chosen by the token prefix:
///
/// * `valid-<name>` confirms subject `U-<name>`
/// * `expired-*`, `rejected-*` give the matching verdicts
/// * `down-*` fails with a 503, `notfound-*` with a 404
/// * `hang-*` never answers within any sane timeout
/// * `flaky-*` fails once with a transport error, then confirms
/// * `nosubject-*` confirms without a subject, `foreign-*` confirms for another channel
#[derive(Default)]
pub struct ScriptedProvider {
    calls: Mutex<Vec<String>>,
    latency: Duration,
}

impl ScriptedProvider {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, token: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|seen| seen.as_str() == token)
            .count()
    }

    fn record(&self, token: &str) -> usize {
        let mut calls = self.calls.lock().unwrap();
        calls.push(token.to_string());
        calls.iter().filter(|seen| seen.as_str() == token).count()
    }
}

pub fn confirmed(name: &str, client_id: &str) -> ProviderResponse {
    ProviderResponse::Confirmed(ConfirmedToken {
        client_id: client_id.to_string(),
        expires_in: 3600,
        subject: if name.is_empty() {
            String::new()
        } else {
            format!("U-{name}")
        },
        claims: BTreeMap::from([
            ("display_name".to_string(), name.to_string()),
            ("scope".to_string(), "profile".to_string()),
        ]),
    })
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    async fn verify(&self, token: &str) -> Result<ProviderResponse, ProviderError> {
        let seen = self.record(token);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let (kind, name) = token.split_once('-').unwrap_or((token, ""));
        match kind {
            "valid" => Ok(confirmed(name, CHANNEL_ID)),
            "foreign" => Ok(confirmed(name, "999")),
            "nosubject" => Ok(confirmed("", CHANNEL_ID)),
            "expired" => Ok(ProviderResponse::Expired),
            "rejected" => Ok(ProviderResponse::Rejected {
                reason: "invalid access token".to_string(),
            }),
            "down" => Err(ProviderError::Status(503)),
            "notfound" => Err(ProviderError::Status(404)),
            "hang" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(confirmed(name, CHANNEL_ID))
            }
            "flaky" if seen == 1 => Err(ProviderError::Transport("connection reset".into())),
            "flaky" => Ok(confirmed(name, CHANNEL_ID)),
            other => panic!("unscripted token kind {other}"),
        }
    }
}

pub fn retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        jitter: 0.0,
    }
}

pub fn verifier(provider: Arc<ScriptedProvider>) -> TokenVerifier {
    TokenVerifier::new(provider, retry_policy(), Duration::from_secs(5))
}
