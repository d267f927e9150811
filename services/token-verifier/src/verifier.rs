use std::sync::Arc;
use std::time::{Duration, Instant};

use common_auth::{validate_client_id, validate_token};
use common_config::ConfigError;
use common_obs::{
    default_buckets, register_counter, register_histogram, CounterVec, HistogramVec,
};
use once_cell::sync::Lazy;
use rand::Rng;
use tokio::time::{sleep, timeout};

use crate::config::{RetrySettings, TokenVerifierConfig};
use crate::error::VerifyError;
use crate::model::{VerificationRequest, VerificationStatus, VerifiedIdentity};
use crate::provider::{
    ConfirmedToken, IdentityProvider, LineProvider, ProviderError, ProviderResponse,
};
use crate::SERVICE_NAME;

static TOKEN_VERIFICATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter(
        "token_verifications_total",
        "Token verification verdicts by status",
        &["service", "status"],
    )
});

static PROVIDER_ATTEMPTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter(
        "provider_attempts_total",
        "Identity provider calls by outcome",
        &["service", "outcome"],
    )
});

static PROVIDER_CALL_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram(
        "provider_call_seconds",
        "Latency of individual identity provider calls",
        &["service"],
        default_buckets(),
    )
});

/// Bounded exponential backoff for transient provider failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            jitter: settings.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        base.mul_f64(1.0 + extra)
    }
}

/// Turns tokens into verdicts. Holds no per-request state, so one instance
/// serves all requests concurrently.
pub struct TokenVerifier {
    provider: Arc<dyn IdentityProvider>,
    retry: RetryPolicy,
    call_timeout: Duration,
    allowed_client_ids: Vec<String>,
}

impl TokenVerifier {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            retry,
            call_timeout,
            allowed_client_ids: Vec::new(),
        }
    }

    pub fn with_allowed_client_ids(mut self, ids: Vec<String>) -> Self {
        self.allowed_client_ids = ids;
        self
    }

    /// Build a verifier backed by the LINE provider described in `config`.
    pub fn from_config(config: &TokenVerifierConfig) -> Result<Self, ConfigError> {
        let provider = LineProvider::new(&config.provider)?;
        let verifier = Self::new(
            Arc::new(provider),
            RetryPolicy::from(&config.retry),
            config.provider.timeout(),
        )
        .with_allowed_client_ids(config.provider.allowed_client_ids.clone());

        if verifier.accepts_any_client() {
            tracing::warn!(
                event = "client_allow_list_empty",
                "provider.allowed_client_ids is empty; tokens issued to any channel are accepted \
                 unless the caller sends a clientId"
            );
        }
        Ok(verifier)
    }

    /// True when no channel allow-list is configured.
    pub fn accepts_any_client(&self) -> bool {
        self.allowed_client_ids.is_empty()
    }

    pub async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerifiedIdentity, VerifyError> {
        let outcome = self.evaluate(request).await;

        let status = match &outcome {
            Ok(_) => VerificationStatus::Valid,
            Err(error) => error.status(),
        };
        TOKEN_VERIFICATIONS_TOTAL.inc(&[SERVICE_NAME, status.as_str()], 1);

        match &outcome {
            Ok(identity) => tracing::info!(
                event = "token_verified",
                subject = %identity.subject,
                client_id = %request.client_id
            ),
            Err(error) => tracing::warn!(
                event = "token_rejected",
                status = status.as_str(),
                client_id = %request.client_id,
                %error
            ),
        }

        outcome
    }

    async fn evaluate(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerifiedIdentity, VerifyError> {
        validate_token(&request.token)?;
        validate_client_id(&request.client_id)?;

        match self.call_provider(&request.token).await? {
            ProviderResponse::Confirmed(confirmed) => self.accept(request, confirmed),
            ProviderResponse::Rejected { reason } => Err(VerifyError::Rejected(reason)),
            ProviderResponse::Expired => Err(VerifyError::Expired),
        }
    }

    async fn call_provider(&self, token: &str) -> Result<ProviderResponse, VerifyError> {
        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let result = match timeout(self.call_timeout, self.provider.verify(token)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            };
            PROVIDER_CALL_SECONDS.observe(&[SERVICE_NAME], started.elapsed().as_secs_f64());

            let error = match result {
                Ok(response) => {
                    let outcome = match &response {
                        ProviderResponse::Confirmed(_) => "confirmed",
                        ProviderResponse::Rejected { .. } => "rejected",
                        ProviderResponse::Expired => "expired",
                    };
                    PROVIDER_ATTEMPTS_TOTAL.inc(&[SERVICE_NAME, outcome], 1);
                    return Ok(response);
                }
                Err(error) => error,
            };
            PROVIDER_ATTEMPTS_TOTAL.inc(&[SERVICE_NAME, "error"], 1);

            if !error.is_retryable() || attempt >= self.retry.max_attempts {
                return Err(VerifyError::Unreachable(format!(
                    "{error} (after {attempt} attempt(s))"
                )));
            }

            let delay = self.retry.delay(attempt);
            tracing::debug!(
                event = "provider_retry",
                attempt,
                delay_ms = delay.as_millis() as u64,
                %error
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    fn accept(
        &self,
        request: &VerificationRequest,
        confirmed: ConfirmedToken,
    ) -> Result<VerifiedIdentity, VerifyError> {
        if !self.accepts_any_client()
            && !self.allowed_client_ids.contains(&confirmed.client_id)
        {
            return Err(VerifyError::Rejected(format!(
                "token was issued to unrecognized client {}",
                confirmed.client_id
            )));
        }
        if !request.client_id.is_empty() && request.client_id != confirmed.client_id {
            return Err(VerifyError::Rejected(
                "token was issued to a different client".to_string(),
            ));
        }
        if confirmed.expires_in <= 0 {
            return Err(VerifyError::Expired);
        }
        if confirmed.subject.is_empty() {
            return Err(VerifyError::Rejected(
                "provider returned no subject".to_string(),
            ));
        }

        Ok(VerifiedIdentity {
            subject: confirmed.subject,
            claims: confirmed.claims,
        })
    }
}
