use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::VerifyError;

/// Body of an inbound verification call.
///
/// Missing fields deserialize as empty strings so that an absent token is
/// reported as an invalid verdict rather than a decoding failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationRequest {
    pub token: String,
    pub client_id: String,
}

impl VerificationRequest {
    pub fn new(token: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client_id: client_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Valid,
    Invalid,
    Expired,
    #[serde(rename = "unreachable")]
    ProviderUnreachable,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Valid => "valid",
            VerificationStatus::Invalid => "invalid",
            VerificationStatus::Expired => "expired",
            VerificationStatus::ProviderUnreachable => "unreachable",
        }
    }
}

/// Identity confirmed by the provider for an accepted token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub subject: String,
    pub claims: BTreeMap<String, String>,
}

/// Verdict returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl VerificationResult {
    pub fn valid(identity: VerifiedIdentity) -> Self {
        Self {
            status: VerificationStatus::Valid,
            subject: Some(identity.subject),
            claims: Some(identity.claims),
            reason: None,
        }
    }

    pub fn failed(error: &VerifyError) -> Self {
        Self {
            status: error.status(),
            subject: None,
            claims: None,
            reason: Some(error.to_string()),
        }
    }
}

impl From<Result<VerifiedIdentity, VerifyError>> for VerificationResult {
    fn from(outcome: Result<VerifiedIdentity, VerifyError>) -> Self {
        match outcome {
            Ok(identity) => Self::valid(identity),
            Err(error) => Self::failed(&error),
        }
    }
}
