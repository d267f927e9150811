//! Common authentication primitives shared by services that accept login tokens.
//!
//! Nothing here talks to an identity provider. These checks only decide whether
//! a value is shaped like something worth sending to one.

use thiserror::Error;

/// Upper bound on the size of an opaque login token.
pub const MAX_TOKEN_LEN: usize = 2048;

/// Upper bound on the size of a client (channel) identifier.
pub const MAX_CLIENT_ID_LEN: usize = 64;

/// Represents a validation error for an authentication token or client identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No token was supplied.
    #[error("token must not be empty")]
    EmptyToken,
    /// The token exceeds [`MAX_TOKEN_LEN`].
    #[error("token exceeds {} bytes", MAX_TOKEN_LEN)]
    TokenTooLong,
    /// The token contains whitespace, control or non-ASCII characters.
    #[error("token contains a character outside visible ASCII at byte {0}")]
    TokenCharset(usize),
    /// The client identifier failed basic validation rules.
    #[error("client identifier is invalid: {0}")]
    ClientId(String),
}

/// Checks that a raw token is plausibly a provider-issued credential.
///
/// Tokens are opaque. Only emptiness, length and the visible ASCII range are checked.
pub fn validate_token(token: &str) -> Result<(), AuthError> {
    if token.is_empty() {
        return Err(AuthError::EmptyToken);
    }
    if token.len() > MAX_TOKEN_LEN {
        return Err(AuthError::TokenTooLong);
    }
    if let Some(position) = token.bytes().position(|b| !b.is_ascii_graphic()) {
        return Err(AuthError::TokenCharset(position));
    }
    Ok(())
}

/// Checks a client identifier. An empty identifier means "not supplied" and is accepted.
pub fn validate_client_id(client_id: &str) -> Result<(), AuthError> {
    if client_id.is_empty() {
        return Ok(());
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(AuthError::ClientId(format!(
            "must be at most {MAX_CLIENT_ID_LEN} characters"
        )));
    }
    if !client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(AuthError::ClientId(
            "must be alphanumeric and may include '-', '_' or '.'".to_string(),
        ));
    }
    Ok(())
}
