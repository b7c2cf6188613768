use thiserror::Error;

/// Failures talking to, or trusting, an identity provider.
#[derive(Debug, Error)]
pub enum OidcError {
    #[error("HTTP request to identity provider failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("token endpoint returned status {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("invalid ID token: {0}")]
    InvalidToken(String),

    #[error("provider does not publish a userinfo endpoint")]
    MissingUserInfoEndpoint,

    #[error("user info subject {found:?} does not match ID token subject {expected:?}")]
    SubjectMismatch { expected: String, found: String },
}
