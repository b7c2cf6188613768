//! Errors raised while a request travels through the gateway pipeline.
//!
//! Every stage returns a [`GatewayError`] when it cannot continue. The pipeline turns the
//! error into a plain-text local response whose status follows [`GatewayError::status`].

use thiserror::Error;

use crate::actions::LocalResponse;
use crate::header_injection::InjectionError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The client sent a request this gateway refuses to act on (missing or mismatched
    /// state/nonce, missing redirect context, a competing login).
    #[error("{0}")]
    ClientProtocol(String),

    /// The identity provider could not complete the login.
    #[error("{0}")]
    UpstreamAuth(String),

    #[error(transparent)]
    Injection(#[from] InjectionError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn client(message: impl Into<String>) -> Self {
        GatewayError::ClientProtocol(message.into())
    }

    pub fn upstream_auth(message: impl Into<String>) -> Self {
        GatewayError::UpstreamAuth(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        GatewayError::Internal(message.into())
    }

    pub fn status(&self) -> u16 {
        match self {
            GatewayError::ClientProtocol(_) => 400,
            GatewayError::UpstreamAuth(_)
            | GatewayError::Injection(_)
            | GatewayError::Internal(_) => 500,
        }
    }

    /// Internal failures keep their cause in the log only.
    pub fn to_response(&self) -> LocalResponse {
        let body = match self {
            GatewayError::Internal(_) => "Internal Server Error".to_string(),
            other => other.to_string(),
        };
        LocalResponse::text(self.status(), body)
    }
}
