/// # Header Injection
///
/// Turns the identity of a logged-in session into headers. Each configured rule names a
/// header, a claim source and an ordered list of candidate claims; the first candidate
/// present in the source becomes the header value.
///
/// ## Key Components:
///
/// - **`HeaderInjector`**: one rule, either over the ID token claims or the user-info
///   claims.
///
/// - **`HeaderInjection`**: the request-side and response-side rule sets. `resolve`
///   evaluates all of them at once, so a missing claim fails the request before anything
///   is sent upstream.
///
/// - **`HeaderInjectionRoute`**: the pipeline stage that resolves the values and applies
///   them to the upstream request and the downstream response, replacing any header of
///   the same name.
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderValue;
use log::debug;
use pingora::http::{RequestHeader, ResponseHeader};
use thiserror::Error;

use crate::actions::{InboundRequest, LocalResponse, RouteLogic};
use crate::claims::{ClaimKind, Claims};
use crate::error::GatewayError;
use crate::login::Identity;
use crate::GatewayCtx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimSource {
    IdToken,
    UserInfo,
}

impl fmt::Display for ClaimSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimSource::IdToken => write!(f, "ID token"),
            ClaimSource::UserInfo => write!(f, "user info"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSide {
    Request,
    Response,
}

impl fmt::Display for HeaderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderSide::Request => write!(f, "request"),
            HeaderSide::Response => write!(f, "response"),
        }
    }
}

#[derive(Debug, Error)]
#[error("no valid claim found among {candidates:?} in {origin}")]
pub struct ClaimMissing {
    pub origin: ClaimSource,
    pub candidates: Vec<&'static str>,
}

#[derive(Debug, Error)]
#[error("Error setting {side} header '{header}': {reason}")]
pub struct InjectionError {
    pub side: HeaderSide,
    pub header: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum HeaderInjector {
    IdTokenClaim { header: String, claims: Vec<ClaimKind> },
    UserInfo { header: String, claims: Vec<ClaimKind> },
}

impl HeaderInjector {
    pub fn key(&self) -> &str {
        match self {
            HeaderInjector::IdTokenClaim { header, .. }
            | HeaderInjector::UserInfo { header, .. } => header,
        }
    }

    pub fn source(&self) -> ClaimSource {
        match self {
            HeaderInjector::IdTokenClaim { .. } => ClaimSource::IdToken,
            HeaderInjector::UserInfo { .. } => ClaimSource::UserInfo,
        }
    }

    fn candidates(&self) -> &[ClaimKind] {
        match self {
            HeaderInjector::IdTokenClaim { claims, .. }
            | HeaderInjector::UserInfo { claims, .. } => claims,
        }
    }

    fn claims<'a>(&self, identity: &'a Identity) -> Option<&'a Claims> {
        match self {
            HeaderInjector::IdTokenClaim { .. } => Some(&identity.id_token.claims),
            HeaderInjector::UserInfo { .. } => identity.user_info.as_deref(),
        }
    }

    pub fn value(&self, identity: &Identity) -> Result<String, ClaimMissing> {
        self.claims(identity)
            .and_then(|claims| {
                self.candidates()
                    .iter()
                    .find_map(|kind| kind.value_in(claims))
            })
            .ok_or_else(|| ClaimMissing {
                origin: self.source(),
                candidates: self.candidates().iter().map(|kind| kind.name()).collect(),
            })
    }
}

/// Header values resolved for one request.
#[derive(Debug, Clone, Default)]
pub struct InjectedHeaders {
    pub request: Vec<(String, HeaderValue)>,
    pub response: Vec<(String, HeaderValue)>,
}

#[derive(Debug, Clone, Default)]
pub struct HeaderInjection {
    pub request: Vec<HeaderInjector>,
    pub response: Vec<HeaderInjector>,
}

impl HeaderInjection {
    pub fn is_empty(&self) -> bool {
        self.request.is_empty() && self.response.is_empty()
    }

    pub fn resolve(&self, identity: &Identity) -> Result<InjectedHeaders, InjectionError> {
        Ok(InjectedHeaders {
            request: resolve_side(&self.request, HeaderSide::Request, identity)?,
            response: resolve_side(&self.response, HeaderSide::Response, identity)?,
        })
    }
}

fn resolve_side(
    injectors: &[HeaderInjector],
    side: HeaderSide,
    identity: &Identity,
) -> Result<Vec<(String, HeaderValue)>, InjectionError> {
    injectors
        .iter()
        .map(|injector| {
            let failed = |reason: String| InjectionError {
                side,
                header: injector.key().to_string(),
                reason,
            };
            let value = injector.value(identity).map_err(|e| failed(e.to_string()))?;
            let value = HeaderValue::from_bytes(value.as_bytes())
                .map_err(|_| failed("claim value is not a valid header value".to_string()))?;
            Ok((injector.key().to_string(), value))
        })
        .collect()
}

pub struct HeaderInjectionRoute {
    injection: Arc<HeaderInjection>,
}

impl HeaderInjectionRoute {
    pub fn new(injection: Arc<HeaderInjection>) -> Self {
        HeaderInjectionRoute { injection }
    }
}

#[async_trait]
impl RouteLogic for HeaderInjectionRoute {
    fn name(&self) -> &'static str {
        "HeaderInjection"
    }

    async fn request_filter(
        &self,
        _request: &InboundRequest<'_>,
        ctx: &mut GatewayCtx,
    ) -> Result<Option<LocalResponse>, GatewayError> {
        if self.injection.is_empty() {
            return Ok(None);
        }
        if let Some(identity) = &ctx.identity {
            let headers = self.injection.resolve(identity)?;
            debug!(
                "[{}] [{}] Resolved {} request and {} response headers",
                ctx.request_id,
                self.name(),
                headers.request.len(),
                headers.response.len()
            );
            ctx.injected_headers = Some(headers);
        }
        Ok(None)
    }

    fn upstream_request_filter(
        &self,
        upstream_request: &mut RequestHeader,
        ctx: &GatewayCtx,
    ) -> pingora::Result<()> {
        if let Some(headers) = &ctx.injected_headers {
            for (name, value) in &headers.request {
                upstream_request.insert_header(name.clone(), value.clone())?;
            }
        }
        Ok(())
    }

    fn response_filter(
        &self,
        response: &mut ResponseHeader,
        ctx: &GatewayCtx,
    ) -> pingora::Result<()> {
        if let Some(headers) = &ctx.injected_headers {
            for (name, value) in &headers.response {
                response.insert_header(name.clone(), value.clone())?;
            }
        }
        Ok(())
    }
}
