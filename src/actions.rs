/// # Gateway Pipeline
///
/// This file defines the request pipeline every inbound request flows through. The
/// pipeline is an ordered list of stages, each implementing the `RouteLogic` trait, built
/// once at startup with all of its dependencies passed in explicitly.
///
/// ## Stage Order
///
/// 1. `SessionIdentity`: loads or issues the session id, later hands out `Set-Cookie`.
/// 2. `LoginStatus`: looks up the identity stored for the session.
/// 3. `ExplicitRedirect`: records an explicit post-login target.
/// 4. `OidcRoute`: answers everything under `/oauth2` (start, callback, health, ready).
/// 5. `LoginGate`: answers unauthenticated requests with the login entry point.
/// 6. `HeaderInjection`: resolves claim headers, applies them upstream and downstream.
/// 7. `UpstreamRoute`: picks the upstream by prefix, rewrites paths and `Location`.
///
/// ## Terminal Responses
///
/// A stage that answers locally returns a `LocalResponse`, which stops the pipeline.
/// `response_filter` is not executed for local responses; stages that need to decorate
/// them (the session cookie) do so in `finalize_local_response`. A stage error becomes
/// the error's plain-text response.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Uri};
use log::{error, info, warn};
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::proxy::Session;

use crate::error::GatewayError;
use crate::GatewayCtx;

/// Read-only view of the downstream request used by the pipeline stages.
pub struct InboundRequest<'a> {
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
}

impl<'a> InboundRequest<'a> {
    pub fn from_header(header: &'a RequestHeader) -> Self {
        InboundRequest {
            uri: &header.uri,
            headers: &header.headers,
        }
    }

    #[cfg(test)]
    pub fn from_parts(parts: &'a http::request::Parts) -> Self {
        InboundRequest {
            uri: &parts.uri,
            headers: &parts.headers,
        }
    }

    pub fn path(&self) -> &'a str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&'a str> {
        self.uri.query()
    }

    pub fn header_str(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn header_values(&self, name: &str) -> impl Iterator<Item = &'a str> {
        self.headers
            .get_all(name)
            .into_iter()
            .filter_map(|v| v.to_str().ok())
    }
}

/// A response produced by the gateway itself instead of an upstream.
#[derive(Debug, Clone)]
pub struct LocalResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Bytes,
}

impl LocalResponse {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        LocalResponse {
            status,
            headers: vec![("Content-Type", "text/plain; charset=utf-8".to_string())],
            body: Bytes::from(body.into()),
        }
    }

    pub fn html(body: String) -> Self {
        LocalResponse {
            status: 200,
            headers: vec![("Content-Type", "text/html; charset=utf-8".to_string())],
            body: Bytes::from(body),
        }
    }

    /// 302 Found with a minimal body for clients that don't follow redirects.
    pub fn redirect(location: impl Into<String>) -> Self {
        LocalResponse {
            status: 302,
            headers: vec![
                ("Location", location.into()),
                ("Content-Type", "text/plain; charset=utf-8".to_string()),
            ],
            body: Bytes::from_static(b"Redirecting..."),
        }
    }

    pub fn push_header(&mut self, name: &'static str, value: impl Into<String>) {
        self.headers.push((name, value.into()));
    }

    /// Keeps browsers and intermediaries from caching the response.
    pub fn no_cache(mut self) -> Self {
        self.push_header("Expires", "Thu, 01 Jan 1970 00:00:00 UTC");
        self.push_header(
            "Cache-Control",
            "no-cache, no-store, no-transform, must-revalidate, private, max-age=0",
        );
        self.push_header("Pragma", "no-cache");
        self.push_header("X-Accel-Expires", "0");
        self
    }

    /// First value of `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub async fn write_to(self, session: &mut Session) -> pingora::Result<()> {
        let mut resp = ResponseHeader::build(self.status, Some(self.headers.len() + 1))?;
        for (name, value) in self.headers {
            resp.append_header(name, value)?;
        }
        resp.insert_header("Content-Length", self.body.len().to_string())?;
        session.write_response_header(Box::new(resp), false).await?;
        session.write_response_body(Some(self.body), true).await?;
        Ok(())
    }
}

/// One step of the request pipeline. Every hook defaults to a no-op.
#[async_trait]
pub trait RouteLogic: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `Some` to answer the request locally and stop the pipeline.
    async fn request_filter(
        &self,
        _request: &InboundRequest<'_>,
        _ctx: &mut GatewayCtx,
    ) -> Result<Option<LocalResponse>, GatewayError> {
        Ok(None)
    }

    fn upstream_request_filter(
        &self,
        _upstream_request: &mut RequestHeader,
        _ctx: &GatewayCtx,
    ) -> pingora::Result<()> {
        Ok(())
    }

    fn response_filter(
        &self,
        _response: &mut ResponseHeader,
        _ctx: &GatewayCtx,
    ) -> pingora::Result<()> {
        Ok(())
    }

    fn finalize_local_response(&self, _response: &mut LocalResponse, _ctx: &GatewayCtx) {}
}

pub struct Pipeline {
    stages: Vec<Arc<dyn RouteLogic>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn RouteLogic>>) -> Self {
        Pipeline { stages }
    }

    /// Runs the request stages in order. `Some` means the request was answered locally.
    pub async fn run_request_filters(
        &self,
        request: &InboundRequest<'_>,
        ctx: &mut GatewayCtx,
    ) -> Option<LocalResponse> {
        for stage in &self.stages {
            let response = match stage.request_filter(request, ctx).await {
                Ok(None) => continue,
                Ok(Some(response)) => {
                    info!(
                        "[{}] [{}] Answered locally with status {}",
                        ctx.request_id,
                        stage.name(),
                        response.status
                    );
                    response
                }
                Err(e) => {
                    if e.status() < 500 {
                        warn!("[{}] [{}] Rejected request: {}", ctx.request_id, stage.name(), e);
                    } else {
                        error!("[{}] [{}] Request failed: {}", ctx.request_id, stage.name(), e);
                    }
                    e.to_response()
                }
            };
            return Some(self.finalize(response, ctx));
        }
        None
    }

    fn finalize(&self, mut response: LocalResponse, ctx: &GatewayCtx) -> LocalResponse {
        for stage in &self.stages {
            stage.finalize_local_response(&mut response, ctx);
        }
        response
    }

    pub fn upstream_request_filters(
        &self,
        upstream_request: &mut RequestHeader,
        ctx: &GatewayCtx,
    ) -> pingora::Result<()> {
        for stage in &self.stages {
            stage.upstream_request_filter(upstream_request, ctx)?;
        }
        Ok(())
    }

    pub fn response_filters(
        &self,
        response: &mut ResponseHeader,
        ctx: &GatewayCtx,
    ) -> pingora::Result<()> {
        for stage in &self.stages {
            stage.response_filter(response, ctx)?;
        }
        Ok(())
    }
}
