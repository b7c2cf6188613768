//! Where to send the browser once login succeeds.
//!
//! An explicit target comes from the `redirect` query parameter or, failing that, the
//! `X-Auth-Request-Redirect` header. Only absolute URLs with a host are accepted. Without
//! one, the target is the external form of the requested path. OIDC endpoints only ever
//! use the explicit form.

use async_trait::async_trait;
use log::debug;
use url::Url;

use crate::actions::{InboundRequest, LocalResponse, RouteLogic};
use crate::error::GatewayError;
use crate::proxy_url::ProxyUrl;
use crate::GatewayCtx;

pub const REDIRECT_QUERY_PARAM: &str = "redirect";
pub const REDIRECT_HEADER: &str = "X-Auth-Request-Redirect";

fn is_acceptable_target(candidate: &str) -> bool {
    Url::parse(candidate)
        .map(|url| !url.scheme().is_empty() && url.host_str().is_some_and(|h| !h.is_empty()))
        .unwrap_or(false)
}

fn query_target(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == REDIRECT_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| is_acceptable_target(value))
}

pub fn explicit_target(request: &InboundRequest<'_>) -> Option<String> {
    query_target(request.query()).or_else(|| {
        request
            .header_str(REDIRECT_HEADER)
            .filter(|value| is_acceptable_target(value))
            .map(str::to_string)
    })
}

pub fn implicit_target(proxy_url: &ProxyUrl, path: &str) -> String {
    proxy_url.url_for_path(path).to_string()
}

pub fn resolve(explicit: Option<String>, proxy_url: &ProxyUrl, path: &str) -> String {
    explicit.unwrap_or_else(|| implicit_target(proxy_url, path))
}

/// Records the explicit redirect target, if any, in the request context.
pub struct ExplicitRedirectRoute;

#[async_trait]
impl RouteLogic for ExplicitRedirectRoute {
    fn name(&self) -> &'static str {
        "ExplicitRedirect"
    }

    async fn request_filter(
        &self,
        request: &InboundRequest<'_>,
        ctx: &mut GatewayCtx,
    ) -> Result<Option<LocalResponse>, GatewayError> {
        ctx.redirect_target = explicit_target(request);
        if let Some(target) = &ctx.redirect_target {
            debug!(
                "[{}] [{}] Explicit redirect target: {}",
                ctx.request_id,
                self.name(),
                target
            );
        }
        Ok(None)
    }
}
