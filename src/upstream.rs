/// # Upstream Routing
///
/// Maps request paths onto upstream servers and rewrites paths in both directions.
///
/// A server is selected by its match prefix, compared on path-segment boundaries, and
/// the longest matching prefix wins. The prefix is replaced by the server's base path on
/// the way in; on the way out, redirect `Location` headers that point back into the
/// server are mapped onto the proxy's external URL.
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::upstreams::peer::HttpPeer;
use pingora::{Error, ErrorType};
use url::Url;

use crate::actions::{InboundRequest, LocalResponse, RouteLogic};
use crate::error::GatewayError;
use crate::proxy_url::ProxyUrl;
use crate::GatewayCtx;

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// `/` matches everything and is kept as the empty prefix.
fn trim_path(path: &str) -> String {
    path.trim_end_matches('/').to_string()
}

fn strip_segment_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

fn or_root(path: String) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path
    }
}

pub fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Appends `client` to an existing `X-Forwarded-For` chain.
pub fn forwarded_for(prior: Option<&str>, client: &str) -> String {
    match prior.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prior) => format!("{}, {}", prior, client),
        None => client.to_string(),
    }
}

pub struct UpstreamServer {
    pub id: String,
    pub url: Url,
    pub timeout: Duration,
    match_prefix: String,
    base_path: String,
    peer: HttpPeer,
}

impl UpstreamServer {
    pub fn new(id: &str, url: Url, match_path: &str, timeout: Duration) -> Result<Self, String> {
        if url.scheme() != "http" {
            return Err(format!("upstream '{}' must use an http:// url", id));
        }
        let host = url
            .host_str()
            .ok_or_else(|| format!("upstream '{}' url has no host", id))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let addr: SocketAddr = (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                format!(
                    "upstream '{}' address {}:{} cannot be resolved: {}",
                    id, host, port, e
                )
            })?
            .next()
            .ok_or_else(|| {
                format!("upstream '{}' address {}:{} has no addresses", id, host, port)
            })?;

        let mut peer = HttpPeer::new(addr, false, String::new());
        // Pingora has no response-header timeout. The read timeout covers the wait for the
        // headers, but it is also applied to every body read, so a body that stalls longer
        // than `timeout` between chunks is cut off as well.
        peer.options.read_timeout = Some(timeout);

        Ok(UpstreamServer {
            id: id.to_string(),
            match_prefix: trim_path(match_path),
            base_path: trim_path(url.path()),
            url,
            timeout,
            peer,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        strip_segment_prefix(path, &self.match_prefix).is_some()
    }

    /// Path to request from this server for `request_path`.
    pub fn upstream_path(&self, request_path: &str) -> String {
        let rest = strip_segment_prefix(request_path, &self.match_prefix).unwrap_or(request_path);
        or_root(format!("{}{}", self.base_path, rest))
    }

    /// External form of a `Location` this server sent. `None` leaves the header alone:
    /// foreign origins and paths outside the base path are not rewritten.
    pub fn rewrite_location(&self, location: &str, proxy_url: &ProxyUrl) -> Option<String> {
        let target = match Url::parse(location) {
            Ok(absolute) if absolute.origin() == self.url.origin() => absolute,
            Ok(_) => return None,
            Err(url::ParseError::RelativeUrlWithoutBase) => self.url.join(location).ok()?,
            Err(_) => return None,
        };
        let rest = strip_segment_prefix(target.path(), &self.base_path)?;
        let external_path = or_root(format!("{}{}", self.match_prefix, rest));
        let mut external = proxy_url.url_for_path(&external_path);
        external.set_query(target.query());
        external.set_fragment(target.fragment());
        Some(external.to_string())
    }

    pub fn peer(&self) -> Box<HttpPeer> {
        Box::new(self.peer.clone())
    }
}

pub struct UpstreamRouter {
    servers: Vec<Arc<UpstreamServer>>,
}

impl UpstreamRouter {
    pub fn new(servers: Vec<UpstreamServer>) -> Self {
        UpstreamRouter {
            servers: servers.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn route(&self, path: &str) -> Option<&Arc<UpstreamServer>> {
        self.servers
            .iter()
            .filter(|server| server.matches(path))
            .max_by_key(|server| server.match_prefix.len())
    }
}

pub struct UpstreamRoute {
    router: UpstreamRouter,
    proxy_url: ProxyUrl,
}

impl UpstreamRoute {
    pub fn new(router: UpstreamRouter, proxy_url: ProxyUrl) -> Self {
        UpstreamRoute { router, proxy_url }
    }
}

#[async_trait]
impl RouteLogic for UpstreamRoute {
    fn name(&self) -> &'static str {
        "UpstreamRoute"
    }

    async fn request_filter(
        &self,
        request: &InboundRequest<'_>,
        ctx: &mut GatewayCtx,
    ) -> Result<Option<LocalResponse>, GatewayError> {
        match self.router.route(request.path()) {
            Some(server) => {
                info!(
                    "[{}] [{}] Routing {} to upstream '{}'",
                    ctx.request_id,
                    self.name(),
                    request.path(),
                    server.id
                );
                ctx.upstream = Some(server.clone());
                Ok(None)
            }
            None => {
                warn!(
                    "[{}] [{}] No upstream matches {}",
                    ctx.request_id,
                    self.name(),
                    request.path()
                );
                Ok(Some(LocalResponse::text(404, "Not Found")))
            }
        }
    }

    fn upstream_request_filter(
        &self,
        upstream_request: &mut RequestHeader,
        ctx: &GatewayCtx,
    ) -> pingora::Result<()> {
        let Some(server) = &ctx.upstream else {
            return Ok(());
        };
        let path = server.upstream_path(upstream_request.uri.path());
        let path_and_query = match upstream_request.uri.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        debug!(
            "[{}] [{}] Upstream path: {}",
            ctx.request_id,
            self.name(),
            path_and_query
        );
        let uri = path_and_query.parse::<http::Uri>().map_err(|e| {
            Error::because(ErrorType::InternalError, "invalid upstream request path", e)
        })?;
        upstream_request.set_uri(uri);
        Ok(())
    }

    fn response_filter(
        &self,
        response: &mut ResponseHeader,
        ctx: &GatewayCtx,
    ) -> pingora::Result<()> {
        let Some(server) = &ctx.upstream else {
            return Ok(());
        };
        if !is_redirect(response.status.as_u16()) {
            return Ok(());
        }
        let rewritten = response
            .headers
            .get("Location")
            .and_then(|value| value.to_str().ok())
            .and_then(|location| server.rewrite_location(location, &self.proxy_url));
        if let Some(location) = rewritten {
            debug!(
                "[{}] [{}] Rewrote Location to {}",
                ctx.request_id,
                self.name(),
                location
            );
            response.insert_header("Location", location)?;
        }
        Ok(())
    }
}
