// oidcgw is an authenticating reverse-proxy gateway. It sits behind a TLS-terminating
// front end, sends unauthenticated browsers through an OpenID Connect authorization-code
// login and forwards authenticated requests to upstream HTTP services, injecting identity
// claims as headers.
//
// USAGE:
//   It requires a configuration file, `conf/config.yaml` by default (see OIDCGW_CONFIG).
//   To run the gw with debug-level logging:
//   OIDCGW_LOG_LEVEL=debug cargo run

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{error, info, warn};
use pingora::http::ResponseHeader;
use pingora::prelude::*;

mod actions;
use actions::{InboundRequest, Pipeline, RouteLogic};

mod claims;
mod config;
use crate::config::{ConfigError, GatewayConfig};

mod error;
mod header_injection;
mod login;
mod oidc;
mod proxy_url;
mod random;
mod redirect;
mod session_id;
mod session_store;
mod upstream;

use crate::header_injection::{HeaderInjection, HeaderInjectionRoute, InjectedHeaders};
use crate::login::{Identity, LoginEntry, LoginGateRoute, LoginLink, LoginStatusRoute};
use crate::oidc::error::OidcError;
use crate::oidc::provider::{Provider, ProviderSettings};
use crate::oidc::{OidcFlow, OidcRoute};
use crate::proxy_url::ProxyUrl;
use crate::redirect::ExplicitRedirectRoute;
use crate::session_id::{SessionHandle, SessionIdentityManager, SessionIdentityRoute};
use crate::session_store::{SessionStore, SessionSweeper, SWEEP_INTERVAL};
use crate::upstream::{forwarded_for, UpstreamRoute, UpstreamRouter, UpstreamServer};

/// Core logic and shared state for the proxy service
///
/// This struct implements the `ProxyHttp` trait and owns the request pipeline. A single
/// instance is created at startup and shared immutably across all worker threads for the
/// lifetime of the application.
struct GatewayRouter {
    pipeline: Pipeline,
}

/// Context that holds state for each HTTP request
///
/// An instance of this struct is created for each request via `ProxyHttp::new_ctx()`
/// and is passed through every pipeline stage. Its lifetime is tied to a single
/// request-response cycle.
pub struct GatewayCtx {
    pub request_id: String,
    pub request_start_time: Instant,
    // Set by SessionIdentity, replaced on rotation after a login.
    pub session: Option<SessionHandle>,
    // Set by LoginStatus when the session holds an unexpired ID token.
    pub identity: Option<Identity>,
    // Explicit target from ExplicitRedirect; LoginGate fills in the implicit one.
    pub redirect_target: Option<String>,
    pub upstream: Option<Arc<UpstreamServer>>,
    pub injected_headers: Option<InjectedHeaders>,
}

impl GatewayCtx {
    pub fn new() -> Self {
        GatewayCtx {
            request_id: format!("req-{}", rand::random::<u32>()),
            request_start_time: Instant::now(),
            session: None,
            identity: None,
            redirect_target: None,
            upstream: None,
            injected_headers: None,
        }
    }
}

#[async_trait]
impl ProxyHttp for GatewayRouter {
    type CTX = GatewayCtx;

    fn new_ctx(&self) -> Self::CTX {
        GatewayCtx::new()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        info!(
            "********** [{}] New request received for path: {}",
            ctx.request_id,
            session.req_header().uri.path()
        );

        let local_response = {
            let request = InboundRequest::from_header(session.req_header());
            self.pipeline.run_request_filters(&request, ctx).await
        };
        match local_response {
            Some(response) => {
                response.write_to(session).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        match &ctx.upstream {
            Some(server) => {
                info!(
                    "[{}] Selecting upstream peer '{}' at {}",
                    ctx.request_id, server.id, server.url
                );
                Ok(server.peer())
            }
            None => {
                warn!("[{}] No upstream selected for the request", ctx.request_id);
                Err(Error::new(ErrorType::HTTPStatus(502)))
            }
        }
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        self.pipeline.upstream_request_filters(upstream_request, ctx)?;

        if let Some(client) = session.client_addr().and_then(|addr| addr.as_inet()) {
            let prior = upstream_request
                .headers
                .get("X-Forwarded-For")
                .and_then(|v| v.to_str().ok());
            let chain = forwarded_for(prior, &client.ip().to_string());
            upstream_request.insert_header("X-Forwarded-For", chain)?;
        }
        Ok(())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        self.pipeline.response_filters(upstream_response, ctx)
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        let response_code = session
            .response_written()
            .map_or(0, |resp| resp.status.as_u16());
        info!(
            "********** [{}] Request finished for {} {} from {:?} with status {} in {:?}",
            ctx.request_id,
            session.req_header().method,
            session.req_header().uri.path(),
            session.client_addr(),
            response_code,
            ctx.request_start_time.elapsed()
        );
    }
}

/// Assembles the request pipeline in its fixed stage order.
fn build_pipeline(
    store: Arc<SessionStore>,
    providers: Vec<Arc<Provider>>,
    proxy_url: ProxyUrl,
    skip_login_page: bool,
    injection: HeaderInjection,
    servers: Vec<UpstreamServer>,
) -> Pipeline {
    let sessions = Arc::new(SessionIdentityManager::new(store.clone()));

    let mut links: Vec<LoginLink> = providers
        .iter()
        .map(|provider| LoginLink {
            provider_id: provider.id.clone(),
            start_path: provider.start_path.clone(),
        })
        .collect();
    let entry = if skip_login_page && links.len() == 1 {
        LoginEntry::SkipTo(links.remove(0))
    } else {
        LoginEntry::Page(links)
    };

    let flow = Arc::new(OidcFlow::new(store.clone(), sessions.clone(), providers));
    let stages: Vec<Arc<dyn RouteLogic>> = vec![
        Arc::new(SessionIdentityRoute::new(sessions)),
        Arc::new(LoginStatusRoute::new(store)),
        Arc::new(ExplicitRedirectRoute),
        Arc::new(OidcRoute::new(flow)),
        Arc::new(LoginGateRoute::new(proxy_url.clone(), entry)),
        Arc::new(HeaderInjectionRoute::new(Arc::new(injection))),
        Arc::new(UpstreamRoute::new(UpstreamRouter::new(servers), proxy_url)),
    ];
    Pipeline::new(stages)
}

fn load_config(path: &str) -> Result<GatewayConfig, ConfigError> {
    let mut app_config = config::load_app_config(path)?;
    app_config.apply_overrides(
        env::var(config::PORT_ENV).ok(),
        env::var(config::LOG_LEVEL_ENV).ok(),
    )?;
    app_config.validate()
}

fn idp_client(timeout: Duration) -> Result<reqwest::Client, OidcError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Runs discovery on a runtime of its own. Each provider gets a fresh client for
/// request-time calls, so no pooled connection outlives this runtime.
fn discover_providers(
    settings: Vec<ProviderSettings>,
    timeout: Duration,
) -> Result<Vec<Arc<Provider>>, OidcError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| OidcError::Discovery(format!("failed to start discovery runtime: {}", e)))?;
    let discovery_http = idp_client(timeout)?;
    runtime.block_on(async {
        let mut providers = Vec::with_capacity(settings.len());
        for provider_settings in settings {
            info!(
                "Discovering provider '{}' at {}",
                provider_settings.id, provider_settings.issuer
            );
            let http = idp_client(timeout)?;
            let provider = Provider::discover(provider_settings, &discovery_http, http).await?;
            providers.push(Arc::new(provider));
        }
        Ok::<_, OidcError>(providers)
    })
}

fn main() -> pingora::Result<()> {
    let gateway_start_time = Instant::now();
    let config_path =
        env::var(config::CONFIG_PATH_ENV).unwrap_or_else(|_| config::CONFIG_PATH.to_string());

    let gateway_config = match load_config(&config_path) {
        Ok(gateway_config) => gateway_config,
        Err(e) => {
            env_logger::Builder::new()
                .filter_level(log::LevelFilter::Info)
                .parse_default_env()
                .init();
            match e {
                ConfigError::Invalid(problems) => {
                    for problem in problems {
                        error!("Invalid configuration in {}: {}", config_path, problem);
                    }
                }
                other => error!("{}", other),
            }
            std::process::exit(1);
        }
    };

    env_logger::Builder::new()
        .filter_level(gateway_config.log_level)
        .parse_default_env()
        .init();

    let listen_addr = format!("0.0.0.0:{}", gateway_config.port);
    info!(
        "Startup settings:\n\
        {}: {}\n\
        listen address: {}\n\
        proxy url: {}\n\
        providers: {}\n\
        upstream servers: {}",
        config::CONFIG_PATH_ENV,
        config_path,
        listen_addr,
        gateway_config.proxy_url.url_for_path("/"),
        gateway_config.providers.len(),
        gateway_config.servers.len()
    );

    let providers = match discover_providers(gateway_config.providers, gateway_config.idp_timeout)
    {
        Ok(providers) => providers,
        Err(e) => {
            error!("Provider discovery failed: {}", e);
            std::process::exit(1);
        }
    };

    let store = Arc::new(SessionStore::new());
    let pipeline = build_pipeline(
        store.clone(),
        providers,
        gateway_config.proxy_url,
        gateway_config.skip_login_page,
        gateway_config.injection,
        gateway_config.servers,
    );

    let mut my_server = Server::new(None)?;
    my_server.bootstrap();

    my_server.add_service(background_service(
        "Session Sweeper",
        SessionSweeper::new(store, SWEEP_INTERVAL),
    ));

    let mut gateway_service =
        http_proxy_service(&my_server.configuration, GatewayRouter { pipeline });
    gateway_service.add_tcp(&listen_addr);
    my_server.add_service(gateway_service);
    info!(
        "Gateway server starting on {}. Preparation took {:?}",
        listen_addr,
        gateway_start_time.elapsed()
    );

    my_server.run_forever();
}
