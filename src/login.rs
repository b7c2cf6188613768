//! Login status and the login gate.
//!
//! `LoginStatusRoute` looks up the identity stored for the session. `LoginGateRoute`
//! lets authenticated requests through and sends everyone else to the login entry point:
//! a page listing the providers, or straight into the only provider's start endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};

use crate::actions::{InboundRequest, LocalResponse, RouteLogic};
use crate::claims::Claims;
use crate::error::GatewayError;
use crate::oidc::is_oidc_path;
use crate::oidc::verifier::IdToken;
use crate::proxy_url::ProxyUrl;
use crate::redirect::{self, REDIRECT_QUERY_PARAM};
use crate::session_id::SessionId;
use crate::session_store::{SessionField, SessionStore, SessionValue};
use crate::GatewayCtx;

/// The identity of a logged-in session.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id_token: Arc<IdToken>,
    pub user_info: Option<Arc<Claims>>,
}

/// A session is logged in while it holds an unexpired ID token.
pub fn current_identity(store: &SessionStore, id: &SessionId) -> Option<Identity> {
    let id_token = store
        .get(id, SessionField::IdToken)
        .and_then(SessionValue::into_id_token)?;
    if id_token.is_expired() {
        return None;
    }
    let user_info = store
        .get(id, SessionField::UserInfo)
        .and_then(SessionValue::into_user_info);
    Some(Identity {
        id_token,
        user_info,
    })
}

pub struct LoginStatusRoute {
    store: Arc<SessionStore>,
}

impl LoginStatusRoute {
    pub fn new(store: Arc<SessionStore>) -> Self {
        LoginStatusRoute { store }
    }
}

#[async_trait]
impl RouteLogic for LoginStatusRoute {
    fn name(&self) -> &'static str {
        "LoginStatus"
    }

    async fn request_filter(
        &self,
        _request: &InboundRequest<'_>,
        ctx: &mut GatewayCtx,
    ) -> Result<Option<LocalResponse>, GatewayError> {
        ctx.identity = ctx
            .session
            .as_ref()
            .and_then(|session| current_identity(&self.store, session.id()));
        debug!(
            "[{}] [{}] Logged in: {}",
            ctx.request_id,
            self.name(),
            ctx.identity.is_some()
        );
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct LoginLink {
    pub provider_id: String,
    /// Full start path, including the `/oauth2` mount point.
    pub start_path: String,
}

#[derive(Debug, Clone)]
pub enum LoginEntry {
    Page(Vec<LoginLink>),
    SkipTo(LoginLink),
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub struct LoginGateRoute {
    proxy_url: ProxyUrl,
    entry: LoginEntry,
}

impl LoginGateRoute {
    pub fn new(proxy_url: ProxyUrl, entry: LoginEntry) -> Self {
        LoginGateRoute { proxy_url, entry }
    }

    fn start_url(&self, link: &LoginLink, target: &str) -> String {
        let mut url = self.proxy_url.url_for_path(&link.start_path);
        url.query_pairs_mut()
            .append_pair(REDIRECT_QUERY_PARAM, target);
        url.to_string()
    }

    fn render_page(&self, links: &[LoginLink], target: &str) -> String {
        let mut items = String::new();
        for link in links {
            items.push_str(&format!(
                "      <li><a href=\"{}\">Sign in with {}</a></li>\n",
                escape_html(&self.start_url(link, target)),
                escape_html(&link.provider_id)
            ));
        }
        format!(
            "<!DOCTYPE html>\n\
             <html lang=\"en\">\n\
             <head>\n\
             \x20 <meta charset=\"utf-8\">\n\
             \x20 <title>Sign in</title>\n\
             </head>\n\
             <body>\n\
             \x20 <h1>Sign in</h1>\n\
             \x20 <p>You will be returned to {} after signing in.</p>\n\
             \x20 <ul>\n{}  </ul>\n\
             </body>\n\
             </html>\n",
            escape_html(target),
            items
        )
    }

    fn login_entry(&self, target: &str) -> LocalResponse {
        let response = match &self.entry {
            LoginEntry::SkipTo(link) => LocalResponse::redirect(self.start_url(link, target)),
            LoginEntry::Page(links) => LocalResponse::html(self.render_page(links, target)),
        };
        response.no_cache()
    }
}

#[async_trait]
impl RouteLogic for LoginGateRoute {
    fn name(&self) -> &'static str {
        "LoginGate"
    }

    async fn request_filter(
        &self,
        request: &InboundRequest<'_>,
        ctx: &mut GatewayCtx,
    ) -> Result<Option<LocalResponse>, GatewayError> {
        if ctx.identity.is_some() || is_oidc_path(request.path()) {
            return Ok(None);
        }
        let target = redirect::resolve(ctx.redirect_target.take(), &self.proxy_url, request.path());
        info!(
            "[{}] [{}] Not logged in, sending to login entry (return to {})",
            ctx.request_id,
            self.name(),
            target
        );
        let response = self.login_entry(&target);
        ctx.redirect_target = Some(target);
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::tests::request;
    use crate::session_store::AUTHENTICATED_TTL;

    fn link(id: &str, start: &str) -> LoginLink {
        LoginLink {
            provider_id: id.to_string(),
            start_path: start.to_string(),
        }
    }

    fn gate(entry: LoginEntry) -> LoginGateRoute {
        LoginGateRoute::new(ProxyUrl::new("proxy.example").unwrap(), entry)
    }

    fn id_token(expires_at: i64) -> IdToken {
        IdToken {
            subject: "user-42".to_string(),
            expires_at,
            nonce: Some("n".to_string()),
            claims: Claims::default(),
        }
    }

    async fn run(gate: &LoginGateRoute, uri: &str, ctx: &mut GatewayCtx) -> Option<LocalResponse> {
        let parts = request(uri, &[]);
        gate.request_filter(&InboundRequest::from_parts(&parts), ctx)
            .await
            .unwrap()
    }

    #[test]
    fn only_unexpired_tokens_count_as_logged_in() {
        let store = SessionStore::new();
        let id = SessionId::generate().unwrap();
        assert!(current_identity(&store, &id).is_none());

        let now = chrono::Utc::now().timestamp();
        store
            .put(
                &id,
                SessionField::IdToken,
                SessionValue::IdToken(Arc::new(id_token(now - 1))),
                AUTHENTICATED_TTL,
            )
            .unwrap();
        assert!(current_identity(&store, &id).is_none());

        let fresh = SessionId::generate().unwrap();
        store
            .put(
                &fresh,
                SessionField::IdToken,
                SessionValue::IdToken(Arc::new(id_token(now + 600))),
                AUTHENTICATED_TTL,
            )
            .unwrap();
        let identity = current_identity(&store, &fresh).unwrap();
        assert_eq!(identity.id_token.subject, "user-42");
        assert!(identity.user_info.is_none());
    }

    #[tokio::test]
    async fn skip_login_page_redirects_into_the_start_endpoint() {
        let gate = gate(LoginEntry::SkipTo(link("google", "/oauth2/login/google")));
        let mut ctx = GatewayCtx::new();
        ctx.redirect_target = Some("https://app.example/dash".to_string());

        let response = run(&gate, "/protected", &mut ctx).await.unwrap();
        assert_eq!(response.status, 302);
        assert_eq!(
            response.header("Location"),
            Some("https://proxy.example/oauth2/login/google?redirect=https%3A%2F%2Fapp.example%2Fdash")
        );
        assert_eq!(response.header("Pragma"), Some("no-cache"));
    }

    #[tokio::test]
    async fn login_page_lists_every_provider_with_the_implicit_target() {
        let gate = gate(LoginEntry::Page(vec![
            link("google", "/oauth2/login/google"),
            link("<corp>", "/oauth2/login/corp"),
        ]));
        let mut ctx = GatewayCtx::new();

        let response = run(&gate, "/app/reports", &mut ctx).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("X-Accel-Expires"), Some("0"));
        let body = std::str::from_utf8(&response.body).unwrap();
        assert!(body.contains(
            "href=\"https://proxy.example/oauth2/login/google?redirect=https%3A%2F%2Fproxy.example%2Fapp%2Freports\""
        ));
        assert!(body.contains("Sign in with &lt;corp&gt;"));
        assert_eq!(
            ctx.redirect_target.as_deref(),
            Some("https://proxy.example/app/reports")
        );
    }

    #[tokio::test]
    async fn logged_in_and_oidc_requests_pass() {
        let gate = gate(LoginEntry::SkipTo(link("google", "/oauth2/login/google")));

        let mut ctx = GatewayCtx::new();
        assert!(run(&gate, "/oauth2/callback/google", &mut ctx).await.is_none());

        ctx.identity = Some(Identity {
            id_token: Arc::new(id_token(chrono::Utc::now().timestamp() + 600)),
            user_info: None,
        });
        assert!(run(&gate, "/protected", &mut ctx).await.is_none());
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(
            escape_html(r#"<a href="x">&'"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;"
        );
    }
}
