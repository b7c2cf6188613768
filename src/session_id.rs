//! Cookie-carried session identifiers.
//!
//! `SessionIdentityManager` is the only code that mints session ids or writes the
//! `session_id` cookie. A fresh id replaces a missing or malformed cookie, and `rotate`
//! swaps the id right after a successful login so a pre-login id planted by an attacker is
//! worthless afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use cookie::{Cookie, SameSite};
use log::{info, warn};
use pingora::http::ResponseHeader;
use time::OffsetDateTime;

use crate::actions::{InboundRequest, LocalResponse, RouteLogic};
use crate::error::GatewayError;
use crate::random;
use crate::session_store::{SessionField, SessionStore};
use crate::GatewayCtx;

pub const SESSION_COOKIE_NAME: &str = "session_id";
const SESSION_COOKIE_LIFETIME: time::Duration = time::Duration::minutes(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Result<Self, GatewayError> {
        random::random_token().map(SessionId)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        random::is_token(raw).then(|| SessionId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The session id in use for the current request, plus the `Set-Cookie` value to send
/// back when the id was issued during this request.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    set_cookie: Option<String>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn set_cookie(&self) -> Option<&str> {
        self.set_cookie.as_deref()
    }

    fn issue(id: SessionId) -> Self {
        let set_cookie = Some(session_cookie(&id));
        SessionHandle { id, set_cookie }
    }
}

fn session_cookie(id: &SessionId) -> String {
    Cookie::build((SESSION_COOKIE_NAME, id.as_str().to_owned()))
        .path("/")
        .secure(true)
        .http_only(true)
        .same_site(SameSite::Lax)
        .expires(OffsetDateTime::now_utc() + SESSION_COOKIE_LIFETIME)
        .build()
        .to_string()
}

pub struct SessionIdentityManager {
    store: Arc<SessionStore>,
}

impl SessionIdentityManager {
    pub fn new(store: Arc<SessionStore>) -> Self {
        SessionIdentityManager { store }
    }

    /// Uses the first well-formed `session_id` cookie, or issues a new id.
    pub fn load<'a>(
        &self,
        cookie_headers: impl IntoIterator<Item = &'a str>,
    ) -> Result<SessionHandle, GatewayError> {
        let existing = cookie_headers.into_iter().find_map(|header| {
            Cookie::split_parse(header)
                .flatten()
                .filter(|cookie| cookie.name() == SESSION_COOKIE_NAME)
                .find_map(|cookie| SessionId::parse(cookie.value()))
        });
        match existing {
            Some(id) => Ok(SessionHandle {
                id,
                set_cookie: None,
            }),
            None => Ok(SessionHandle::issue(SessionId::generate()?)),
        }
    }

    /// Moves the session to a brand-new id and cookie.
    ///
    /// Authenticated fields are copied to the new id, and the old id's authenticated
    /// fields are deleted whether or not the copy succeeded. The handle points at the new
    /// id afterwards even when an error is returned.
    pub fn rotate(&self, handle: &mut SessionHandle) -> Result<(), GatewayError> {
        let new_id = SessionId::generate()?;
        let old_id = std::mem::replace(handle, SessionHandle::issue(new_id)).id;

        let mut copied = Ok(());
        for field in SessionField::AUTHENTICATED {
            if let Some(value) = self.store.get(&old_id, field) {
                if let Err(e) = self.store.put(handle.id(), field, value, field.ttl()) {
                    copied = Err(GatewayError::internal(format!(
                        "failed to carry {:?} over to the rotated session: {}",
                        field, e
                    )));
                    break;
                }
            }
        }
        self.store.delete_fields(&old_id, &SessionField::AUTHENTICATED);
        copied
    }
}

/// Loads the session id for every request and hands out the cookie when a new id was
/// issued.
pub struct SessionIdentityRoute {
    manager: Arc<SessionIdentityManager>,
}

impl SessionIdentityRoute {
    pub fn new(manager: Arc<SessionIdentityManager>) -> Self {
        SessionIdentityRoute { manager }
    }
}

#[async_trait]
impl RouteLogic for SessionIdentityRoute {
    fn name(&self) -> &'static str {
        "SessionIdentity"
    }

    async fn request_filter(
        &self,
        request: &InboundRequest<'_>,
        ctx: &mut GatewayCtx,
    ) -> Result<Option<LocalResponse>, GatewayError> {
        let handle = self.manager.load(request.header_values("Cookie"))?;
        if handle.set_cookie().is_some() {
            info!(
                "[{}] [{}] No valid session cookie, issued a new session id",
                ctx.request_id,
                self.name()
            );
        }
        ctx.session = Some(handle);
        Ok(None)
    }

    fn response_filter(
        &self,
        response: &mut ResponseHeader,
        ctx: &GatewayCtx,
    ) -> pingora::Result<()> {
        if let Some(set_cookie) = ctx.session.as_ref().and_then(SessionHandle::set_cookie) {
            if let Err(e) = response.append_header("Set-Cookie", set_cookie.to_owned()) {
                warn!(
                    "[{}] [{}] Failed to append session cookie: {}",
                    ctx.request_id,
                    self.name(),
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    fn finalize_local_response(&self, response: &mut LocalResponse, ctx: &GatewayCtx) {
        if let Some(set_cookie) = ctx.session.as_ref().and_then(SessionHandle::set_cookie) {
            response.push_header("Set-Cookie", set_cookie);
        }
    }
}
