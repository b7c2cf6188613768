/// # OIDC Authentication
///
/// Everything under `/oauth2` is answered by this module: the per-provider start and
/// callback endpoints of the authorization-code flow and the health/ready probes.
///
/// ## Key Components:
///
/// - **`OidcFlow`**: the handshake itself. `start` stores `state`, `nonce` and the
///   redirect target as transient session fields and sends the browser to the provider.
///   `callback` checks them, exchanges the code, verifies the ID token, fetches user info,
///   rotates the session id and stores the identity.
///
/// - **`OidcRoute`**: the pipeline stage that maps `/oauth2/...` paths onto the flow.
///
/// Transient fields are removed on every exit from `callback`, including when the
/// handler future is dropped mid-flight.
pub mod error;
pub mod provider;
pub mod verifier;

use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};

use crate::actions::{InboundRequest, LocalResponse, RouteLogic};
use crate::error::GatewayError;
use crate::random;
use crate::session_id::{SessionHandle, SessionId, SessionIdentityManager};
use crate::session_store::{SessionField, SessionStore, SessionValue, TRANSIENT_TTL};
use crate::GatewayCtx;
use provider::Provider;

pub const OIDC_MOUNT_PATH: &str = "/oauth2";
pub const HEALTH_PATH: &str = "/oauth2/health";
pub const READY_PATH: &str = "/oauth2/ready";

pub fn is_oidc_path(path: &str) -> bool {
    path == OIDC_MOUNT_PATH
        || path
            .strip_prefix(OIDC_MOUNT_PATH)
            .is_some_and(|rest| rest.starts_with('/'))
}

enum Endpoint<'a> {
    Start(&'a Provider),
    Callback(&'a Provider),
    Health,
    Ready,
}

/// Removes the handshake fields of one session when dropped.
struct TransientCleanup<'a> {
    store: &'a SessionStore,
    id: SessionId,
}

impl Drop for TransientCleanup<'_> {
    fn drop(&mut self) {
        self.store.delete_fields(&self.id, &SessionField::TRANSIENT);
    }
}

#[derive(Default)]
struct CallbackParams {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
}

impl CallbackParams {
    fn parse(query: Option<&str>) -> Self {
        let mut params = CallbackParams::default();
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            let slot = match key.as_ref() {
                "state" => &mut params.state,
                "code" => &mut params.code,
                "error" => &mut params.error,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        params
    }
}

pub struct OidcFlow {
    store: Arc<SessionStore>,
    sessions: Arc<SessionIdentityManager>,
    providers: Vec<Arc<Provider>>,
}

impl OidcFlow {
    pub fn new(
        store: Arc<SessionStore>,
        sessions: Arc<SessionIdentityManager>,
        providers: Vec<Arc<Provider>>,
    ) -> Self {
        OidcFlow {
            store,
            sessions,
            providers,
        }
    }

    pub fn providers(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    fn endpoint(&self, path: &str) -> Option<Endpoint<'_>> {
        match path {
            HEALTH_PATH => return Some(Endpoint::Health),
            READY_PATH => return Some(Endpoint::Ready),
            _ => {}
        }
        self.providers.iter().find_map(|provider| {
            if provider.start_path == path {
                Some(Endpoint::Start(provider.as_ref()))
            } else if provider.callback_path == path {
                Some(Endpoint::Callback(provider.as_ref()))
            } else {
                None
            }
        })
    }

    /// Begins a handshake with `provider` for `session`.
    pub fn start(
        &self,
        provider: &Provider,
        session: &SessionHandle,
        redirect_target: Option<&str>,
        request_id: &str,
    ) -> Result<LocalResponse, GatewayError> {
        let target = redirect_target.ok_or_else(|| {
            GatewayError::client(
                "Authentication request without upstream redirect URL is not allowed",
            )
        })?;
        let id = session.id();
        self.store.delete_fields(id, &SessionField::AUTHENTICATED);
        // Reverse of the write order in `store_handshake`.
        for field in SessionField::TRANSIENT.into_iter().rev() {
            self.store.delete(id, field);
        }

        let state = random::random_token()?;
        let nonce = random::random_token()?;
        let values = [
            (SessionField::State, state.clone()),
            (SessionField::Nonce, nonce.clone()),
            (SessionField::RedirectTarget, target.to_string()),
        ];
        if !self.store_handshake(id, values) {
            warn!(
                "[{}] [OidcRoute] Concurrent login start for the same session, rejecting",
                request_id
            );
            return Err(GatewayError::client(
                "Another login is already in progress for this session",
            ));
        }

        let authorization_url = provider.authorization_url(&state, &nonce);
        info!(
            "[{}] [OidcRoute] Starting login with provider '{}', returning to {}",
            request_id, provider.id, target
        );
        Ok(LocalResponse::redirect(authorization_url.to_string()).no_cache())
    }

    /// Writes the three handshake fields. Succeeds only if every field still holds this
    /// call's value once all are written; otherwise whatever this call wrote is removed
    /// again and values of other writers are left in place.
    fn store_handshake(&self, id: &SessionId, values: [(SessionField, String); 3]) -> bool {
        let mut written = Vec::with_capacity(values.len());
        for (field, value) in values {
            match self
                .store
                .put(id, field, SessionValue::Text(value), TRANSIENT_TTL)
            {
                Ok(ticket) => written.push((field, ticket)),
                Err(_) => break,
            }
        }
        let intact = written.len() == SessionField::TRANSIENT.len()
            && written
                .iter()
                .all(|(field, ticket)| self.store.holds(id, *field, *ticket));
        if !intact {
            for (field, ticket) in written {
                self.store.delete_written(id, field, ticket);
            }
        }
        intact
    }

    /// Completes a handshake. On success the session has a new id holding the identity.
    pub async fn callback(
        &self,
        provider: &Provider,
        session: &mut SessionHandle,
        query: Option<&str>,
        request_id: &str,
    ) -> Result<LocalResponse, GatewayError> {
        let id = session.id().clone();
        self.store.delete_fields(&id, &SessionField::AUTHENTICATED);
        let _cleanup = TransientCleanup {
            store: &self.store,
            id: id.clone(),
        };
        let params = CallbackParams::parse(query);

        let stored_state = self
            .store
            .get_text(&id, SessionField::State)
            .ok_or_else(|| GatewayError::client("state not found"))?;
        if params.state.as_deref() != Some(stored_state.as_str()) {
            return Err(GatewayError::client("state did not match"));
        }

        let code = params.code.ok_or_else(|| {
            GatewayError::upstream_auth(format!(
                "Failed to exchange token: provider returned no code (error: {})",
                params.error.as_deref().unwrap_or("none")
            ))
        })?;
        let tokens = provider
            .exchange_code(&code)
            .await
            .map_err(|e| GatewayError::upstream_auth(format!("Failed to exchange token: {}", e)))?;
        let raw_id_token = tokens
            .id_token
            .ok_or_else(|| GatewayError::upstream_auth("No id_token field in oauth2 token."))?;
        let id_token = provider
            .verify_id_token(&raw_id_token)
            .await
            .map_err(|e| GatewayError::upstream_auth(format!("Failed to verify ID Token: {}", e)))?;

        // Checked after the signature so only a provider-issued nonce is compared.
        let stored_nonce = self
            .store
            .get_text(&id, SessionField::Nonce)
            .ok_or_else(|| GatewayError::client("nonce not found"))?;
        if id_token.nonce.as_deref() != Some(stored_nonce.as_str()) {
            return Err(GatewayError::client("nonce did not match"));
        }

        let user_info = provider
            .user_info(&tokens.access_token, &id_token.subject)
            .await
            .map_err(|e| GatewayError::upstream_auth(format!("Failed to get user info: {}", e)))?;
        let target = self
            .store
            .get_text(&id, SessionField::RedirectTarget)
            .ok_or_else(|| GatewayError::upstream_auth("redirect target not found"))?;

        self.sessions.rotate(session)?;
        let new_id = session.id();
        let subject = id_token.subject.clone();
        for (field, value) in [
            (SessionField::IdToken, SessionValue::IdToken(Arc::new(id_token))),
            (SessionField::UserInfo, SessionValue::UserInfo(Arc::new(user_info))),
        ] {
            self.store
                .put(new_id, field, value, field.ttl())
                .map_err(|e| GatewayError::internal(format!("failed to store identity: {}", e)))?;
        }

        info!(
            "[{}] [OidcRoute] Login with provider '{}' succeeded for subject {}",
            request_id, provider.id, subject
        );
        Ok(LocalResponse::redirect(target).no_cache())
    }
}

/// Answers every request under `/oauth2`.
pub struct OidcRoute {
    flow: Arc<OidcFlow>,
}

impl OidcRoute {
    pub fn new(flow: Arc<OidcFlow>) -> Self {
        OidcRoute { flow }
    }
}

#[async_trait]
impl RouteLogic for OidcRoute {
    fn name(&self) -> &'static str {
        "OidcRoute"
    }

    async fn request_filter(
        &self,
        request: &InboundRequest<'_>,
        ctx: &mut GatewayCtx,
    ) -> Result<Option<LocalResponse>, GatewayError> {
        let path = request.path();
        if !is_oidc_path(path) {
            return Ok(None);
        }
        let response = match self.flow.endpoint(path) {
            None => {
                warn!("[{}] [{}] Unknown endpoint {}", ctx.request_id, self.name(), path);
                LocalResponse::text(404, "Not Found")
            }
            Some(Endpoint::Health) | Some(Endpoint::Ready) => LocalResponse::text(200, "OK"),
            Some(Endpoint::Start(provider)) => {
                let session = ctx
                    .session
                    .as_ref()
                    .ok_or_else(|| GatewayError::internal("session was not loaded"))?;
                self.flow.start(
                    provider,
                    session,
                    ctx.redirect_target.as_deref(),
                    &ctx.request_id,
                )?
            }
            Some(Endpoint::Callback(provider)) => {
                let session = ctx
                    .session
                    .as_mut()
                    .ok_or_else(|| GatewayError::internal("session was not loaded"))?;
                self.flow
                    .callback(provider, session, request.query(), &ctx.request_id)
                    .await?
            }
        };
        Ok(Some(response))
    }
}
