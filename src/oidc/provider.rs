//! An OpenID Connect provider as seen by the gateway: its discovered endpoints, the
//! OAuth2 client registered with it and the verifier for its ID tokens.

use std::str::FromStr;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::Algorithm;
use log::{info, warn};
use serde::Deserialize;
use url::Url;

use super::error::OidcError;
use super::verifier::{fetch_jwks, IdToken, IdTokenVerifier};
use super::OIDC_MOUNT_PATH;
use crate::claims::Claims;

/// Validated provider configuration, before discovery.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub id: String,
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: Url,
    /// Relative to the `/oauth2` mount point.
    pub start_path: String,
    /// Always includes `openid`.
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    #[serde(default)]
    pub userinfo_endpoint: Option<Url>,
    #[serde(default)]
    pub jwks_uri: Option<Url>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

/// Fetches `{issuer}/.well-known/openid-configuration` and checks it describes `issuer`.
pub async fn discover(http: &reqwest::Client, issuer: &str) -> Result<ProviderMetadata, OidcError> {
    let discovery_url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    let metadata = http
        .get(&discovery_url)
        .send()
        .await?
        .error_for_status()?
        .json::<ProviderMetadata>()
        .await?;
    if metadata.issuer != issuer {
        return Err(OidcError::Discovery(format!(
            "issuer did not match the issuer returned by provider, expected {:?} got {:?}",
            issuer, metadata.issuer
        )));
    }
    Ok(metadata)
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Credentials for `client_secret_basic` are form-encoded before base64.
fn form_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

pub struct Provider {
    pub id: String,
    /// Full path of the start endpoint, including `/oauth2`.
    pub start_path: String,
    /// Path of the configured redirect URL.
    pub callback_path: String,
    client_id: String,
    client_secret: String,
    redirect_url: Url,
    scopes: Vec<String>,
    metadata: ProviderMetadata,
    verifier: IdTokenVerifier,
    http: reqwest::Client,
}

impl Provider {
    /// Runs discovery and the initial JWKS fetch with `discovery_http`; later calls use
    /// `http`.
    pub async fn discover(
        settings: ProviderSettings,
        discovery_http: &reqwest::Client,
        http: reqwest::Client,
    ) -> Result<Self, OidcError> {
        let metadata = discover(discovery_http, &settings.issuer).await?;
        let keys = match &metadata.jwks_uri {
            Some(jwks_uri) => fetch_jwks(discovery_http, jwks_uri).await?,
            None => JwkSet { keys: Vec::new() },
        };
        info!(
            "Discovered provider '{}': authorization {}, token {}, {} signing keys",
            settings.id,
            metadata.authorization_endpoint,
            metadata.token_endpoint,
            keys.keys.len()
        );
        Ok(Provider::new(settings, metadata, keys, http))
    }

    pub fn new(
        settings: ProviderSettings,
        metadata: ProviderMetadata,
        keys: JwkSet,
        http: reqwest::Client,
    ) -> Self {
        let mut algorithms: Vec<Algorithm> = metadata
            .id_token_signing_alg_values_supported
            .iter()
            .filter_map(|name| match Algorithm::from_str(name) {
                Ok(alg) => Some(alg),
                Err(_) => {
                    warn!(
                        "Provider '{}' advertises unsupported signing algorithm '{}'",
                        settings.id, name
                    );
                    None
                }
            })
            .collect();
        if algorithms.is_empty() {
            algorithms.push(Algorithm::RS256);
        }

        let verifier = IdTokenVerifier::new(
            metadata.issuer.clone(),
            settings.client_id.clone(),
            settings.client_secret.clone(),
            algorithms,
            keys,
            metadata.jwks_uri.clone(),
            http.clone(),
        );
        Provider {
            start_path: format!("{}{}", OIDC_MOUNT_PATH, settings.start_path),
            callback_path: settings.redirect_url.path().to_string(),
            id: settings.id,
            client_id: settings.client_id,
            client_secret: settings.client_secret,
            redirect_url: settings.redirect_url,
            scopes: settings.scopes,
            metadata,
            verifier,
            http,
        }
    }

    pub fn authorization_url(&self, state: &str, nonce: &str) -> Url {
        let mut url = self.metadata.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", self.redirect_url.as_str())
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", state)
            .append_pair("nonce", nonce);
        url
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, OidcError> {
        let response = self
            .http
            .post(self.metadata.token_endpoint.clone())
            .basic_auth(
                form_encode(&self.client_id),
                Some(form_encode(&self.client_secret)),
            )
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_url.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OidcError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<TokenResponse>().await?)
    }

    pub async fn verify_id_token(&self, raw: &str) -> Result<IdToken, OidcError> {
        self.verifier.verify(raw).await
    }

    /// Fetches the user-info claims. A `sub` that differs from the ID token's is refused.
    pub async fn user_info(
        &self,
        access_token: &str,
        expected_subject: &str,
    ) -> Result<Claims, OidcError> {
        let endpoint = self
            .metadata
            .userinfo_endpoint
            .as_ref()
            .ok_or(OidcError::MissingUserInfoEndpoint)?;
        let claims = self
            .http
            .get(endpoint.clone())
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?
            .json::<Claims>()
            .await?;
        match claims.sub.as_deref() {
            Some(found) if found != expected_subject => Err(OidcError::SubjectMismatch {
                expected: expected_subject.to_string(),
                found: found.to_string(),
            }),
            _ => Ok(claims),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::oidc::verifier::tests::{sign, token_claims, CLIENT_ID, CLIENT_SECRET};
    use mockito::Matcher;
    use serde_json::json;

    pub(crate) fn settings(issuer: &str) -> ProviderSettings {
        ProviderSettings {
            id: "google".to_string(),
            issuer: issuer.to_string(),
            client_id: CLIENT_ID.to_string(),
            client_secret: CLIENT_SECRET.to_string(),
            redirect_url: Url::parse("https://proxy.example/oauth2/callback/google").unwrap(),
            start_path: "/login/google".to_string(),
            scopes: vec!["openid".to_string(), "email".to_string()],
        }
    }

    /// A provider whose endpoints all live on `base` and whose tokens are HS256-signed
    /// with the client secret.
    pub(crate) fn provider_at(issuer: &str, base: &str) -> Provider {
        let metadata = ProviderMetadata {
            issuer: issuer.to_string(),
            authorization_endpoint: Url::parse(&format!("{}/authorize", base)).unwrap(),
            token_endpoint: Url::parse(&format!("{}/token", base)).unwrap(),
            userinfo_endpoint: Some(Url::parse(&format!("{}/userinfo", base)).unwrap()),
            jwks_uri: None,
            id_token_signing_alg_values_supported: vec!["RS256".to_string(), "HS256".to_string()],
        };
        Provider::new(
            settings(issuer),
            metadata,
            JwkSet { keys: Vec::new() },
            reqwest::Client::new(),
        )
    }

    fn query_param(url: &Url, name: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn derives_endpoint_paths_from_settings() {
        let provider = provider_at("https://idp.example", "https://idp.example");
        assert_eq!(provider.start_path, "/oauth2/login/google");
        assert_eq!(provider.callback_path, "/oauth2/callback/google");
    }

    #[test]
    fn authorization_url_carries_state_nonce_and_redirect_uri() {
        let provider = provider_at("https://idp.example", "https://idp.example");
        let url = provider.authorization_url("S", "N");
        assert!(url.as_str().starts_with("https://idp.example/authorize?"));
        assert_eq!(query_param(&url, "state").as_deref(), Some("S"));
        assert_eq!(query_param(&url, "nonce").as_deref(), Some("N"));
        assert_eq!(query_param(&url, "response_type").as_deref(), Some("code"));
        assert_eq!(query_param(&url, "client_id").as_deref(), Some(CLIENT_ID));
        assert_eq!(query_param(&url, "scope").as_deref(), Some("openid email"));
        assert_eq!(
            query_param(&url, "redirect_uri").as_deref(),
            Some("https://proxy.example/oauth2/callback/google")
        );
    }

    #[tokio::test]
    async fn discovery_checks_the_issuer() {
        let mut server = mockito::Server::new_async().await;
        let issuer = server.url();
        let _discovery = server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "issuer": "https://somebody-else.example",
                    "authorization_endpoint": format!("{}/authorize", issuer),
                    "token_endpoint": format!("{}/token", issuer),
                })
                .to_string(),
            )
            .create_async()
            .await;

        let err = discover(&reqwest::Client::new(), &issuer).await.unwrap_err();
        assert!(matches!(err, OidcError::Discovery(_)));
    }

    #[tokio::test]
    async fn discovery_loads_metadata_and_keys() {
        let mut server = mockito::Server::new_async().await;
        let issuer = server.url();
        let _discovery = server
            .mock("GET", "/.well-known/openid-configuration")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "issuer": issuer,
                    "authorization_endpoint": format!("{}/authorize", issuer),
                    "token_endpoint": format!("{}/token", issuer),
                    "userinfo_endpoint": format!("{}/userinfo", issuer),
                    "jwks_uri": format!("{}/jwks", issuer),
                    "id_token_signing_alg_values_supported": ["RS256"],
                })
                .to_string(),
            )
            .create_async()
            .await;
        let jwks = server
            .mock("GET", "/jwks")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"keys":[{"kty":"RSA","alg":"RS256","use":"sig","kid":"k1","n":"AQAB","e":"AQAB"}]}"#,
            )
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let provider = Provider::discover(settings(&issuer), &client, client.clone())
            .await
            .unwrap();
        jwks.assert_async().await;
        assert!(provider
            .authorization_url("s", "n")
            .as_str()
            .starts_with(&format!("{}/authorize?", issuer)));
    }

    #[tokio::test]
    async fn exchanges_codes_with_basic_client_authentication() {
        let mut server = mockito::Server::new_async().await;
        let provider = provider_at("https://idp.example", &server.url());
        let id_token = sign(&token_claims("n"));
        let token = server
            .mock("POST", "/token")
            .match_header(
                "authorization",
                Matcher::Regex("^Basic ".to_string()),
            )
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "the-code".into()),
                Matcher::UrlEncoded(
                    "redirect_uri".into(),
                    "https://proxy.example/oauth2/callback/google".into(),
                ),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({ "access_token": "at", "token_type": "Bearer", "id_token": id_token })
                    .to_string(),
            )
            .create_async()
            .await;

        let response = provider.exchange_code("the-code").await.unwrap();
        token.assert_async().await;
        assert_eq!(response.access_token, "at");
        assert_eq!(response.id_token.as_deref(), Some(id_token.as_str()));
    }

    #[tokio::test]
    async fn token_endpoint_errors_are_reported() {
        let mut server = mockito::Server::new_async().await;
        let provider = provider_at("https://idp.example", &server.url());
        let _token = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        match provider.exchange_code("stale").await {
            Err(OidcError::TokenEndpoint { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn user_info_must_describe_the_same_subject() {
        let mut server = mockito::Server::new_async().await;
        let provider = provider_at("https://idp.example", &server.url());
        let _userinfo = server
            .mock("GET", "/userinfo")
            .match_header("authorization", "Bearer at")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "sub": "user-42", "name": "Jane Doe" }).to_string())
            .create_async()
            .await;

        let claims = provider.user_info("at", "user-42").await.unwrap();
        assert_eq!(claims.name.as_deref(), Some("Jane Doe"));

        let err = provider.user_info("at", "user-7").await.unwrap_err();
        assert!(matches!(err, OidcError::SubjectMismatch { .. }));
    }
}
