//! ID token verification against the provider's published keys.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Header, Validation};
use log::info;
use serde::Deserialize;
use url::Url;

use super::error::OidcError;
use crate::claims::Claims;

/// A verified ID token.
#[derive(Debug, Clone)]
pub struct IdToken {
    pub subject: String,
    /// Unix seconds.
    pub expires_at: i64,
    pub nonce: Option<String>,
    pub claims: Claims,
}

impl IdToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now().timestamp()
    }
}

/// `iss` and `aud` are checked by `Validation` and not kept.
#[derive(Deserialize)]
struct IdTokenClaims {
    sub: String,
    exp: f64,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(flatten)]
    profile: Claims,
}

pub fn is_symmetric(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

pub async fn fetch_jwks(http: &reqwest::Client, jwks_uri: &Url) -> Result<JwkSet, OidcError> {
    let keys = http
        .get(jwks_uri.clone())
        .send()
        .await?
        .error_for_status()?
        .json::<JwkSet>()
        .await?;
    Ok(keys)
}

/// Checks signature, issuer, audience and expiry of ID tokens for one client.
///
/// HMAC-signed tokens are verified with the client secret, everything else with the
/// matching key of the provider's JWKS. A `kid` missing from the cached key set
/// triggers one refresh of the set.
pub struct IdTokenVerifier {
    issuer: String,
    client_id: String,
    client_secret: String,
    algorithms: Vec<Algorithm>,
    keys: ArcSwap<JwkSet>,
    jwks_uri: Option<Url>,
    http: reqwest::Client,
}

impl IdTokenVerifier {
    pub fn new(
        issuer: String,
        client_id: String,
        client_secret: String,
        algorithms: Vec<Algorithm>,
        keys: JwkSet,
        jwks_uri: Option<Url>,
        http: reqwest::Client,
    ) -> Self {
        IdTokenVerifier {
            issuer,
            client_id,
            client_secret,
            algorithms,
            keys: ArcSwap::from_pointee(keys),
            jwks_uri,
            http,
        }
    }

    pub async fn verify(&self, raw: &str) -> Result<IdToken, OidcError> {
        let header = decode_header(raw)?;
        if !self.algorithms.contains(&header.alg) {
            return Err(OidcError::InvalidToken(format!(
                "signing algorithm {:?} is not accepted",
                header.alg
            )));
        }
        let key = self.decoding_key(&header).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.client_id]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let claims = decode::<IdTokenClaims>(raw, &key, &validation)?.claims;
        let mut profile = claims.profile;
        profile.sub = Some(claims.sub.clone());
        Ok(IdToken {
            subject: claims.sub,
            expires_at: claims.exp as i64,
            nonce: claims.nonce,
            claims: profile,
        })
    }

    async fn decoding_key(&self, header: &Header) -> Result<DecodingKey, OidcError> {
        if is_symmetric(header.alg) {
            return Ok(DecodingKey::from_secret(self.client_secret.as_bytes()));
        }
        if let Some(key) = self.find_key(header)? {
            return Ok(key);
        }
        if let Some(jwks_uri) = &self.jwks_uri {
            info!(
                "Signing key {:?} not cached for issuer {}, refreshing key set",
                header.kid, self.issuer
            );
            let keys = fetch_jwks(&self.http, jwks_uri).await?;
            self.keys.store(Arc::new(keys));
        }
        self.find_key(header)?.ok_or_else(|| {
            OidcError::InvalidToken(format!("no signing key matches kid {:?}", header.kid))
        })
    }

    fn find_key(&self, header: &Header) -> Result<Option<DecodingKey>, OidcError> {
        let keys = self.keys.load();
        let jwk = match header.kid.as_deref() {
            Some(kid) => keys.find(kid),
            // Without a kid only an unambiguous key set can be used.
            None if keys.keys.len() == 1 => keys.keys.first(),
            None => None,
        };
        Ok(jwk.map(DecodingKey::from_jwk).transpose()?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey};
    use serde_json::{json, Value};

    pub(crate) const ISSUER: &str = "https://idp.example";
    pub(crate) const CLIENT_ID: &str = "gateway-client";
    pub(crate) const CLIENT_SECRET: &str = "gateway-client-secret-with-enough-bytes";

    pub(crate) fn sign(claims: &Value) -> String {
        encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(CLIENT_SECRET.as_bytes()),
        )
        .unwrap()
    }

    pub(crate) fn token_claims(nonce: &str) -> Value {
        json!({
            "iss": ISSUER,
            "sub": "user-42",
            "aud": CLIENT_ID,
            "exp": Utc::now().timestamp() + 600,
            "iat": Utc::now().timestamp(),
            "nonce": nonce,
            "email": "jane@example.com",
            "email_verified": true,
        })
    }

    pub(crate) fn hmac_verifier() -> IdTokenVerifier {
        IdTokenVerifier::new(
            ISSUER.to_string(),
            CLIENT_ID.to_string(),
            CLIENT_SECRET.to_string(),
            vec![Algorithm::RS256, Algorithm::HS256],
            JwkSet { keys: Vec::new() },
            None,
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn accepts_a_well_formed_token() {
        let raw = sign(&token_claims("n-1"));
        let token = hmac_verifier().verify(&raw).await.unwrap();
        assert_eq!(token.subject, "user-42");
        assert_eq!(token.nonce.as_deref(), Some("n-1"));
        assert_eq!(token.claims.sub.as_deref(), Some("user-42"));
        assert_eq!(token.claims.email_verified, Some(true));
        assert!(!token.is_expired());
    }

    #[tokio::test]
    async fn rejects_foreign_issuer_and_audience() {
        let verifier = hmac_verifier();

        let mut wrong_issuer = token_claims("n");
        wrong_issuer["iss"] = json!("https://evil.example");
        assert!(verifier.verify(&sign(&wrong_issuer)).await.is_err());

        let mut wrong_audience = token_claims("n");
        wrong_audience["aud"] = json!(["someone-else"]);
        assert!(verifier.verify(&sign(&wrong_audience)).await.is_err());
    }

    #[tokio::test]
    async fn rejects_expired_tokens() {
        let mut claims = token_claims("n");
        claims["exp"] = json!(Utc::now().timestamp() - 3600);
        assert!(hmac_verifier().verify(&sign(&claims)).await.is_err());
    }

    #[tokio::test]
    async fn rejects_tampered_signatures() {
        let raw = sign(&token_claims("n"));
        let forged = encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &token_claims("n"),
            &EncodingKey::from_secret(b"not-the-client-secret-at-all-nope"),
        )
        .unwrap();
        assert!(hmac_verifier().verify(&raw).await.is_ok());
        assert!(hmac_verifier().verify(&forged).await.is_err());
    }

    #[tokio::test]
    async fn rejects_algorithms_the_provider_does_not_advertise() {
        let verifier = IdTokenVerifier::new(
            ISSUER.to_string(),
            CLIENT_ID.to_string(),
            CLIENT_SECRET.to_string(),
            vec![Algorithm::RS256],
            JwkSet { keys: Vec::new() },
            None,
            reqwest::Client::new(),
        );
        let err = verifier.verify(&sign(&token_claims("n"))).await.unwrap_err();
        assert!(matches!(err, OidcError::InvalidToken(_)));
    }

    fn sign_rs256(kid: &str, claims: &Value) -> String {
        let mut header = jsonwebtoken::Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        let key = EncodingKey::from_rsa_pem(include_bytes!("testdata/rsa_signing_key.pem"))
            .unwrap();
        encode(&header, claims, &key).unwrap()
    }

    #[tokio::test]
    async fn rotated_keys_are_fetched_once() {
        let mut server = mockito::Server::new_async().await;
        let jwks = server
            .mock("GET", "/jwks")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(include_str!("testdata/rsa_signing_jwks.json"))
            .expect(2)
            .create_async()
            .await;
        let verifier = IdTokenVerifier::new(
            ISSUER.to_string(),
            CLIENT_ID.to_string(),
            CLIENT_SECRET.to_string(),
            vec![Algorithm::RS256],
            JwkSet { keys: Vec::new() },
            Some(Url::parse(&format!("{}/jwks", server.url())).unwrap()),
            reqwest::Client::new(),
        );

        // Not cached yet: one refresh, then served from the cache.
        let token = verifier
            .verify(&sign_rs256("k1", &token_claims("n-1")))
            .await
            .unwrap();
        assert_eq!(token.subject, "user-42");
        assert_eq!(token.nonce.as_deref(), Some("n-1"));
        verifier
            .verify(&sign_rs256("k1", &token_claims("n-2")))
            .await
            .unwrap();

        // A kid the provider never published refreshes once more and still fails.
        let err = verifier
            .verify(&sign_rs256("k2", &token_claims("n-3")))
            .await
            .unwrap_err();
        assert!(matches!(err, OidcError::InvalidToken(_)));
        jwks.assert_async().await;
    }

    #[tokio::test]
    async fn unknown_kid_without_key_set_is_rejected() {
        let mut header = jsonwebtoken::Header::new(Algorithm::RS256);
        header.kid = Some("rotated".to_string());
        // Only the header is inspected before the key lookup fails.
        let raw = format!(
            "{}.e30.c2ln",
            base64::Engine::encode(
                &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                serde_json::to_vec(&header).unwrap()
            )
        );
        let err = hmac_verifier().verify(&raw).await.unwrap_err();
        assert!(matches!(err, OidcError::InvalidToken(_)));
    }
}
