//! Unguessable tokens for session ids, OAuth2 `state` and OIDC `nonce`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::TryRngCore;

use crate::error::GatewayError;

/// 128 bits of entropy per token.
pub const TOKEN_BYTES: usize = 16;

/// Length of an encoded token: 16 bytes in unpadded URL-safe base64.
pub const TOKEN_LEN: usize = 22;

pub fn random_token() -> Result<String, GatewayError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| GatewayError::internal(format!("failed to read system randomness: {}", e)))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Whether `value` has the shape of a token produced by [`random_token`].
pub fn is_token(value: &str) -> bool {
    value.len() == TOKEN_LEN
        && URL_SAFE_NO_PAD
            .decode(value)
            .map(|bytes| bytes.len() == TOKEN_BYTES)
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_are_url_safe_and_fixed_length() {
        let token = random_token().unwrap();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(is_token(&token));
    }

    #[test]
    fn tokens_do_not_repeat() {
        let tokens: HashSet<String> = (0..256).map(|_| random_token().unwrap()).collect();
        assert_eq!(tokens.len(), 256);
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(!is_token(""));
        assert!(!is_token("short"));
        assert!(!is_token("!!!!!!!!!!!!!!!!!!!!!!"));
        assert!(!is_token("AAAAAAAAAAAAAAAAAAAAAAAA"));
    }
}
