//! User bearer tokens.
//!
//! A token binds a user id to this directory's secret:
//!
//! ```text
//! <user id>.<hex HMAC-SHA256(secret, user id)>
//! ```
//!
//! The signature is the last `.`-separated segment, so user ids may
//! themselves contain dots.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt::Write;

type HmacSha256 = Hmac<Sha256>;

/// Issues and checks user bearer tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Vec<u8>,
}

impl TokenIssuer {
    /// Creates an issuer signing with `secret`.
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Mints the token a backend would hand to `user_id`.
    pub fn token_for(&self, user_id: &str) -> String {
        format!("{user_id}.{}", self.sign(user_id))
    }

    /// Checks a token and returns the user it was minted for.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotAuthorized`] for malformed or forged tokens.
    pub fn verify(&self, token: &str) -> ServerResult<String> {
        let (user_id, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| ServerError::NotAuthorized("malformed token".into()))?;
        if user_id.is_empty() {
            return Err(ServerError::NotAuthorized("token names no user".into()));
        }
        if self.sign(user_id) != signature {
            return Err(ServerError::NotAuthorized("invalid signature".into()));
        }
        Ok(user_id.to_string())
    }

    fn sign(&self, user_id: &str) -> String {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            // HMAC accepts keys of any length.
            return String::new();
        };
        mac.update(user_id.as_bytes());
        let digest = mac.finalize().into_bytes();

        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(b"test-secret".to_vec())
    }

    #[test]
    fn issued_tokens_verify() {
        let issuer = issuer();
        let token = issuer.token_for("alice");
        assert_eq!(issuer.verify(&token).unwrap(), "alice");
    }

    #[test]
    fn user_ids_may_contain_dots() {
        let issuer = issuer();
        let token = issuer.token_for("alice.smith@example.com");
        assert_eq!(issuer.verify(&token).unwrap(), "alice.smith@example.com");
    }

    #[test]
    fn reject_tampered_token() {
        let issuer = issuer();
        let token = issuer.token_for("alice").replacen("alice", "bob", 1);
        assert!(matches!(
            issuer.verify(&token),
            Err(ServerError::NotAuthorized(_))
        ));
    }

    #[test]
    fn reject_foreign_secret() {
        let token = TokenIssuer::new(b"other".to_vec()).token_for("alice");
        assert!(issuer().verify(&token).is_err());
        assert!(issuer().verify("no-signature").is_err());
        assert!(issuer().verify(".abc").is_err());
    }
}
