//! Bearer-token authentication for the session handshake.
//!
//! Tokens are `base64url(payload_json) + "." + base64url(hmac_sha256(payload))`
//! signed with the server secret. The payload names the player id, the
//! username, and an expiry. Login endpoints that mint tokens live outside
//! this process; the mint half is here so the handshake has a testable
//! counterpart and ops tooling can issue tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use gridvale_protocol::PlayerId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use gridvale_store::state::unix_now;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// Claims carried inside a token.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct TokenClaims {
    pub sub: PlayerId,
    pub username: String,
    /// Unix seconds after which the token is rejected.
    pub exp: f64,
}

pub struct TokenKey {
    mac: HmacSha256,
}

impl TokenKey {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            mac: HmacSha256::new_from_slice(secret).expect("hmac accepts any key length"),
        }
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    /// Issues a token valid for `ttl_secs`.
    pub fn issue(&self, player: PlayerId, username: &str, ttl_secs: f64) -> String {
        let claims = TokenClaims {
            sub: player,
            username: username.to_owned(),
            exp: unix_now() + ttl_secs,
        };
        let payload = serde_json::to_vec(&claims).expect("claims serialize");
        let signature = self.sign(&payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature)
        )
    }

    /// Verifies signature and expiry and returns the claims.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let (payload_b64, signature_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac.clone();
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
        if claims.exp <= unix_now() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}
