//! Websocket access tokens.
//!
//! Tokens are issued by the panel as HS256-signed JWTs and carry the server
//! they grant access to plus a flat list of permission strings. The signing
//! key is built once from the node secret at startup and shared by handle.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Allowed disagreement between the issuer's clock and ours.
pub const CLOCK_DRIFT_TOLERANCE_SECS: i64 = 15;

pub const PERMISSION_CONNECT: &str = "connect";
pub const PERMISSION_SEND_COMMAND: &str = "send-command";
pub const PERMISSION_SEND_POWER: &str = "send-power";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token is not valid yet")]
    ClockSkew,

    #[error("token has expired")]
    Expired,

    #[error("token is missing the connect permission")]
    Unauthorized,

    #[error("token was issued for a different server")]
    ServerMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    Numeric(u64),
    Text(String),
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserId::Numeric(id) => write!(f, "{}", id),
            UserId::Text(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct TokenHeader {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Decoded claim set of a verified token. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    #[serde(rename = "nbf")]
    pub not_before: i64,
    #[serde(rename = "exp")]
    pub expires_at: i64,
    #[serde(rename = "iat", default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,
    pub user_id: UserId,
    pub server_uuid: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl TokenPayload {
    /// Exact membership test, no wildcards.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    /// Re-checks a token that is already bound to a connection.
    ///
    /// Only expiry, the connect permission and the bound server are looked at;
    /// `nbf` is checked once when the token is first parsed and not again here.
    pub fn is_currently_valid(&self, server_uuid: &str) -> Result<(), AuthError> {
        self.is_currently_valid_at(server_uuid, chrono::Utc::now().timestamp())
    }

    pub fn is_currently_valid_at(&self, server_uuid: &str, now: i64) -> Result<(), AuthError> {
        if now - self.expires_at > CLOCK_DRIFT_TOLERANCE_SECS {
            return Err(AuthError::Expired);
        }

        if !self.has_permission(PERMISSION_CONNECT) {
            return Err(AuthError::Unauthorized);
        }

        if self.server_uuid != server_uuid {
            return Err(AuthError::ServerMismatch);
        }

        Ok(())
    }
}

/// HMAC key derived from the node secret.
#[derive(Clone)]
pub struct TokenKey {
    secret: Arc<[u8]>,
}

impl fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenKey")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl TokenKey {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
        }
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| AuthError::Malformed("unusable signing key".to_string()))
    }

    /// Verifies the signature of a raw token and validates its time window and
    /// base permission.
    ///
    /// This does not check which server the token was issued for; that happens
    /// in [`TokenPayload::is_currently_valid`] once a connection is bound.
    pub fn parse_and_verify(&self, raw: &str) -> Result<TokenPayload, AuthError> {
        self.parse_and_verify_at(raw, chrono::Utc::now().timestamp())
    }

    pub fn parse_and_verify_at(&self, raw: &str, now: i64) -> Result<TokenPayload, AuthError> {
        let parts: Vec<&str> = raw.trim().split('.').collect();
        let [header_segment, claims_segment, signature_segment] = parts.as_slice() else {
            return Err(AuthError::Malformed("expected three segments".to_string()));
        };

        let header: TokenHeader = decode_segment(header_segment)?;
        if header.alg != "HS256" {
            return Err(AuthError::InvalidSignature);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_segment)
            .map_err(|_| AuthError::InvalidSignature)?;
        let mut mac = self.mac()?;
        mac.update(header_segment.as_bytes());
        mac.update(b".");
        mac.update(claims_segment.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let payload: TokenPayload = decode_segment(claims_segment)?;

        if now - payload.not_before < -CLOCK_DRIFT_TOLERANCE_SECS {
            return Err(AuthError::ClockSkew);
        }

        if now - payload.expires_at > CLOCK_DRIFT_TOLERANCE_SECS {
            return Err(AuthError::Expired);
        }

        if !payload.has_permission(PERMISSION_CONNECT) {
            return Err(AuthError::Unauthorized);
        }

        Ok(payload)
    }

    #[cfg(test)]
    pub fn sign(&self, payload: &TokenPayload) -> String {
        let header = TokenHeader {
            alg: "HS256".to_string(),
            typ: Some("JWT".to_string()),
        };
        let signed = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).unwrap()),
        );
        let mut mac = self.mac().unwrap();
        mac.update(signed.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{}.{}", signed, signature)
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::Malformed(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| AuthError::Malformed(e.to_string()))
}
