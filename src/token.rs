use crate::types::*;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Tokens are opaque to clients: a base64url JSON payload plus a keyed
// digest, signed with the server secret salted by a stable machine
// identifier. Rotating either the secret or the machine invalidates every
// outstanding token.

/// Claims carried by a user bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserClaims {
    pub uid: Uid,
    pub nickname: String,
    pub client_ip: String,
    pub issued_at: EpochMillis,
    pub expires_at: EpochMillis,
    /// The user's credentials version at mint time. A password change
    /// bumps the stored version, orphaning this claim.
    pub credentials_version: i64,
}

/// Claims carried by a share token. The grant maps resource kind
/// ("note" | "file") to the row ids it covers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShareClaims {
    pub share_id: String,
    pub uid: Uid,
    pub resources: HashMap<String, Vec<i64>>,
    pub expires_at: EpochMillis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TokenClaims {
    User(UserClaims),
    Share(ShareClaims),
}

impl TokenClaims {
    pub fn expires_at(&self) -> EpochMillis {
        match self {
            TokenClaims::User(claims) => claims.expires_at,
            TokenClaims::Share(claims) => claims.expires_at,
        }
    }
}

/// Issue/verify seam so the hub never learns how tokens are built.
pub trait TokenCodec: Send + Sync {
    fn issue(&self, claims: &TokenClaims) -> SyncResult<String>;
    fn verify(&self, token: &str) -> SyncResult<TokenClaims>;
}

pub struct SignedTokenCodec {
    signing_key: String,
}

impl SignedTokenCodec {
    pub fn new(secret: &str, machine_id: &str) -> SignedTokenCodec {
        SignedTokenCodec {
            signing_key: format!("{:x}", md5::compute(format!("{}:{}", secret, machine_id))),
        }
    }

    fn sign(&self, payload: &str) -> String {
        format!("{:x}", md5::compute(format!("{}.{}", self.signing_key, payload)))
    }
}

impl TokenCodec for SignedTokenCodec {
    fn issue(&self, claims: &TokenClaims) -> SyncResult<String> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signature = self.sign(&payload);
        Ok(format!("{}.{}", payload, signature))
    }

    fn verify(&self, token: &str) -> SyncResult<TokenClaims> {
        let (payload, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| SyncError::UnauthorizedToken("malformed token".to_string()))?;
        if self.sign(payload) != signature {
            return Err(SyncError::UnauthorizedToken("bad signature".to_string()));
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| SyncError::UnauthorizedToken("bad encoding".to_string()))?;
        let claims: TokenClaims = serde_json::from_slice(&bytes)
            .map_err(|_| SyncError::UnauthorizedToken("bad payload".to_string()))?;
        if claims.expires_at() < now_millis() {
            return Err(SyncError::UnauthorizedToken("expired".to_string()));
        }
        Ok(claims)
    }
}

/// Salted digest used for stored credentials. Kept next to the codec so
/// all credential hashing shares one salt scheme.
pub fn password_hash(secret: &str, password: &str) -> String {
    format!("{:x}", md5::compute(format!("{}:{}", secret, password)))
}
