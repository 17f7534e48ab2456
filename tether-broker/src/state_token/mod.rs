//! Signed continuation state for the consent round-trip.
//!
//! The consent URL carries an HMAC-tagged envelope so the callback can be
//! validated without server-side session storage surviving the browser
//! redirect. Wire format: `base64url(json payload) "." base64url(tag)`,
//! both halves unpadded.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Envelopes older than this are rejected, matching the pending-connection
/// lifetime.
pub const STATE_LIFETIME_SECS: i64 = 600;

const TAG_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("malformed state envelope")]
    Malformed,
    #[error("state signature mismatch")]
    BadSignature,
    #[error("state expired")]
    Expired,
}

/// The minimum context needed to resume a handshake at callback time.
/// `nonce` doubles as the connection id and, for OIDC flows, the ID token
/// nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    pub workspace_id: String,
    pub provider_id: String,
    pub nonce: String,
    pub iat: DateTime<Utc>,
}

/// Signs and verifies state envelopes with a fixed 32-byte HMAC key.
pub struct StateCodec {
    key: [u8; 32],
}

impl StateCodec {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn sign(&self, payload: &StatePayload) -> String {
        let json = serde_json::to_vec(payload).unwrap();
        let mut mac = HmacSha256::new_from_slice(&self.key).unwrap();
        mac.update(&json);
        let tag = mac.finalize().into_bytes();
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&json),
            URL_SAFE_NO_PAD.encode(tag)
        )
    }

    /// The tag is compared in constant time; the payload is only parsed
    /// after the signature checks out.
    pub fn verify(&self, envelope: &str) -> Result<StatePayload, StateError> {
        let mut parts = envelope.split('.');
        let (payload_b64, tag_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(p), Some(t), None) => (p, t),
            _ => return Err(StateError::Malformed),
        };

        let json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| StateError::Malformed)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| StateError::Malformed)?;
        if tag.len() != TAG_LEN {
            return Err(StateError::Malformed);
        }

        let mut mac = HmacSha256::new_from_slice(&self.key).unwrap();
        mac.update(&json);
        mac.verify_slice(&tag)
            .map_err(|_| StateError::BadSignature)?;

        let payload: StatePayload =
            serde_json::from_slice(&json).map_err(|_| StateError::Malformed)?;

        if Utc::now() - payload.iat > Duration::seconds(STATE_LIFETIME_SECS) {
            return Err(StateError::Expired);
        }

        Ok(payload)
    }
}
