//! Principal verification — the one seam this runtime has into an
//! external identity provider. The runtime requires only that *some* principal be
//! attached to a connection before any non-`ping` frame is processed; how that principal
//! is derived is pluggable. `AnonymousVerifier` is the default. `Ed25519HeaderVerifier` is
//! provided as the one concrete pluggable implementation, verifying an inbound signed
//! header with `ed25519-dalek` against a narrow "verified session identifier on the
//! socket" contract.

use axum::http::HeaderMap;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::error::RuntimeError;

/// The verified (or anonymous) identity attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    Anonymous,
    Verified(String),
}

impl Principal {
    pub fn as_str(&self) -> &str {
        match self {
            Principal::Anonymous => "anonymous",
            Principal::Verified(id) => id,
        }
    }
}

pub trait PrincipalVerifier: Send + Sync {
    /// Derive a principal from the WebSocket upgrade request headers.
    /// Returning `Err` rejects the upgrade with `UNAUTHORIZED`.
    fn verify(&self, headers: &HeaderMap) -> Result<Principal, RuntimeError>;
}

/// Default verifier: every connection is `anonymous`.
pub struct AnonymousVerifier;

impl PrincipalVerifier for AnonymousVerifier {
    fn verify(&self, _headers: &HeaderMap) -> Result<Principal, RuntimeError> {
        Ok(Principal::Anonymous)
    }
}

/// Verifies `x-live-pubkey` / `x-live-timestamp` / `x-live-signature`
/// headers: the signature must cover the timestamp bytes and the
/// timestamp must fall within a small skew window, guarding against
/// replay of a captured header set.
pub struct Ed25519HeaderVerifier {
    pub max_skew_ms: i64,
}

impl Default for Ed25519HeaderVerifier {
    fn default() -> Self {
        Self { max_skew_ms: 30_000 }
    }
}

impl PrincipalVerifier for Ed25519HeaderVerifier {
    fn verify(&self, headers: &HeaderMap) -> Result<Principal, RuntimeError> {
        let pubkey_hdr = header_str(headers, "x-live-pubkey")?;
        let timestamp_hdr = header_str(headers, "x-live-timestamp")?;
        let signature_hdr = header_str(headers, "x-live-signature")?;

        let b64 = pubkey_hdr
            .strip_prefix("ed25519:")
            .ok_or(RuntimeError::Unauthorized)?;
        let pubkey_bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|_| RuntimeError::Unauthorized)?;
        let pubkey_array: [u8; 32] = pubkey_bytes
            .try_into()
            .map_err(|_| RuntimeError::Unauthorized)?;
        let verifying_key =
            VerifyingKey::from_bytes(&pubkey_array).map_err(|_| RuntimeError::Unauthorized)?;

        let sig_bytes = base64::engine::general_purpose::STANDARD
            .decode(signature_hdr)
            .map_err(|_| RuntimeError::Unauthorized)?;
        let sig_array: [u8; 64] = sig_bytes.try_into().map_err(|_| RuntimeError::Unauthorized)?;
        let signature = Signature::from_bytes(&sig_array);

        verifying_key
            .verify(timestamp_hdr.as_bytes(), &signature)
            .map_err(|_| RuntimeError::Unauthorized)?;

        let timestamp: i64 = timestamp_hdr.parse().map_err(|_| RuntimeError::Unauthorized)?;
        let now = chrono::Utc::now().timestamp_millis();
        if (now - timestamp).abs() > self.max_skew_ms {
            return Err(RuntimeError::Unauthorized);
        }

        Ok(Principal::Verified(pubkey_hdr.to_string()))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, RuntimeError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(RuntimeError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use ed25519_dalek::{Signer, SigningKey};

    fn signed_headers(skew_ms: i64) -> HeaderMap {
        let mut rng = rand::thread_rng();
        let signing_key = SigningKey::generate(&mut rng);
        let timestamp = (chrono::Utc::now().timestamp_millis() - skew_ms).to_string();
        let signature = signing_key.sign(timestamp.as_bytes());

        let pubkey_b64 = base64::engine::general_purpose::STANDARD
            .encode(signing_key.verifying_key().to_bytes());
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-live-pubkey",
            HeaderValue::from_str(&format!("ed25519:{pubkey_b64}")).unwrap(),
        );
        headers.insert("x-live-timestamp", HeaderValue::from_str(&timestamp).unwrap());
        headers.insert("x-live-signature", HeaderValue::from_str(&sig_b64).unwrap());
        headers
    }

    #[test]
    fn anonymous_verifier_always_succeeds() {
        let headers = HeaderMap::new();
        assert_eq!(AnonymousVerifier.verify(&headers).unwrap(), Principal::Anonymous);
    }

    #[test]
    fn ed25519_verifier_accepts_fresh_valid_signature() {
        let headers = signed_headers(0);
        let verifier = Ed25519HeaderVerifier::default();
        assert!(matches!(verifier.verify(&headers), Ok(Principal::Verified(_))));
    }

    #[test]
    fn ed25519_verifier_rejects_stale_timestamp() {
        let headers = signed_headers(60_000);
        let verifier = Ed25519HeaderVerifier::default();
        assert!(matches!(verifier.verify(&headers), Err(RuntimeError::Unauthorized)));
    }

    #[test]
    fn ed25519_verifier_rejects_missing_headers() {
        let headers = HeaderMap::new();
        let verifier = Ed25519HeaderVerifier::default();
        assert!(verifier.verify(&headers).is_err());
    }
}
