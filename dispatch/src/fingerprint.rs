//! Fingerprints used as cache and de-duplication keys.

use sha2::{Digest, Sha256};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Payloads up to this size are hashed inline with the structural hasher.
/// Larger payloads are digested off the hot path on the blocking pool.
const INLINE_HASH_LIMIT: usize = 8 * 1024;

/// Fingerprint of an outbound request, keyed by destination and payload.
pub async fn request_fingerprint(destination: &str, payload: &str) -> String {
    if payload.len() <= INLINE_HASH_LIMIT {
        return inline_fingerprint(destination, payload);
    }

    let owned_destination = destination.to_string();
    let owned_payload = payload.to_string();
    let digest = tokio::task::spawn_blocking(move || {
        sha256_hex(&[
            owned_destination.as_bytes(),
            b"\0",
            owned_payload.as_bytes(),
        ])
    })
    .await;

    match digest {
        Ok(digest) => digest,
        Err(err) => {
            tracing::warn!(error = %err, "fingerprint worker failed, hashing inline");
            inline_fingerprint(destination, payload)
        }
    }
}

/// Fingerprint of a captured error. An explicit signature from the capture
/// layer wins; otherwise message and stack are digested.
pub fn error_fingerprint(message: &str, stack: &str, signature: Option<&str>) -> String {
    if let Some(signature) = signature
        && !signature.is_empty()
    {
        return signature.to_string();
    }
    sha256_hex(&[message.as_bytes(), b"\n", stack.as_bytes()])
}

fn inline_fingerprint(destination: &str, payload: &str) -> String {
    let mut hasher = DefaultHasher::new();
    destination.hash(&mut hasher);
    payload.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_fingerprint_is_deterministic() {
        let a = request_fingerprint("provider", "payload").await;
        let b = request_fingerprint("provider", "payload").await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_request_fingerprint_varies_by_destination_and_payload() {
        let base = request_fingerprint("provider", "payload").await;
        assert_ne!(base, request_fingerprint("other", "payload").await);
        assert_ne!(base, request_fingerprint("provider", "other").await);
    }

    #[tokio::test]
    async fn test_large_payload_uses_digest() {
        let payload = "x".repeat(INLINE_HASH_LIMIT + 1);
        let fingerprint = request_fingerprint("provider", &payload).await;

        // SHA-256 hex is 64 chars; the inline hash is 16
        assert_eq!(fingerprint.len(), 64);
        assert_eq!(fingerprint, request_fingerprint("provider", &payload).await);
    }

    #[test]
    fn test_error_fingerprint_prefers_signature() {
        let with_signature = error_fingerprint("boom", "at main", Some("sig-1"));
        assert_eq!(with_signature, "sig-1");

        let empty_signature = error_fingerprint("boom", "at main", Some(""));
        let no_signature = error_fingerprint("boom", "at main", None);
        assert_eq!(empty_signature, no_signature);
        assert_eq!(no_signature.len(), 64);
    }

    #[test]
    fn test_error_fingerprint_varies_by_stack() {
        let a = error_fingerprint("boom", "at main", None);
        let b = error_fingerprint("boom", "at worker", None);
        assert_ne!(a, b);
    }
}
