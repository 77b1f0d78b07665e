// Opaque reference generation and webhook body signing.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Hex-encode `n` bytes from the thread CSPRNG.
fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn order_ref() -> String {
    format!("pf_order_{}", random_hex(12))
}

pub fn payment_ref() -> String {
    format!("pf_pay_{}", random_hex(12))
}

pub fn refund_ref() -> String {
    format!("pf_rfnd_{}", random_hex(12))
}

pub fn key_id() -> String {
    format!("pf_key_{}", random_hex(10))
}

pub fn key_secret() -> String {
    format!("pf_sec_{}", random_hex(16))
}

/// Per-merchant webhook signing secret: 32 random bytes, base16.
pub fn webhook_secret() -> String {
    random_hex(32)
}

/// Synthesized idempotency key for clients that did not supply one.
pub fn idempotency_key() -> String {
    format!("auto_{}", random_hex(12))
}

/// Lowercase hex HMAC-SHA256 over the exact body bytes.
pub fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an untrusted signature without early exit on mismatching bytes.
/// This is the check webhook receivers are documented to perform.
#[allow(dead_code)]
pub fn verify_signature(body: &[u8], secret: &str, provided: &str) -> bool {
    let expected = sign(body, secret);
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// SHA-256 fingerprint of an order-create body, used to detect idempotency
/// key reuse with a different payload.
pub fn body_fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_carry_prefix_and_entropy() {
        let r = order_ref();
        assert!(r.starts_with("pf_order_"));
        assert_eq!(r.len(), "pf_order_".len() + 24);
        assert!(r[9..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(order_ref(), order_ref());

        assert!(payment_ref().starts_with("pf_pay_"));
        assert!(refund_ref().starts_with("pf_rfnd_"));
        assert!(key_id().starts_with("pf_key_"));
        assert!(key_secret().starts_with("pf_sec_"));
        // 32 bytes base16
        assert_eq!(webhook_secret().len(), 64);
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let sig = sign(b"{\"event\":\"order.paid\"}", "topsecret");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, sign(b"{\"event\":\"order.paid\"}", "topsecret"));
        assert_ne!(sig, sign(b"{\"event\":\"order.paid\"}", "othersecret"));
        assert!(verify_signature(b"{\"event\":\"order.paid\"}", "topsecret", &sig));
        assert!(!verify_signature(b"{\"event\":\"order.paid\"}", "topsecret", "deadbeef"));
    }

    #[test]
    fn constant_time_eq_handles_lengths() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn fingerprint_distinguishes_field_boundaries() {
        let a = body_fingerprint(&["100", "INR"]);
        let b = body_fingerprint(&["10", "0INR"]);
        assert_ne!(a, b);
        assert_eq!(a, body_fingerprint(&["100", "INR"]));
    }
}
