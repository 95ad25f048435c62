//! Shared-secret helpers: HMAC signing of oracle requests and constant-time
//! token comparison for operator endpoints.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 of `body` under `secret`, hex-encoded.
pub fn sign_body(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    alloy::hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison that leaks neither content nor length.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_matches_rfc4231_vector() {
        assert_eq!(
            sign_body(b"Jefe", b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_signature_bound_to_secret_and_body() {
        let sig = sign_body(b"secret-1", b"body");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, sign_body(b"secret-1", b"body"));
        assert_ne!(sig, sign_body(b"secret-2", b"body"));
        assert_ne!(sig, sign_body(b"secret-1", b"tampered"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"other"));
        assert!(!constant_time_eq(b"", b"token"));
    }
}
