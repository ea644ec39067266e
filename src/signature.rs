// signature.rs
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Lowercase hex HMAC-SHA256 of `body` under `secret`. HMAC takes keys of any
/// length, so this is `None` only if the MAC rejects the key outright.
pub fn sign(secret: &[u8], body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Checks `provided_hex` against the HMAC-SHA256 of the raw body bytes.
///
/// Returns `false` for an empty secret, an empty or non-hex signature, or a
/// length mismatch. Only the length check may short-circuit; the digest itself
/// is compared in constant time.
pub fn verify(secret: &[u8], raw_body: &[u8], provided_hex: &str) -> bool {
    if secret.is_empty() || provided_hex.is_empty() {
        return false;
    }

    if !provided_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return false;
    }

    let Some(expected) = sign(secret, raw_body) else {
        return false;
    };
    let expected = expected.as_bytes();
    let provided = provided_hex.as_bytes();

    if expected.len() != provided.len() {
        return false;
    }

    expected.ct_eq(provided).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"k";
    const BODY: &[u8] = br#"{"session_id":"abc","status":"ok"}"#;

    #[test]
    fn sign_matches_known_digest() {
        assert_eq!(
            sign(b"key", b"The quick brown fox jumps over the lazy dog").as_deref(),
            Some("f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8")
        );
        assert!(sign(b"", b"body").is_some());
    }

    #[test]
    fn accepts_matching_signature() {
        let signature = sign(SECRET, BODY).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verify(SECRET, BODY, &signature));
    }

    #[test]
    fn rejects_any_flipped_body_byte() {
        let signature = sign(SECRET, BODY).unwrap();
        for i in 0..BODY.len() {
            let mut tampered = BODY.to_vec();
            tampered[i] ^= 0x01;
            assert!(!verify(SECRET, &tampered, &signature), "byte {i}");
        }
    }

    #[test]
    fn rejects_any_flipped_signature_byte() {
        let signature = sign(SECRET, BODY).unwrap();
        for i in 0..signature.len() {
            let mut tampered = signature.clone().into_bytes();
            tampered[i] ^= 0x01;
            let tampered = String::from_utf8(tampered).unwrap();
            assert!(!verify(SECRET, BODY, &tampered), "byte {i}");
        }
    }

    #[test]
    fn rejects_reversed_signature() {
        let reversed: String = sign(SECRET, BODY).unwrap().chars().rev().collect();
        assert!(!verify(SECRET, BODY, &reversed));
    }

    #[test]
    fn rejects_malformed_input() {
        let signature = sign(SECRET, BODY).unwrap();
        assert!(!verify(b"", BODY, &signature));
        assert!(!verify(SECRET, BODY, ""));
        assert!(!verify(SECRET, BODY, &signature[..63]));
        assert!(!verify(SECRET, BODY, &format!("{signature}00")));
        assert!(!verify(SECRET, BODY, &"z".repeat(64)));
        assert!(!verify(SECRET, BODY, &format!("sha256={signature}")));
    }

    #[test]
    fn uppercase_hex_does_not_match() {
        let signature = sign(SECRET, BODY).unwrap().to_uppercase();
        assert!(!verify(SECRET, BODY, &signature));
    }

    #[test]
    fn different_secret_does_not_verify() {
        let signature = sign(b"other", BODY).unwrap();
        assert!(!verify(SECRET, BODY, &signature));
    }
}
