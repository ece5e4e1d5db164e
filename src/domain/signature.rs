use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Verifies the vendor webhook signature over the raw request bytes.
///
/// The header carries `sha1=<hex digest>`. Verification must run on the raw
/// bytes before any JSON parsing, since parse/re-serialize round trips are
/// not byte-identical.
pub fn verify_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    let Some(digest_hex) = signature_header.strip_prefix("sha1=") else {
        return false;
    };

    let Ok(digest) = hex::decode(digest_hex) else {
        return false;
    };

    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return false;
    };

    mac.update(payload);
    mac.verify_slice(&digest).is_ok()
}

/// Produces the `sha1=<hex>` header value for a payload.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    // Hmac accepts keys of any length, so this cannot fail.
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::{sign, verify_signature};

    #[test]
    fn accepts_matching_signature() {
        let header = sign("webhook-secret", b"{\"event\":\"system:heartbeat\"}");
        assert!(verify_signature(
            "webhook-secret",
            b"{\"event\":\"system:heartbeat\"}",
            &header,
        ));
    }

    #[test]
    fn rejects_tampered_payload() {
        let header = sign("webhook-secret", b"{\"event\":\"system:heartbeat\"}");
        assert!(!verify_signature(
            "webhook-secret",
            b"{\"event\":\"user:vehicle:updated\"}",
            &header,
        ));
    }

    #[test]
    fn rejects_wrong_secret() {
        let header = sign("webhook-secret", b"payload");
        assert!(!verify_signature("other-secret", b"payload", &header));
    }

    #[test]
    fn rejects_missing_prefix_and_bad_hex() {
        assert!(!verify_signature("secret", b"payload", "deadbeef"));
        assert!(!verify_signature("secret", b"payload", "sha1=not-hex"));
        assert!(!verify_signature("secret", b"payload", ""));
    }
}
