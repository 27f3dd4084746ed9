// Unverified JWT claim decoding
//
// Display only. Nothing here checks a signature, so the result must never
// be used to decide whether a caller is authenticated.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use std::collections::BTreeSet;

/// Claims projected out of an access token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedClaims {
    pub subject_id: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub roles: BTreeSet<String>,
    /// `exp`, seconds since the Unix epoch
    pub expires_at: Option<i64>,
}

impl DecodedClaims {
    /// Seconds left until `exp`, negative once expired.
    /// Saturates for absurd `exp` values instead of overflowing.
    pub fn seconds_until_expiry(&self, now: i64) -> Option<i64> {
        self.expires_at.map(|exp| exp.saturating_sub(now))
    }
}

#[derive(Deserialize)]
struct RawClaims {
    sub: Option<String>,
    username: Option<String>,
    email: Option<String>,
    #[serde(default)]
    roles: Option<Vec<String>>,
    exp: Option<i64>,
}

/// Decode the payload segment of a `header.payload.signature` token
///
/// Returns `None` for anything that is not exactly three segments with a
/// base64 JSON object in the middle.
pub fn decode_claims(token: &str) -> Option<DecodedClaims> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        tracing::debug!("Token has {} segments, expected 3", parts.len());
        return None;
    }

    let payload = parts[1].trim_end_matches('=');
    let bytes = match URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| STANDARD_NO_PAD.decode(payload))
    {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("Token payload is not valid base64: {}", e);
            return None;
        }
    };

    let raw: RawClaims = match serde_json::from_slice(&bytes) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!("Token payload is not a claims object: {}", e);
            return None;
        }
    };

    Some(DecodedClaims {
        subject_id: raw.sub,
        username: raw.username,
        email: raw.email,
        roles: raw.roles.unwrap_or_default().into_iter().collect(),
        expires_at: raw.exp,
    })
}

#[cfg(test)]
pub(crate) fn encode_test_token(payload: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.sig", header, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_decode_full_claims() {
        let token = encode_test_token(&json!({
            "sub": "42",
            "username": "ana",
            "email": "ana@smartdrive.io",
            "roles": ["USER", "ADMIN"],
            "exp": 1_900_000_000
        }));

        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.subject_id.as_deref(), Some("42"));
        assert_eq!(claims.username.as_deref(), Some("ana"));
        assert_eq!(claims.email.as_deref(), Some("ana@smartdrive.io"));
        assert!(claims.roles.contains("ADMIN"));
        assert_eq!(claims.roles.len(), 2);
        assert_eq!(claims.expires_at, Some(1_900_000_000));
    }

    #[test]
    fn test_missing_roles_default_to_empty() {
        let token = encode_test_token(&json!({"sub": "1"}));
        let claims = decode_claims(&token).unwrap();
        assert!(claims.roles.is_empty());
        assert_eq!(claims.expires_at, None);
    }

    #[test]
    fn test_wrong_segment_count() {
        assert!(decode_claims("").is_none());
        assert!(decode_claims("onlyone").is_none());
        assert!(decode_claims("a.b").is_none());
        assert!(decode_claims("a.b.c.d").is_none());
    }

    #[test]
    fn test_invalid_base64_payload() {
        assert!(decode_claims("header.!!!not-base64!!!.sig").is_none());
    }

    #[test]
    fn test_payload_not_json_object() {
        let body = URL_SAFE_NO_PAD.encode("plain text");
        assert!(decode_claims(&format!("h.{}.s", body)).is_none());

        let array = URL_SAFE_NO_PAD.encode("[1,2,3]");
        assert!(decode_claims(&format!("h.{}.s", array)).is_none());
    }

    #[test]
    fn test_padded_standard_alphabet_payload() {
        let body = base64::engine::general_purpose::STANDARD.encode(r#"{"sub":"9","exp":10}"#);
        let claims = decode_claims(&format!("h.{}.s", body)).unwrap();
        assert_eq!(claims.subject_id.as_deref(), Some("9"));
    }

    #[test]
    fn test_seconds_until_expiry() {
        let token = encode_test_token(&json!({"exp": 1000}));
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.seconds_until_expiry(700), Some(300));
        assert_eq!(claims.seconds_until_expiry(1100), Some(-100));
    }

    #[test]
    fn test_extreme_exp_does_not_overflow() {
        let claims = decode_claims(&encode_test_token(&json!({"exp": i64::MIN}))).unwrap();
        assert_eq!(claims.seconds_until_expiry(1_700_000_000), Some(i64::MIN));

        let claims = decode_claims(&encode_test_token(&json!({"exp": i64::MAX}))).unwrap();
        assert_eq!(claims.seconds_until_expiry(-1), Some(i64::MAX));
    }

    proptest! {
        #[test]
        fn expiry_arithmetic_never_panics(exp in any::<i64>(), now in any::<i64>()) {
            let claims = DecodedClaims { expires_at: Some(exp), ..Default::default() };
            let _ = claims.seconds_until_expiry(now);
        }

        #[test]
        fn decode_never_panics(token in ".*") {
            let _ = decode_claims(&token);
        }

        #[test]
        fn non_three_segment_tokens_yield_none(parts in prop::collection::vec("[A-Za-z0-9_-]{0,12}", 0..8)) {
            prop_assume!(parts.len() != 3);
            let token = parts.join(".");
            prop_assume!(token.split('.').count() != 3);
            prop_assert!(decode_claims(&token).is_none());
        }
    }
}
