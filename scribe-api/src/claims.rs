//! Envelope-tolerant reader for the claims embedded in cloud tokens.
//!
//! Tokens are opaque signed JWTs. We never verify signatures (the cloud
//! does); we only need the embedded expiry to decide when to renew, so the
//! reader is deliberately forgiving: any structural surprise surfaces as a
//! [`Error::Parse`], which [`crate::auth`] treats the same as "expired".

use std::time::{Duration, SystemTime};

use base64::Engine;
use serde::Deserialize;

use crate::error::Error;

/// The claims we care about. Everything else in the payload is ignored.
#[derive(Clone, Debug, Default)]
pub struct TokenClaims {
    /// `exp`, seconds since the UNIX epoch.
    pub expires_at: Option<u64>,
    /// `sync-version` claim attached to user tokens.
    pub sync_version: Option<u32>,
}

/// Raw payload shape. `exp` arrives as an integer from some token issuers
/// and as a float from others; `serde_json::Number` accepts both.
#[derive(Deserialize)]
struct RawClaims {
    #[serde(default)]
    exp: Option<serde_json::Number>,
    #[serde(default, rename = "sync-version")]
    sync_version: Option<u32>,
}

impl TokenClaims {
    /// Decode the payload segment of `token` without verifying anything.
    pub fn parse_unverified(token: &str) -> Result<Self, Error> {
        let payload_b64 = token
            .split('.')
            .nth(1)
            .ok_or_else(|| Error::parse_msg("token has no payload segment"))?;

        // Issuers disagree on padding; strip it and decode unpadded.
        let unpadded = payload_b64.trim_end_matches('=');
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(unpadded)
            .map_err(|e| Error::parse("token payload is not base64url", e))?;

        let raw: RawClaims = serde_json::from_slice(&payload)
            .map_err(|e| Error::parse("token payload is not claims JSON", e))?;

        let expires_at = raw.exp.and_then(|n| {
            n.as_u64().or_else(|| {
                n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)
            })
        });

        Ok(Self {
            expires_at,
            sync_version: raw.sync_version,
        })
    }

    /// The absolute expiry instant, if the token carried one.
    pub fn expiry(&self) -> Option<SystemTime> {
        self.expires_at
            .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }
}

/// Build `header.payload.signature` with an arbitrary JSON payload.
#[cfg(test)]
pub(crate) fn fake_token(payload: &str) -> String {
    let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = engine.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let body = engine.encode(payload);
    format!("{header}.{body}.sig")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn integer_exp() {
        let token = fake_token(r#"{"exp":1714567890,"sync-version":3}"#);
        let claims = TokenClaims::parse_unverified(&token).unwrap();
        assert_eq!(claims.expires_at, Some(1714567890));
        assert_eq!(claims.sync_version, Some(3));
    }

    #[test]
    fn float_exp() {
        let token = fake_token(r#"{"exp":1714567890.75}"#);
        let claims = TokenClaims::parse_unverified(&token).unwrap();
        assert_eq!(claims.expires_at, Some(1714567890));
    }

    #[test]
    fn missing_exp_is_not_an_error() {
        let token = fake_token(r#"{"iss":"cloud"}"#);
        let claims = TokenClaims::parse_unverified(&token).unwrap();
        assert_eq!(claims.expires_at, None);
        assert_eq!(claims.expiry(), None);
    }

    #[test]
    fn padded_payload_is_tolerated() {
        let engine = &base64::engine::general_purpose::URL_SAFE;
        let body = engine.encode(r#"{"exp":1000}"#);
        let token = format!("h.{body}.s");
        let claims = TokenClaims::parse_unverified(&token).unwrap();
        assert_eq!(claims.expires_at, Some(1000));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        for bad in ["", "nodots", "a.!!!.c", "a.bm90anNvbg.c"] {
            let err = TokenClaims::parse_unverified(bad).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Parse, "input: {bad:?}");
        }
    }

    #[test]
    fn expiry_maps_to_system_time() {
        let token = fake_token(r#"{"exp":60}"#);
        let claims = TokenClaims::parse_unverified(&token).unwrap();
        assert_eq!(
            claims.expiry().unwrap(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(60)
        );
    }
}
