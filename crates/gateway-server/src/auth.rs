//! Caller authentication for the auxiliary routes.
//!
//! A request is either paid (bearer key known to the store) or free (a
//! `Trace-ID` header and nothing else). The web-search route additionally
//! requires a time-based one-time code when a shared secret is configured.

use crate::http::HttpRequest;
use crate::state::GatewayState;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use gateway_core::{mask_secret, ApiKey, GatewayError, GatewayResult, FREE_USER_KEY};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Header carrying the caller's anonymous identity
pub const TRACE_ID_HEADER: &str = "Trace-ID";

/// Header carrying the base64-encoded one-time code
pub const OTP_HEADER: &str = "X-OTP-Auth";

/// Who is calling an auxiliary route
#[derive(Debug, Clone)]
pub enum CallerIdentity {
    /// Holder of a known API key
    Paid(ApiKey),
    /// Anonymous caller identified by a trace id
    Free {
        /// Rate-limit identity
        trace_id: String,
    },
}

impl CallerIdentity {
    /// Key under which traffic is accounted
    #[must_use]
    pub fn account(&self) -> &str {
        match self {
            Self::Paid(key) => &key.key,
            Self::Free { .. } => FREE_USER_KEY,
        }
    }

    /// Whether this is an anonymous caller
    #[must_use]
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free { .. })
    }
}

/// Resolve the caller of a proxy route
///
/// A bearer key wins over a trace id. Paid callers must be known and within
/// quota; free callers must be allowed on the route.
///
/// # Errors
/// `401` for an unknown key, `429` for an exhausted quota, `403` when free
/// callers are disallowed, `502` when neither credential is present
pub async fn resolve_identity(
    state: &GatewayState,
    request: &HttpRequest,
    route: &str,
    allow_free: bool,
) -> GatewayResult<CallerIdentity> {
    if let Some(token) = request.bearer_token() {
        let key = state
            .keys()
            .get(token)
            .ok_or_else(|| GatewayError::authentication("invalid api key"))?;
        if !state.store().traffic_allowed(&key.key).await? {
            return Err(GatewayError::TrafficLimitExceeded {
                key: mask_secret(&key.key),
            });
        }
        debug!(route, key = %mask_secret(&key.key), "Paid caller");
        return Ok(CallerIdentity::Paid(key));
    }

    let trace_id = request
        .header(TRACE_ID_HEADER)
        .map(str::trim)
        .filter(|t| !t.is_empty());
    match trace_id {
        Some(trace_id) if allow_free => {
            debug!(route, trace_id, "Free caller");
            Ok(CallerIdentity::Free {
                trace_id: trace_id.to_string(),
            })
        }
        Some(_) => Err(GatewayError::forbidden(format!(
            "free users are not allowed to use {route}"
        ))),
        None => Err(GatewayError::MissingIdentity),
    }
}

/// Verifies one-time codes
pub trait OtpVerifier: Send + Sync {
    /// Whether the code is currently valid
    fn verify(&self, code: &str) -> bool;
}

type HmacSha256 = Hmac<Sha256>;

/// Time-based one-time codes: HMAC-SHA256 over 30 second steps, six digits,
/// one step of clock skew either way
pub struct TotpVerifier {
    secret: SecretString,
    step_secs: u64,
    digits: u32,
    skew: u64,
}

impl TotpVerifier {
    /// Verifier for a shared secret
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            step_secs: 30,
            digits: 6,
            skew: 1,
        }
    }

    /// Code for a unix timestamp
    #[must_use]
    pub fn code_at(&self, unix_secs: u64) -> Option<String> {
        self.code_for_counter(unix_secs / self.step_secs)
    }

    fn code_for_counter(&self, counter: u64) -> Option<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes()).ok()?;
        mac.update(&counter.to_be_bytes());
        let hash = mac.finalize().into_bytes();

        // Dynamic truncation
        let offset = usize::from(hash[hash.len() - 1] & 0x0f);
        let binary = (u32::from(hash[offset] & 0x7f) << 24)
            | (u32::from(hash[offset + 1]) << 16)
            | (u32::from(hash[offset + 2]) << 8)
            | u32::from(hash[offset + 3]);
        let code = binary % 10u32.pow(self.digits);
        Some(format!("{code:0width$}", width = self.digits as usize))
    }

    /// Check a code against a unix timestamp
    #[must_use]
    pub fn verify_at(&self, code: &str, unix_secs: u64) -> bool {
        let code = code.trim();
        if code.len() != self.digits as usize {
            return false;
        }
        let counter = unix_secs / self.step_secs;
        let first = counter.saturating_sub(self.skew);
        (first..=counter + self.skew)
            .filter_map(|c| self.code_for_counter(c))
            .any(|expected| expected == code)
    }
}

impl OtpVerifier for TotpVerifier {
    fn verify(&self, code: &str) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        self.verify_at(code, now)
    }
}

/// Check the one-time code header of a request
///
/// # Errors
/// `401 totp_auth_required` when the header is missing,
/// `401 totp_auth_failed` when it does not decode or verify
pub fn check_otp(verifier: &dyn OtpVerifier, request: &HttpRequest, route: &str) -> GatewayResult<()> {
    let Some(header) = request.header(OTP_HEADER).map(str::trim).filter(|h| !h.is_empty()) else {
        return Err(GatewayError::authentication_kind(
            format!("{route} requires a one-time code"),
            "totp_auth_required",
        ));
    };
    let code = decode_otp_header(header).ok_or_else(|| {
        GatewayError::authentication_kind("one-time code is not valid base64", "totp_auth_failed")
    })?;
    if verifier.verify(&code) {
        Ok(())
    } else {
        Err(GatewayError::authentication_kind(
            "one-time code rejected",
            "totp_auth_failed",
        ))
    }
}

/// Decode the base64 header value into the code text
#[must_use]
pub fn decode_otp_header(value: &str) -> Option<String> {
    let bytes = STANDARD.decode(value.trim()).ok()?;
    String::from_utf8(bytes).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::GatewayStateBuilder;
    use gateway_core::MemoryStore;
    use std::sync::Arc;

    fn request(headers: &[(&str, &str)]) -> HttpRequest {
        HttpRequest {
            method: "GET".into(),
            headers: headers
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            ..HttpRequest::default()
        }
    }

    async fn state() -> GatewayState {
        let store = Arc::new(MemoryStore::new());
        store.add_api_key(ApiKey::new("sk-paid", ["gpt-4o"]), None);
        store.add_api_key(ApiKey::new("sk-spent", ["gpt-4o"]), Some(0));
        let state = GatewayStateBuilder::new(store).build().unwrap();
        state.reload_keys().await.unwrap();
        state
    }

    #[tokio::test]
    async fn test_identity_resolution() {
        let state = state().await;

        let paid = resolve_identity(&state, &request(&[("Authorization", "Bearer sk-paid")]), "amap", false)
            .await
            .unwrap();
        assert_eq!(paid.account(), "sk-paid");

        let free = resolve_identity(&state, &request(&[("Trace-ID", "t-1")]), "amap", true)
            .await
            .unwrap();
        assert!(free.is_free());
        assert_eq!(free.account(), FREE_USER_KEY);

        let cases = [
            (request(&[("Authorization", "Bearer nope")]), true, 401),
            (request(&[("Authorization", "Bearer sk-spent")]), true, 429),
            (request(&[("Trace-ID", "t-1")]), false, 403),
            (request(&[]), true, 502),
        ];
        for (req, allow_free, status) in cases {
            let err = resolve_identity(&state, &req, "amap", allow_free).await.unwrap_err();
            assert_eq!(err.status_code(), status);
        }
    }

    #[test]
    fn test_totp_window() {
        let verifier = TotpVerifier::new(SecretString::new("shared-otp-secret".into()));
        let now = 1_700_000_000;
        let code = verifier.code_at(now).unwrap();
        assert_eq!(code.len(), 6);
        assert!(verifier.verify_at(&code, now));
        assert!(verifier.verify_at(&code, now + 30));
        assert!(verifier.verify_at(&code, now - 30));
        assert!(!verifier.verify_at(&code, now + 120));
        assert!(!verifier.verify_at("12345", now));
    }

    #[test]
    fn test_rfc_vector() {
        // RFC 6238 SHA-256 test vector, truncated to six digits
        let verifier = TotpVerifier::new(SecretString::new(
            "12345678901234567890123456789012".into(),
        ));
        assert_eq!(verifier.code_at(59).unwrap(), "119246");
    }

    struct Fixed(&'static str);

    impl OtpVerifier for Fixed {
        fn verify(&self, code: &str) -> bool {
            code == self.0
        }
    }

    #[test]
    fn test_otp_header() {
        let verifier = Fixed("123456");
        let encoded = STANDARD.encode("123456");

        assert!(check_otp(&verifier, &request(&[(OTP_HEADER, &encoded)]), "web-search").is_ok());

        let missing = check_otp(&verifier, &request(&[]), "web-search").unwrap_err();
        assert_eq!(missing.status_code(), 401);
        assert_eq!(missing.error_type(), "totp_auth_required");

        let wrong = STANDARD.encode("654321");
        let failed = check_otp(&verifier, &request(&[(OTP_HEADER, &wrong)]), "web-search").unwrap_err();
        assert_eq!(failed.error_type(), "totp_auth_failed");

        let garbage = check_otp(&verifier, &request(&[(OTP_HEADER, "%%%")]), "web-search").unwrap_err();
        assert_eq!(garbage.error_type(), "totp_auth_failed");
    }
}
