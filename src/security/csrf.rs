//! Synchronizer-token CSRF protection.
//!
//! A token is bound to one session and has the form
//! `<issued_at>.<nonce>.<signature>`:
//!
//! - `issued_at`: Unix seconds, decimal
//! - `nonce`: 16 random bytes, unpadded base64url
//! - `signature`: hex HMAC-SHA256 over session id, `issued_at` and nonce
//!
//! The guard also remembers the current token per session. A submitted token
//! must carry a valid signature, be within the time limit, and equal the
//! session's current token. A token that verifies is consumed, so a replayed
//! form submission fails.

use std::fmt;
use std::sync::Arc;

use axum::http::Method;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use super::clock::Clock;
use crate::config::SecretKey;
use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

/// Request headers that may carry the token, checked in order.
pub const CSRF_HEADER_NAMES: [&str; 2] = ["x-csrftoken", "x-csrf-token"];

/// Form field that may carry the token in an urlencoded body.
pub const CSRF_FORM_FIELD: &str = "csrf_token";

const NONCE_BYTES: usize = 16;
const SESSION_ID_BYTES: usize = 32;
const SIGNATURE_BYTES: usize = 32;

/// Generate a fresh opaque session identifier (unpadded base64url).
pub fn new_session_id() -> String {
    let bytes: [u8; SESSION_ID_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Methods that change state and therefore require a token.
pub fn is_state_changing(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// An issued token, as sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken(String);

impl CsrfToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CsrfToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a submitted token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfFailure {
    /// No token in headers or form body.
    Missing,
    /// No session cookie to bind the token to.
    NoSession,
    /// Not in `<issued_at>.<nonce>.<signature>` form.
    Malformed,
    /// Signature does not match this session.
    BadSignature,
    /// Older than the configured time limit.
    Expired,
    /// Well-formed and signed, but not the session's current token.
    NotCurrent,
}

impl fmt::Display for CsrfFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CsrfFailure::Missing => "token missing",
            CsrfFailure::NoSession => "no session",
            CsrfFailure::Malformed => "token malformed",
            CsrfFailure::BadSignature => "signature mismatch",
            CsrfFailure::Expired => "token expired",
            CsrfFailure::NotCurrent => "token not current for session",
        };
        f.write_str(reason)
    }
}

/// Result of verifying a submitted token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfVerdict {
    Valid,
    Invalid(CsrfFailure),
}

#[derive(Debug, Clone)]
struct IssuedToken {
    value: String,
    issued_at: u64,
}

struct ParsedToken<'a> {
    issued_at: u64,
    nonce: &'a str,
    signature: Vec<u8>,
}

/// Issues and verifies CSRF tokens.
///
/// Cheap to clone; clones share the issued-token table.
#[derive(Debug, Clone)]
pub struct CsrfGuard {
    key: SecretKey,
    issued: Arc<DashMap<String, IssuedToken>>,
    time_limit_secs: u64,
    exempt_paths: Arc<[String]>,
    clock: Arc<dyn Clock>,
}

impl CsrfGuard {
    pub fn new(
        key: SecretKey,
        time_limit_secs: u64,
        exempt_paths: Vec<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key,
            issued: Arc::new(DashMap::new()),
            time_limit_secs,
            exempt_paths: exempt_paths.into(),
            clock,
        }
    }

    /// Whether a request must present a valid token.
    pub fn requires_verification(&self, method: &Method, path: &str) -> bool {
        is_state_changing(method) && !self.exempt_paths.iter().any(|p| p == path)
    }

    /// Return the session's current token, minting a new one if it has none
    /// or the current one has expired.
    pub fn issue_token(&self, session_id: &str) -> AppResult<CsrfToken> {
        let now = self.clock.now_secs();

        if let Some(current) = self.issued.get(session_id)
            && !self.is_expired(current.issued_at, now)
        {
            return Ok(CsrfToken(current.value.clone()));
        }

        let nonce_bytes: [u8; NONCE_BYTES] = rand::random();
        let nonce = URL_SAFE_NO_PAD.encode(nonce_bytes);
        let signature = self.mac(session_id, now, &nonce)?.finalize().into_bytes();
        let value = format!("{now}.{nonce}.{}", hex::encode(signature));

        self.issued.insert(
            session_id.to_string(),
            IssuedToken {
                value: value.clone(),
                issued_at: now,
            },
        );
        debug!("Issued CSRF token");
        Ok(CsrfToken(value))
    }

    /// Verify a submitted token for a session. Consumes it on success.
    ///
    /// Checks run in a fixed order: presence, shape, signature, expiry, then
    /// equality with the session's current token.
    pub fn verify(&self, session_id: Option<&str>, supplied: Option<&str>) -> CsrfVerdict {
        let Some(supplied) = supplied.map(str::trim).filter(|s| !s.is_empty()) else {
            return CsrfVerdict::Invalid(CsrfFailure::Missing);
        };
        let Some(session_id) = session_id.filter(|s| !s.is_empty()) else {
            return CsrfVerdict::Invalid(CsrfFailure::NoSession);
        };
        let Some(parsed) = parse_token(supplied) else {
            return CsrfVerdict::Invalid(CsrfFailure::Malformed);
        };

        let signature_ok = self
            .mac(session_id, parsed.issued_at, parsed.nonce)
            .map(|mac| mac.verify_slice(&parsed.signature).is_ok())
            .unwrap_or(false);
        if !signature_ok {
            return CsrfVerdict::Invalid(CsrfFailure::BadSignature);
        }

        if self.is_expired(parsed.issued_at, self.clock.now_secs()) {
            return CsrfVerdict::Invalid(CsrfFailure::Expired);
        }

        // Removal under the entry lock makes the token single-use even under
        // concurrent submissions.
        let consumed = self.issued.remove_if(session_id, |_, current| {
            bool::from(current.value.as_bytes().ct_eq(supplied.as_bytes()))
        });

        match consumed {
            Some(_) => CsrfVerdict::Valid,
            None => CsrfVerdict::Invalid(CsrfFailure::NotCurrent),
        }
    }

    /// Forget tokens that can no longer verify. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.issued.len();
        self.issued
            .retain(|_, token| !self.is_expired(token.issued_at, now));
        before.saturating_sub(self.issued.len())
    }

    pub fn tracked_sessions(&self) -> usize {
        self.issued.len()
    }

    fn is_expired(&self, issued_at: u64, now: u64) -> bool {
        now.saturating_sub(issued_at) > self.time_limit_secs
    }

    fn mac(&self, session_id: &str, issued_at: u64, nonce: &str) -> AppResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .map_err(|e| AppError::InternalFault(format!("CSRF key rejected: {e}")))?;
        mac.update(session_id.as_bytes());
        mac.update(b"\0");
        mac.update(issued_at.to_string().as_bytes());
        mac.update(b"\0");
        mac.update(nonce.as_bytes());
        Ok(mac)
    }
}

fn parse_token(raw: &str) -> Option<ParsedToken<'_>> {
    let mut parts = raw.split('.');
    let (issued_at, nonce, signature) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(i), Some(n), Some(s), None) => (i, n, s),
        _ => return None,
    };

    if issued_at.is_empty() || !issued_at.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let issued_at = issued_at.parse::<u64>().ok()?;

    let nonce_len = URL_SAFE_NO_PAD.decode(nonce).ok()?.len();
    if nonce_len != NONCE_BYTES {
        return None;
    }

    let signature = hex::decode(signature).ok()?;
    if signature.len() != SIGNATURE_BYTES {
        return None;
    }

    Some(ParsedToken {
        issued_at,
        nonce,
        signature,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::security::clock::ManualClock;

    fn guard() -> (CsrfGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let guard = CsrfGuard::new(
            SecretKey::new(b"test-secret-key".to_vec()),
            3_600,
            vec!["/health".to_string()],
            clock.clone(),
        );
        (guard, clock)
    }

    #[test]
    fn test_token_shape() {
        let (guard, _) = guard();
        let token = guard.issue_token("session-a").unwrap();
        let parts: Vec<&str> = token.as_str().split('.').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "1700000000");
        assert_eq!(parts[2].len(), 64);
    }

    #[test]
    fn test_issue_reuses_current_token() {
        let (guard, clock) = guard();
        let first = guard.issue_token("s").unwrap();
        clock.advance(10);
        assert_eq!(guard.issue_token("s").unwrap(), first);
    }

    #[test]
    fn test_issue_replaces_expired_token() {
        let (guard, clock) = guard();
        let first = guard.issue_token("s").unwrap();
        clock.advance(3_601);
        assert_ne!(guard.issue_token("s").unwrap(), first);
    }

    #[test]
    fn test_valid_token_verifies_once() {
        let (guard, _) = guard();
        let token = guard.issue_token("s").unwrap();

        assert_eq!(
            guard.verify(Some("s"), Some(token.as_str())),
            CsrfVerdict::Valid
        );
        assert_eq!(
            guard.verify(Some("s"), Some(token.as_str())),
            CsrfVerdict::Invalid(CsrfFailure::NotCurrent)
        );
    }

    #[test]
    fn test_missing_token() {
        let (guard, _) = guard();
        assert_eq!(
            guard.verify(Some("s"), None),
            CsrfVerdict::Invalid(CsrfFailure::Missing)
        );
        assert_eq!(
            guard.verify(Some("s"), Some("   ")),
            CsrfVerdict::Invalid(CsrfFailure::Missing)
        );
    }

    #[test]
    fn test_missing_session() {
        let (guard, _) = guard();
        let token = guard.issue_token("s").unwrap();
        assert_eq!(
            guard.verify(None, Some(token.as_str())),
            CsrfVerdict::Invalid(CsrfFailure::NoSession)
        );
    }

    #[test]
    fn test_malformed_token() {
        let (guard, _) = guard();
        for bad in ["abc", "1.2", "x.AAAAAAAAAAAAAAAAAAAAAA.00", "1.2.3.4"] {
            assert_eq!(
                guard.verify(Some("s"), Some(bad)),
                CsrfVerdict::Invalid(CsrfFailure::Malformed),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_token_bound_to_session() {
        let (guard, _) = guard();
        let token = guard.issue_token("alice").unwrap();
        assert_eq!(
            guard.verify(Some("mallory"), Some(token.as_str())),
            CsrfVerdict::Invalid(CsrfFailure::BadSignature)
        );
    }

    #[test]
    fn test_tampered_timestamp_fails_signature() {
        let (guard, _) = guard();
        let token = guard.issue_token("s").unwrap();
        let tampered = token.as_str().replacen("1700000000", "1700000500", 1);
        assert_eq!(
            guard.verify(Some("s"), Some(&tampered)),
            CsrfVerdict::Invalid(CsrfFailure::BadSignature)
        );
    }

    #[test]
    fn test_expired_token() {
        let (guard, clock) = guard();
        let token = guard.issue_token("s").unwrap();
        clock.advance(3_601);
        assert_eq!(
            guard.verify(Some("s"), Some(token.as_str())),
            CsrfVerdict::Invalid(CsrfFailure::Expired)
        );
    }

    #[test]
    fn test_superseded_token_is_not_current() {
        let (guard, clock) = guard();
        let old = guard.issue_token("s").unwrap();
        assert_eq!(guard.verify(Some("s"), Some(old.as_str())), CsrfVerdict::Valid);

        clock.advance(5);
        let _fresh = guard.issue_token("s").unwrap();
        assert_eq!(
            guard.verify(Some("s"), Some(old.as_str())),
            CsrfVerdict::Invalid(CsrfFailure::NotCurrent)
        );
    }

    #[test]
    fn test_different_key_rejects() {
        let (guard, _) = guard();
        let token = guard.issue_token("s").unwrap();

        let other = CsrfGuard::new(
            SecretKey::new(b"another-key".to_vec()),
            3_600,
            Vec::new(),
            Arc::new(ManualClock::new(1_700_000_000)),
        );
        assert_eq!(
            other.verify(Some("s"), Some(token.as_str())),
            CsrfVerdict::Invalid(CsrfFailure::BadSignature)
        );
    }

    #[test]
    fn test_requires_verification() {
        let (guard, _) = guard();
        assert!(guard.requires_verification(&Method::POST, "/contact"));
        assert!(guard.requires_verification(&Method::DELETE, "/"));
        assert!(!guard.requires_verification(&Method::GET, "/contact"));
        assert!(!guard.requires_verification(&Method::POST, "/health"));
    }

    #[test]
    fn test_sweep_drops_expired() {
        let (guard, clock) = guard();
        guard.issue_token("a").unwrap();
        clock.advance(3_000);
        guard.issue_token("b").unwrap();
        clock.advance(1_000);

        assert_eq!(guard.sweep(), 1);
        assert_eq!(guard.tracked_sessions(), 1);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = new_session_id();
        assert_eq!(a.len(), 43);
        assert_ne!(a, new_session_id());
    }
}
