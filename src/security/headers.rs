//! Security response headers and the per-response CSP nonce.
//!
//! [`SecurityHeaderPolicy::decorate`] is applied to every response the
//! pipeline emits, including error responses. It never fails: a header value
//! that cannot be encoded falls back to a fixed conservative value.

use std::fmt;

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::warn;

/// One year, subdomains included.
const HSTS: &str = "max-age=31536000; includeSubDomains";

/// Browser features no page on the site may use.
const PERMISSIONS_POLICY: &str = "geolocation=(), microphone=(), camera=()";

/// Directive that receives the nonce.
const SCRIPT_SRC: &str = "script-src";

/// Directive forced to `'none'` when the policy does not set it.
const FRAME_ANCESTORS: &str = "frame-ancestors";

/// Used if a configured policy cannot be encoded as a header value.
const FALLBACK_CSP: &str = "default-src 'self'; frame-ancestors 'none'";

static X_CONTENT_TYPE_OPTIONS: HeaderName = HeaderName::from_static("x-content-type-options");
static X_FRAME_OPTIONS: HeaderName = HeaderName::from_static("x-frame-options");
static X_XSS_PROTECTION: HeaderName = HeaderName::from_static("x-xss-protection");
static X_POWERED_BY: HeaderName = HeaderName::from_static("x-powered-by");
static PERMISSIONS_POLICY_HEADER: HeaderName = HeaderName::from_static("permissions-policy");

/// Transport scheme of the original client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    /// Parse a forwarded-proto style value (`https`, `HTTP`).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("https") {
            Some(Scheme::Https)
        } else if raw.eq_ignore_ascii_case("http") {
            Some(Scheme::Http)
        } else {
            None
        }
    }

    pub fn is_https(self) -> bool {
        matches!(self, Scheme::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

// =============================================================================
// Nonce
// =============================================================================

/// Single-use CSP nonce: 16 random bytes, base64 encoded.
///
/// Inserted into request extensions so a handler rendering inline scripts
/// can attach it to `<script nonce="...">`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CspNonce(String);

impl CspNonce {
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(STANDARD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CspNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Content Security Policy
// =============================================================================

/// Ordered set of CSP directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CspPolicy {
    directives: Vec<(String, Vec<String>)>,
}

impl Default for CspPolicy {
    fn default() -> Self {
        let directive = |name: &str, sources: &[&str]| {
            (
                name.to_string(),
                sources.iter().map(|s| (*s).to_string()).collect(),
            )
        };

        Self {
            directives: vec![
                directive("default-src", &["'self'"]),
                directive(
                    "script-src",
                    &["'self'", "'unsafe-inline'", "cdnjs.cloudflare.com"],
                ),
                directive(
                    "style-src",
                    &["'self'", "'unsafe-inline'", "cdnjs.cloudflare.com"],
                ),
                directive("font-src", &["'self'", "cdnjs.cloudflare.com"]),
                directive(
                    "img-src",
                    &[
                        "'self'",
                        "data:",
                        "https://github-readme-stats.vercel.app",
                        "https://img.shields.io",
                    ],
                ),
                directive("connect-src", &["'self'"]),
                directive("frame-ancestors", &["'none'"]),
                directive("base-uri", &["'self'"]),
                directive("form-action", &["'self'"]),
            ],
        }
    }
}

impl CspPolicy {
    pub fn new(directives: Vec<(String, Vec<String>)>) -> Self {
        Self { directives }
    }

    /// Parse header syntax: `default-src 'self'; img-src 'self' data:`.
    ///
    /// Directive names are lowercased. Empty segments are skipped, and tokens
    /// containing characters outside visible ASCII are dropped so the rendered
    /// policy is always a valid header value.
    pub fn parse(raw: &str) -> Self {
        let directives = raw
            .split(';')
            .filter_map(|segment| {
                let mut tokens = segment
                    .split_ascii_whitespace()
                    .filter(|t| t.bytes().all(|b| b.is_ascii_graphic()));
                let name = tokens.next()?.to_ascii_lowercase();
                Some((name, tokens.map(str::to_string).collect()))
            })
            .collect();
        Self { directives }
    }

    pub fn directive(&self, name: &str) -> Option<&[String]> {
        self.directives
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, sources)| sources.as_slice())
    }

    /// Render the header value.
    ///
    /// The nonce is added to `script-src` only if that directive exists;
    /// a policy without `script-src` is never given one. `frame-ancestors
    /// 'none'` is appended when absent.
    pub fn render(&self, nonce: Option<&CspNonce>) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.directives.len() + 1);

        for (name, sources) in &self.directives {
            let mut rendered = name.clone();
            for source in sources {
                rendered.push(' ');
                rendered.push_str(source);
            }
            if name == SCRIPT_SRC
                && let Some(nonce) = nonce
            {
                rendered.push_str(&format!(" 'nonce-{nonce}'"));
            }
            parts.push(rendered);
        }

        if self.directive(FRAME_ANCESTORS).is_none() {
            parts.push(format!("{FRAME_ANCESTORS} 'none'"));
        }

        parts.join("; ")
    }
}

// =============================================================================
// Header set
// =============================================================================

/// The security headers computed for one response.
#[derive(Debug, Clone, Default)]
pub struct SecurityHeaderSet(Vec<(HeaderName, HeaderValue)>);

impl SecurityHeaderSet {
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0
            .iter()
            .find(|(n, _)| n.as_str().eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

}

/// Produces the security header set for each response.
#[derive(Debug, Clone)]
pub struct SecurityHeaderPolicy {
    csp: CspPolicy,
    /// Emit HSTS on plain-http requests too (the redirect response carries it).
    force_https: bool,
}

impl Default for SecurityHeaderPolicy {
    fn default() -> Self {
        Self::new(CspPolicy::default(), false)
    }
}

impl SecurityHeaderPolicy {
    pub fn new(csp: CspPolicy, force_https: bool) -> Self {
        Self { csp, force_https }
    }

    /// Compute the header set for a response to a request made over `scheme`.
    pub fn header_set(&self, scheme: Scheme, nonce: &CspNonce) -> SecurityHeaderSet {
        let csp = HeaderValue::from_str(&self.csp.render(Some(nonce))).unwrap_or_else(|e| {
            warn!(error = %e, "Configured CSP is not a valid header value, using fallback");
            HeaderValue::from_static(FALLBACK_CSP)
        });

        let mut headers = vec![
            (header::CONTENT_SECURITY_POLICY, csp),
            (X_CONTENT_TYPE_OPTIONS.clone(), HeaderValue::from_static("nosniff")),
            (X_FRAME_OPTIONS.clone(), HeaderValue::from_static("DENY")),
            (X_XSS_PROTECTION.clone(), HeaderValue::from_static("1; mode=block")),
            (
                PERMISSIONS_POLICY_HEADER.clone(),
                HeaderValue::from_static(PERMISSIONS_POLICY),
            ),
            (
                header::REFERRER_POLICY,
                HeaderValue::from_static("strict-origin-when-cross-origin"),
            ),
        ];

        if scheme.is_https() || self.force_https {
            headers.push((
                header::STRICT_TRANSPORT_SECURITY,
                HeaderValue::from_static(HSTS),
            ));
        }

        SecurityHeaderSet(headers)
    }

    /// Apply the header set to a response and strip server-identifying headers.
    pub fn decorate(&self, headers: &mut HeaderMap, scheme: Scheme, nonce: &CspNonce) {
        headers.remove(header::SERVER);
        headers.remove(&X_POWERED_BY);
        for (name, value) in self.header_set(scheme, nonce).0 {
            headers.insert(name, value);
        }
    }
}
