//! Cacheability and TTL decisions.
//!
//! The policy is deliberately narrow: a response is stored only when it
//! answers a `POST` with `200 OK`, carries a positive `s-maxage`/`max-age`, is
//! not marked `no-store`/`no-cache`, has not already expired, and the request
//! body does not look like a write operation.

use std::fmt;
use std::time::SystemTime;

use crate::http::{Headers, Method, StatusCode};

/// Request bodies containing this substring are never cached.
pub const MUTATION_MARKER: &str = "mutation";

/// Ceiling on any lifetime read from `Cache-Control` (2^31 seconds, the
/// largest delta-seconds value caches are required to represent).
pub const MAX_TTL: u64 = 1 << 31;

/// Why a response was not cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// No usable `s-maxage`/`max-age`, or it was zero.
    NoTtl,
    Status(StatusCode),
    Method,
    Mutation,
    /// `Cache-Control` carries `no-store` or `no-cache`.
    NoStore,
    /// `Expires` lies in the past.
    Expired,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTtl => f.write_str("no ttl"),
            Self::Status(code) => write!(f, "status {}", code.as_u16()),
            Self::Method => f.write_str("method is not POST"),
            Self::Mutation => f.write_str("request body is a mutation"),
            Self::NoStore => f.write_str("cache-control forbids storing"),
            Self::Expired => f.write_str("already expired"),
        }
    }
}

/// Outcome of evaluating one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Cacheable { ttl: u64 },
    Reject(Reason),
}

impl Verdict {
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Self::Cacheable { .. })
    }
}

/// Seconds a response may be stored for, from its `Cache-Control` directives.
///
/// The first parseable `s-maxage` wins; otherwise the first parseable
/// `max-age`; otherwise `0`, meaning "do not cache". Values above
/// [`MAX_TTL`] are capped.
///
/// # Examples
///
/// ```
/// use cacheproxy::cache::policy::ttl;
/// use cacheproxy::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Cache-Control", "public, max-age=60, s-maxage=300");
/// assert_eq!(ttl(&headers), 300);
/// ```
pub fn ttl(headers: &Headers) -> u64 {
    let Some(cache_control) = headers.get_joined("cache-control") else {
        return 0;
    };

    let directive = |prefix: &str| {
        cache_control
            .split(',')
            .map(str::trim)
            .filter_map(|d| d.strip_prefix(prefix))
            .find_map(|v| v.trim().parse::<u64>().ok())
    };

    directive("s-maxage=")
        .or_else(|| directive("max-age="))
        .map_or(0, |secs| secs.min(MAX_TTL))
}

/// Runs the ordered checks; the first failing one decides the rejection.
pub fn evaluate(
    method: &Method,
    body: &[u8],
    status: StatusCode,
    headers: &Headers,
    ttl: u64,
) -> Verdict {
    evaluate_at(method, body, status, headers, ttl, SystemTime::now())
}

fn evaluate_at(
    method: &Method,
    body: &[u8],
    status: StatusCode,
    headers: &Headers,
    ttl: u64,
    now: SystemTime,
) -> Verdict {
    if ttl == 0 {
        return Verdict::Reject(Reason::NoTtl);
    }
    if status != StatusCode::OK {
        return Verdict::Reject(Reason::Status(status));
    }
    if *method != Method::Post {
        return Verdict::Reject(Reason::Method);
    }
    if contains(body, MUTATION_MARKER.as_bytes()) {
        return Verdict::Reject(Reason::Mutation);
    }
    if forbids_storing(headers) {
        return Verdict::Reject(Reason::NoStore);
    }
    if expired(headers, now) {
        return Verdict::Reject(Reason::Expired);
    }
    Verdict::Cacheable { ttl }
}

/// Boolean form of [`evaluate`].
pub fn is_cacheable(
    method: &Method,
    body: &[u8],
    status: StatusCode,
    headers: &Headers,
    ttl: u64,
) -> bool {
    evaluate(method, body, status, headers, ttl).is_cacheable()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn forbids_storing(headers: &Headers) -> bool {
    headers.get_all("cache-control").any(|value| {
        value.split(',').any(|d| {
            // `no-cache="Set-Cookie"` still names the directive.
            let name = d.split('=').next().unwrap_or_default().trim();
            name.eq_ignore_ascii_case("no-store") || name.eq_ignore_ascii_case("no-cache")
        })
    })
}

// Unparseable dates are ignored rather than treated as expired.
fn expired(headers: &Headers, now: SystemTime) -> bool {
    headers
        .get("expires")
        .and_then(|v| httpdate::parse_http_date(v.trim()).ok())
        .is_some_and(|at| at < now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut h = Headers::new();
        for (name, value) in pairs {
            h.insert(*name, *value);
        }
        h
    }

    fn verdict(method: Method, body: &str, status: StatusCode, h: &Headers) -> Verdict {
        evaluate(&method, body.as_bytes(), status, h, ttl(h))
    }

    const QUERY: &str = r#"{"query":"{ping}"}"#;

    // ── ttl ───────────────────────────────────────────────────────────────────

    #[test]
    fn ttl_absent_header_is_zero() {
        assert_eq!(ttl(&Headers::new()), 0);
    }

    #[test]
    fn ttl_reads_max_age() {
        assert_eq!(ttl(&headers(&[("Cache-Control", "max-age=30")])), 30);
    }

    #[test]
    fn ttl_prefers_s_maxage_in_any_position() {
        assert_eq!(ttl(&headers(&[("Cache-Control", "max-age=10, s-maxage=20")])), 20);
        assert_eq!(ttl(&headers(&[("Cache-Control", "s-maxage=20,max-age=10")])), 20);
    }

    #[test]
    fn ttl_first_parseable_wins() {
        let h = headers(&[("Cache-Control", "max-age=abc, max-age=15, max-age=99")]);
        assert_eq!(ttl(&h), 15);
        let h = headers(&[("Cache-Control", "s-maxage=oops, max-age=7")]);
        assert_eq!(ttl(&h), 7);
    }

    #[test]
    fn ttl_unparseable_is_zero() {
        assert_eq!(ttl(&headers(&[("Cache-Control", "public, max-age=-5")])), 0);
    }

    #[test]
    fn ttl_is_capped() {
        let h = headers(&[("Cache-Control", "max-age=18446744073709551615")]);
        assert_eq!(ttl(&h), MAX_TTL);
        let h = headers(&[("Cache-Control", "s-maxage=99999999999, max-age=5")]);
        assert_eq!(ttl(&h), MAX_TTL);
    }

    #[test]
    fn ttl_spans_repeated_header_lines() {
        let h = headers(&[("Cache-Control", "public"), ("Cache-Control", "max-age=45")]);
        assert_eq!(ttl(&h), 45);
    }

    // ── evaluate ──────────────────────────────────────────────────────────────

    #[test]
    fn post_ok_with_max_age_is_cacheable() {
        let h = headers(&[("Cache-Control", "max-age=30")]);
        assert_eq!(
            verdict(Method::Post, QUERY, StatusCode::OK, &h),
            Verdict::Cacheable { ttl: 30 }
        );
    }

    #[test]
    fn missing_cache_control_is_not_cacheable() {
        let h = Headers::new();
        assert_eq!(
            verdict(Method::Post, QUERY, StatusCode::OK, &h),
            Verdict::Reject(Reason::NoTtl)
        );
    }

    #[test]
    fn explicit_zero_max_age_is_not_cacheable() {
        let h = headers(&[("Cache-Control", "max-age=0")]);
        assert_eq!(
            verdict(Method::Post, QUERY, StatusCode::OK, &h),
            Verdict::Reject(Reason::NoTtl)
        );
    }

    #[test]
    fn non_200_is_not_cacheable() {
        let h = headers(&[("Cache-Control", "max-age=30")]);
        assert_eq!(
            verdict(Method::Post, QUERY, StatusCode::CREATED, &h),
            Verdict::Reject(Reason::Status(StatusCode::CREATED))
        );
    }

    #[test]
    fn get_is_never_cached() {
        let h = headers(&[("Cache-Control", "max-age=30")]);
        assert_eq!(
            verdict(Method::Get, QUERY, StatusCode::OK, &h),
            Verdict::Reject(Reason::Method)
        );
    }

    #[test]
    fn mutation_anywhere_in_body_is_never_cached() {
        let h = headers(&[("Cache-Control", "max-age=30")]);
        for body in [
            r#"{"query":"mutation { addUser }"}"#,
            r#"{"operationName":"x","query":"{a}","note":"no_mutation_here"}"#,
        ] {
            assert_eq!(
                verdict(Method::Post, body, StatusCode::OK, &h),
                Verdict::Reject(Reason::Mutation)
            );
        }
    }

    #[test]
    fn no_store_beats_parseable_max_age() {
        let h = headers(&[("Cache-Control", "max-age=60, no-store")]);
        assert_eq!(
            verdict(Method::Post, QUERY, StatusCode::OK, &h),
            Verdict::Reject(Reason::NoStore)
        );
        let h = headers(&[("Cache-Control", "No-Cache, max-age=60")]);
        assert!(!is_cacheable(&Method::Post, QUERY.as_bytes(), StatusCode::OK, &h, 60));
    }

    #[test]
    fn no_cache_with_field_names_is_not_cacheable() {
        for value in [
            r#"max-age=60, no-cache="Set-Cookie""#,
            r#"NO-STORE = "x", max-age=60"#,
        ] {
            let h = headers(&[("Cache-Control", value)]);
            assert_eq!(
                verdict(Method::Post, QUERY, StatusCode::OK, &h),
                Verdict::Reject(Reason::NoStore)
            );
        }
        // A directive merely containing the word is not the directive.
        let h = headers(&[("Cache-Control", "max-age=60, x-no-cache-hint")]);
        assert!(verdict(Method::Post, QUERY, StatusCode::OK, &h).is_cacheable());
    }

    #[test]
    fn past_expires_beats_max_age() {
        let h = headers(&[
            ("Cache-Control", "max-age=60"),
            ("Expires", "Thu, 01 Dec 1994 16:00:00 GMT"),
        ]);
        assert_eq!(
            verdict(Method::Post, QUERY, StatusCode::OK, &h),
            Verdict::Reject(Reason::Expired)
        );
    }

    #[test]
    fn future_or_garbage_expires_is_ignored() {
        let now = SystemTime::now();
        let future = httpdate::fmt_http_date(now + Duration::from_secs(3600));
        for expires in [future.as_str(), "0", "soon"] {
            let h = headers(&[("Cache-Control", "max-age=60"), ("Expires", expires)]);
            assert_eq!(
                evaluate_at(&Method::Post, QUERY.as_bytes(), StatusCode::OK, &h, 60, now),
                Verdict::Cacheable { ttl: 60 }
            );
        }
    }

    #[test]
    fn checks_are_independent() {
        // Every check fails at once; the first in order decides.
        let h = headers(&[("Cache-Control", "no-store")]);
        assert_eq!(
            verdict(Method::Get, "mutation", StatusCode::NOT_FOUND, &h),
            Verdict::Reject(Reason::NoTtl)
        );
        assert_eq!(
            evaluate(&Method::Get, b"mutation", StatusCode::NOT_FOUND, &h, 5),
            Verdict::Reject(Reason::Status(StatusCode::NOT_FOUND))
        );
    }
}
