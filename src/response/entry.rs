//! Stored response envelope and the conditional-request primitives.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BackboneError, Result};
use crate::keys::Namespace;

/// Strong entity tag: hex SHA-256 over the uncompressed body.
#[must_use]
pub fn compute_etag(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Format a unix timestamp as an HTTP-date (`Tue, 01 Aug 2026 00:00:00 GMT`).
#[must_use]
pub fn http_date(unix_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(unix_secs, 0)
        .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .unwrap_or_default()
}

/// Parse an HTTP-date back to a unix timestamp.
#[must_use]
pub fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp())
}

/// A memoized HTTP response as stored in the shared store.
///
/// Invariants: `expires_at = created_at + ttl_secs`; `etag` is a pure
/// function of the uncompressed body; when `compressed` is set, the body
/// inflates to a non-empty payload whose ETag matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEntry {
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    pub compressed: bool,
    pub status: u16,
    pub content_type: String,
    pub etag: String,
    pub last_modified: i64,
    pub created_at: i64,
    pub expires_at: i64,
    pub ttl_secs: u64,
    pub origin_namespace: Namespace,
    pub origin_endpoint: String,
}

impl ResponseEntry {
    /// Remaining freshness in seconds at `now`; 0 once expired.
    #[must_use]
    pub fn remaining_secs(&self, now: i64) -> u64 {
        u64::try_from(self.expires_at - now).unwrap_or(0)
    }

    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Body as sent to a client that accepts the stored encoding.
    #[must_use]
    pub fn body_bytes(&self) -> Bytes {
        Bytes::from(self.body.clone())
    }

    /// The uncompressed body, inflating when needed.
    pub fn uncompressed_body(&self) -> Result<Vec<u8>> {
        if self.compressed {
            crate::compress::gunzip(&self.body).map_err(|e| BackboneError::DecompressFailed {
                key: self.origin_endpoint.clone(),
                reason: e.to_string(),
            })
        } else {
            Ok(self.body.clone())
        }
    }

    /// Whether `If-None-Match` matches this entry's ETag. Accepts both the
    /// quoted and bare forms and the `*` wildcard.
    #[must_use]
    pub fn etag_matches(&self, if_none_match: &str) -> bool {
        if if_none_match.trim() == "*" {
            return true;
        }
        if_none_match
            .split(',')
            .map(|candidate| candidate.trim().trim_start_matches("W/").trim_matches('"'))
            .any(|candidate| candidate == self.etag)
    }

    /// Whether `If-Modified-Since` covers this entry's modification time.
    #[must_use]
    pub fn not_modified_since(&self, if_modified_since: &str) -> bool {
        parse_http_date(if_modified_since).is_some_and(|since| since >= self.last_modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(etag: &str, last_modified: i64) -> ResponseEntry {
        ResponseEntry {
            body: b"{}".to_vec(),
            compressed: false,
            status: 200,
            content_type: "application/json".to_string(),
            etag: etag.to_string(),
            last_modified,
            created_at: last_modified,
            expires_at: last_modified + 30,
            ttl_secs: 30,
            origin_namespace: Namespace::Leaderboard,
            origin_endpoint: "/api/leaderboard/users".to_string(),
        }
    }

    #[test]
    fn etag_is_pure_function_of_body() {
        assert_eq!(compute_etag(b"abc"), compute_etag(b"abc"));
        assert_ne!(compute_etag(b"abc"), compute_etag(b"abd"));
    }

    #[test]
    fn http_date_round_trips() {
        let ts = 1_754_006_400; // 2025-08-01T00:00:00Z
        let formatted = http_date(ts);
        assert!(formatted.ends_with("GMT"));
        assert_eq!(parse_http_date(&formatted), Some(ts));
    }

    #[test]
    fn if_none_match_accepts_quoted_and_lists() {
        let e = entry("deadbeef", 1_000);
        assert!(e.etag_matches("\"deadbeef\""));
        assert!(e.etag_matches("deadbeef"));
        assert!(e.etag_matches("\"other\", \"deadbeef\""));
        assert!(e.etag_matches("*"));
        assert!(!e.etag_matches("\"other\""));
    }

    #[test]
    fn if_modified_since_comparison() {
        let e = entry("x", 1_754_006_400);
        assert!(e.not_modified_since(&http_date(1_754_006_400)));
        assert!(e.not_modified_since(&http_date(1_754_006_500)));
        assert!(!e.not_modified_since(&http_date(1_754_006_300)));
    }

    #[test]
    fn expiry_accounting() {
        let e = entry("x", 1_000);
        assert_eq!(e.remaining_secs(1_000), 30);
        assert_eq!(e.remaining_secs(1_020), 10);
        assert!(e.is_expired(1_030));
        assert_eq!(e.remaining_secs(2_000), 0);
    }
}
