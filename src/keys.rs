//! Namespaces, principals, and deterministic cache-key derivation.
//!
//! Key scheme: `{env?}:{app}:{namespace}:{principal}:{tail}[:v{n}]` where
//! the tail is the canonicalized logical key. Tails longer than
//! [`MAX_TAIL_LEN`] are replaced by a 16-hex-char hash of the full
//! serialization so the observable prefix is preserved while the key stays
//! bounded.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Longest tail stored verbatim before hashing kicks in.
pub const MAX_TAIL_LEN: usize = 100;

/// Logical partitions of the keyspace, one per API family. Closed set; each
/// carries its production default TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Voting,
    Leaderboard,
    Clan,
    User,
    Content,
    Tournament,
    Session,
    General,
    Static,
}

impl Namespace {
    /// Key-segment prefix for this namespace.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Voting => "api:voting",
            Self::Leaderboard => "api:leaderboard",
            Self::Clan => "api:clan",
            Self::User => "api:user",
            Self::Content => "api:content",
            Self::Tournament => "api:tournament",
            Self::Session => "session",
            Self::General => "general",
            Self::Static => "static",
        }
    }

    /// Default TTL applied when the caller does not supply one.
    #[must_use]
    pub fn default_ttl(self) -> Duration {
        match self {
            Self::Voting => Duration::from_secs(5),
            Self::Leaderboard => Duration::from_secs(30),
            Self::Clan => Duration::from_secs(120),
            Self::User | Self::Session | Self::General => Duration::from_secs(300),
            Self::Content | Self::Tournament => Duration::from_secs(60),
            Self::Static => Duration::from_secs(3600),
        }
    }

    /// All namespaces, for iteration in diagnostics.
    #[must_use]
    pub fn all() -> &'static [Namespace] {
        &[
            Self::Voting,
            Self::Leaderboard,
            Self::Clan,
            Self::User,
            Self::Content,
            Self::Tournament,
            Self::Session,
            Self::General,
            Self::Static,
        ]
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// The principal a cached value belongs to. Anonymous traffic shares one
/// partition; authenticated traffic is partitioned per user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    Anonymous,
    User(String),
}

impl Principal {
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Anonymous => "anonymous",
            Self::User(id) => id,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Principal {
    fn default() -> Self {
        Self::Anonymous
    }
}

/// Canonicalize query parameters: lexicographic sort by key (then value for
/// repeated keys) with a stable percent-encoded scalar form. Two maps that
/// differ only in field order canonicalize identically.
#[must_use]
pub fn canonical_query(params: &[(String, String)]) -> String {
    let mut pairs: Vec<(&str, &str)> = params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    pairs.sort();
    let encoded: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    encoded.join("&")
}

/// First 16 hex chars of the MD5 of `input`; used for key tails and query
/// hashes.
#[must_use]
pub fn short_hash(input: &str) -> String {
    let digest = md5::compute(input.as_bytes());
    let mut hash = format!("{digest:x}");
    hash.truncate(16);
    hash
}

/// Derive the full store key for a logical key inside a namespace.
#[must_use]
pub fn derive_key(
    env_prefix: Option<&str>,
    app_prefix: &str,
    namespace: Namespace,
    principal: &Principal,
    logical: &str,
    version: Option<u32>,
) -> String {
    let tail = if logical.len() > MAX_TAIL_LEN {
        short_hash(logical)
    } else {
        logical.to_string()
    };

    let mut key = String::with_capacity(64 + tail.len());
    if let Some(env) = env_prefix {
        key.push_str(env);
        key.push(':');
    }
    key.push_str(app_prefix);
    key.push(':');
    key.push_str(namespace.prefix());
    key.push(':');
    key.push_str(principal.as_str());
    key.push(':');
    key.push_str(&tail);
    if let Some(v) = version {
        key.push_str(":v");
        key.push_str(&v.to_string());
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let p = Principal::user("U7");
        let a = derive_key(None, "mlg", Namespace::Voting, &p, "results/C42", None);
        let b = derive_key(None, "mlg", Namespace::Voting, &p, "results/C42", None);
        assert_eq!(a, b);
        assert_eq!(a, "mlg:api:voting:U7:results/C42");
    }

    #[test]
    fn query_canonicalization_is_order_insensitive() {
        let q1 = canonical_query(&[
            ("limit".into(), "50".into()),
            ("sort".into(), "desc".into()),
        ]);
        let q2 = canonical_query(&[
            ("sort".into(), "desc".into()),
            ("limit".into(), "50".into()),
        ]);
        assert_eq!(q1, q2);
        assert_eq!(q1, "limit=50&sort=desc");
    }

    #[test]
    fn long_tails_are_hashed_with_prefix_preserved() {
        let p = Principal::Anonymous;
        let logical = "q".repeat(MAX_TAIL_LEN + 1);
        let key = derive_key(Some("prod"), "mlg", Namespace::Leaderboard, &p, &logical, None);
        assert!(key.starts_with("prod:mlg:api:leaderboard:anonymous:"));
        let tail = key.rsplit(':').next().unwrap();
        assert_eq!(tail.len(), 16);
        assert!(tail.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn version_suffix_is_appended() {
        let key = derive_key(
            None,
            "mlg",
            Namespace::User,
            &Principal::user("U1"),
            "profile/U1",
            Some(3),
        );
        assert!(key.ends_with(":v3"));
    }

    #[test]
    fn namespace_ttl_table_is_closed() {
        assert_eq!(Namespace::Voting.default_ttl(), Duration::from_secs(5));
        assert_eq!(Namespace::Leaderboard.default_ttl(), Duration::from_secs(30));
        assert_eq!(Namespace::Clan.default_ttl(), Duration::from_secs(120));
        assert_eq!(Namespace::User.default_ttl(), Duration::from_secs(300));
        assert_eq!(Namespace::Content.default_ttl(), Duration::from_secs(60));
        assert_eq!(Namespace::Tournament.default_ttl(), Duration::from_secs(60));
        assert_eq!(Namespace::Session.default_ttl(), Duration::from_secs(300));
        assert_eq!(Namespace::General.default_ttl(), Duration::from_secs(300));
        assert_eq!(Namespace::Static.default_ttl(), Duration::from_secs(3600));
    }
}
