//! SQL normalization, classification, and optimization hints.
//!
//! Normalization is literal-insensitive: two queries differing only in
//! their numeric or quoted literals normalize (and therefore hash)
//! identically. Hints are pure functions of the normalized text and the
//! observed timing.

use once_cell::sync::Lazy;
use regex::Regex;

/// Normalized SQL is capped at this many characters.
pub const MAX_NORMALIZED_LEN: usize = 1000;

#[allow(clippy::unwrap_used)]
static RE_STRING_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"'(?:[^']|'')*'|"[^"]*""#).unwrap());

#[allow(clippy::unwrap_used)]
static RE_NUMBER_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap());

#[allow(clippy::unwrap_used)]
static RE_ORDER_BY_DESC: Lazy<Regex> = Lazy::new(|| Regex::new(r"order by .+ desc").unwrap());

#[allow(clippy::unwrap_used)]
static RE_IN_LIST: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bin\s*\(([^)]+)\)").unwrap());

#[allow(clippy::unwrap_used)]
static RE_FUNCTION_IN_WHERE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"where\s+.*?\b(lower|upper|substr|substring|trim|date|year|month|day|cast|coalesce)\s*\(")
        .unwrap()
});

/// Lowercase, collapse whitespace, replace literals with `?`, cap length.
#[must_use]
pub fn normalize_sql(sql: &str) -> String {
    let lowered = sql.to_lowercase();
    let no_strings = RE_STRING_LITERAL.replace_all(&lowered, "?");
    let no_numbers = RE_NUMBER_LITERAL.replace_all(&no_strings, "?");
    let mut collapsed = no_numbers
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed.truncate(MAX_NORMALIZED_LEN);
    collapsed
}

/// Query class, assigned by ordered substring rules (first match wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryClass {
    Voting,
    Leaderboard,
    Tournament,
    User,
    Clan,
    Content,
    Other,
}

impl QueryClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Voting => "voting",
            Self::Leaderboard => "leaderboard",
            Self::Tournament => "tournament",
            Self::User => "user",
            Self::Clan => "clan",
            Self::Content => "content",
            Self::Other => "other",
        }
    }
}

/// Read/write sub-category for unclassified queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryVerb {
    Read,
    Write,
}

/// Monitoring priority per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueryPriority {
    Low,
    Medium,
    High,
}

/// Ordered substring classification over the normalized SQL.
#[must_use]
pub fn classify(normalized: &str) -> (QueryClass, Option<QueryVerb>) {
    if normalized.contains("voting") || normalized.contains("votes") {
        return (QueryClass::Voting, None);
    }
    if normalized.contains("leaderboard") || RE_ORDER_BY_DESC.is_match(normalized) {
        return (QueryClass::Leaderboard, None);
    }
    if normalized.contains("tournament") {
        return (QueryClass::Tournament, None);
    }
    if normalized.contains("users") || normalized.contains("user_") {
        return (QueryClass::User, None);
    }
    if normalized.contains("clan") {
        return (QueryClass::Clan, None);
    }
    if normalized.contains("content") {
        return (QueryClass::Content, None);
    }
    let verb = if normalized.starts_with("select") {
        QueryVerb::Read
    } else {
        QueryVerb::Write
    };
    (QueryClass::Other, Some(verb))
}

/// Class-to-priority mapping.
#[must_use]
pub fn priority_for(class: QueryClass) -> QueryPriority {
    match class {
        QueryClass::Voting | QueryClass::Leaderboard => QueryPriority::High,
        QueryClass::Tournament | QueryClass::User | QueryClass::Clan => QueryPriority::Medium,
        QueryClass::Content | QueryClass::Other => QueryPriority::Low,
    }
}

/// Hint severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintImpact {
    High,
    Medium,
}

/// What the hint recommends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintKind {
    UnboundedScan,
    NPlusOne,
    NonSargablePredicate,
    MissingIndex,
    CacheVotingResults,
    PrecomputeLeaderboard,
}

/// One optimization suggestion derived from a query.
#[derive(Debug, Clone)]
pub struct Hint {
    pub kind: HintKind,
    pub impact: HintImpact,
    pub message: String,
}

/// Literal count above which an `IN (…)` list reads as an N+1 pattern.
const IN_LIST_LIMIT: usize = 10;

/// Derive every applicable hint from a normalized query and its timing.
#[must_use]
pub fn hints_for(normalized: &str, exec_millis: u64, class: QueryClass) -> Vec<Hint> {
    let mut hints = Vec::new();

    if normalized.starts_with("select")
        && !normalized.contains(" where ")
        && !normalized.contains(" limit ")
    {
        hints.push(Hint {
            kind: HintKind::UnboundedScan,
            impact: HintImpact::High,
            message: "SELECT without WHERE or LIMIT scans the full table; bound the scan"
                .to_string(),
        });
    }

    if let Some(captures) = RE_IN_LIST.captures(normalized) {
        let items = captures
            .get(1)
            .map_or(0, |list| list.as_str().split(',').count());
        if items > IN_LIST_LIMIT {
            hints.push(Hint {
                kind: HintKind::NPlusOne,
                impact: HintImpact::Medium,
                message: format!(
                    "IN list with {items} values suggests an N+1 pattern; batch with a join"
                ),
            });
        }
    }

    if RE_FUNCTION_IN_WHERE.is_match(normalized) {
        hints.push(Hint {
            kind: HintKind::NonSargablePredicate,
            impact: HintImpact::Medium,
            message: "function call on a column in WHERE defeats the index; precompute the value"
                .to_string(),
        });
    }

    if normalized.contains("order by") && exec_millis > 2000 {
        hints.push(Hint {
            kind: HintKind::MissingIndex,
            impact: HintImpact::High,
            message: "slow ORDER BY; add an index covering the sort columns".to_string(),
        });
    }

    if class == QueryClass::Voting && exec_millis > 500 {
        hints.push(Hint {
            kind: HintKind::CacheVotingResults,
            impact: HintImpact::High,
            message: "slow voting query; cache results or maintain a materialized view"
                .to_string(),
        });
    }

    if class == QueryClass::Leaderboard && exec_millis > 1000 {
        hints.push(Hint {
            kind: HintKind::PrecomputeLeaderboard,
            impact: HintImpact::High,
            message: "slow leaderboard query; precompute into a ranking table or sorted set"
                .to_string(),
        });
    }

    hints
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_are_replaced_and_whitespace_collapsed() {
        let normalized = normalize_sql(
            "SELECT * FROM votes  WHERE user_id = 42   AND tx = 'burn-0x99' LIMIT 10",
        );
        assert_eq!(
            normalized,
            "select * from votes where user_id = ? and tx = ? limit ?"
        );
    }

    #[test]
    fn hash_is_stable_over_literal_values() {
        let a = normalize_sql("SELECT * FROM votes WHERE content_id = 1");
        let b = normalize_sql("SELECT * FROM votes WHERE content_id = 99123");
        assert_eq!(a, b);
        assert_eq!(crate::keys::short_hash(&a), crate::keys::short_hash(&b));
    }

    #[test]
    fn normalization_truncates_long_queries() {
        let long = format!("select {} from t", "c,".repeat(2000));
        assert!(normalize_sql(&long).len() <= MAX_NORMALIZED_LEN);
    }

    #[test]
    fn classification_order_is_first_match_wins() {
        assert_eq!(
            classify("select * from voting_rounds order by score desc").0,
            QueryClass::Voting
        );
        assert_eq!(
            classify("select * from scores order by points desc").0,
            QueryClass::Leaderboard
        );
        assert_eq!(classify("select * from tournaments").0, QueryClass::Tournament);
        assert_eq!(classify("select * from users where id = ?").0, QueryClass::User);
        assert_eq!(classify("select * from clans").0, QueryClass::Clan);
        assert_eq!(classify("update content_items set x = ?").0, QueryClass::Content);

        let (class, verb) = classify("select * from sessions");
        assert_eq!(class, QueryClass::Other);
        assert_eq!(verb, Some(QueryVerb::Read));
        let (_, verb) = classify("insert into sessions values (?)");
        assert_eq!(verb, Some(QueryVerb::Write));
    }

    #[test]
    fn priorities_follow_the_class_table() {
        assert_eq!(priority_for(QueryClass::Voting), QueryPriority::High);
        assert_eq!(priority_for(QueryClass::Leaderboard), QueryPriority::High);
        assert_eq!(priority_for(QueryClass::Tournament), QueryPriority::Medium);
        assert_eq!(priority_for(QueryClass::User), QueryPriority::Medium);
        assert_eq!(priority_for(QueryClass::Clan), QueryPriority::Medium);
        assert_eq!(priority_for(QueryClass::Content), QueryPriority::Low);
        assert_eq!(priority_for(QueryClass::Other), QueryPriority::Low);
    }

    #[test]
    fn unbounded_scan_hint() {
        let hints = hints_for("select * from sessions", 10, QueryClass::Other);
        assert!(hints.iter().any(|h| h.kind == HintKind::UnboundedScan));

        let bounded = hints_for("select * from sessions where id = ? limit ?", 10, QueryClass::Other);
        assert!(bounded.iter().all(|h| h.kind != HintKind::UnboundedScan));
    }

    #[test]
    fn in_list_hint_counts_literals() {
        let many = format!(
            "select * from sessions where id in ({})",
            vec!["?"; 15].join(",")
        );
        let hints = hints_for(&many, 10, QueryClass::Other);
        assert!(hints.iter().any(|h| h.kind == HintKind::NPlusOne));

        let few = "select * from sessions where id in (?,?,?)";
        assert!(hints_for(few, 10, QueryClass::Other)
            .iter()
            .all(|h| h.kind != HintKind::NPlusOne));
    }

    #[test]
    fn non_sargable_and_missing_index_hints() {
        let hints = hints_for(
            "select * from sessions where lower(name) = ? order by created limit ?",
            2500,
            QueryClass::Other,
        );
        assert!(hints.iter().any(|h| h.kind == HintKind::NonSargablePredicate));
        assert!(hints.iter().any(|h| h.kind == HintKind::MissingIndex));
    }

    #[test]
    fn gaming_hints_trigger_on_class_latency() {
        let voting = hints_for("select * from voting where id = ?", 600, QueryClass::Voting);
        assert!(voting.iter().any(|h| h.kind == HintKind::CacheVotingResults));

        let leaderboard = hints_for(
            "select * from leaderboard where season = ?",
            1500,
            QueryClass::Leaderboard,
        );
        assert!(leaderboard
            .iter()
            .any(|h| h.kind == HintKind::PrecomputeLeaderboard));
    }
}
