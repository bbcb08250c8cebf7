//! Domain events consumed by the invalidation bus.
//!
//! Events are tagged variants with explicit payload shapes; the rule table
//! in the invalidation module is an exhaustive match over this enum.

use serde::{Deserialize, Serialize};

/// A mutation somewhere in the platform that caches must react to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A user edited their profile.
    UserProfileUpdated {
        user_id: String,
        /// Clans the user belongs to, for membership-cache invalidation.
        clan_ids: Vec<String>,
    },
    /// A burn-to-vote ballot landed.
    VoteCast {
        user_id: String,
        content_id: String,
        clan_id: Option<String>,
    },
    /// A user joined a clan.
    ClanMemberAdded { clan_id: String, user_id: String },
    /// New content was submitted.
    ContentCreated {
        content_id: String,
        tags: Vec<String>,
    },
    /// A tournament bracket or standing changed.
    TournamentUpdated {
        tournament_id: String,
        participant_ids: Vec<String>,
    },
    /// Blanket leaderboard refresh.
    LeaderboardRefresh,
}

/// Discriminant used for filter tokens and batch keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    UserProfileUpdated,
    VoteCast,
    ClanMemberAdded,
    ContentCreated,
    TournamentUpdated,
    LeaderboardRefresh,
}

impl DomainEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::UserProfileUpdated { .. } => EventKind::UserProfileUpdated,
            Self::VoteCast { .. } => EventKind::VoteCast,
            Self::ClanMemberAdded { .. } => EventKind::ClanMemberAdded,
            Self::ContentCreated { .. } => EventKind::ContentCreated,
            Self::TournamentUpdated { .. } => EventKind::TournamentUpdated,
            Self::LeaderboardRefresh => EventKind::LeaderboardRefresh,
        }
    }

    /// Entity id that batches coalesce on.
    #[must_use]
    pub fn primary_entity(&self) -> Option<&str> {
        match self {
            Self::UserProfileUpdated { user_id, .. } | Self::VoteCast { user_id, .. } => {
                Some(user_id)
            }
            Self::ClanMemberAdded { clan_id, .. } => Some(clan_id),
            Self::ContentCreated { content_id, .. } => Some(content_id),
            Self::TournamentUpdated { tournament_id, .. } => Some(tournament_id),
            Self::LeaderboardRefresh => None,
        }
    }

    /// Token the duplicate filter keys on. Finer-grained than the batch key
    /// for votes so distinct ballots from one user still aggregate.
    #[must_use]
    pub fn filter_token(&self) -> String {
        match self {
            Self::VoteCast {
                user_id,
                content_id,
                ..
            } => format!("vote:{user_id}:{content_id}"),
            other => format!(
                "{:?}:{}",
                other.kind(),
                other.primary_entity().unwrap_or("-")
            ),
        }
    }

    /// High-priority events are dispatched within the invalidation delay;
    /// the rest wait for the batch window.
    #[must_use]
    pub fn is_high_priority(&self) -> bool {
        matches!(
            self,
            Self::VoteCast { .. } | Self::TournamentUpdated { .. } | Self::LeaderboardRefresh
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = DomainEvent::VoteCast {
            user_id: "U7".into(),
            content_id: "C42".into(),
            clan_id: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"vote_cast\""));
        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), EventKind::VoteCast);
    }

    #[test]
    fn vote_filter_token_includes_content() {
        let a = DomainEvent::VoteCast {
            user_id: "U7".into(),
            content_id: "C1".into(),
            clan_id: None,
        };
        let b = DomainEvent::VoteCast {
            user_id: "U7".into(),
            content_id: "C2".into(),
            clan_id: None,
        };
        assert_ne!(a.filter_token(), b.filter_token());
        assert_eq!(a.primary_entity(), b.primary_entity());
    }
}
