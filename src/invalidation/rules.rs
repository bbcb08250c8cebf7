//! Rule table and cascade graph: which cache regions an event touches.
//!
//! Every event maps to a set of root [`Aspect`] nodes plus the entity ids
//! bound from its payload. The cascade table extends the roots along
//! static dependency edges; the graph is cyclic (user profiles and clan
//! memberships invalidate each other), so expansion walks it with a
//! visited-set BFS and touches each node at most once per root event.

use std::collections::{BTreeSet, HashSet, VecDeque};

use crate::events::DomainEvent;
use crate::keys::Namespace;

/// One `(namespace, region)` node of the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Aspect {
    UserProfile,
    UserStats,
    UserContent,
    ClanMembers,
    ClanStats,
    ClanLeaderboards,
    UserLeaderboards,
    LeaderboardAll,
    VotingResults,
    ContentStats,
    ContentTrending,
    ContentTags,
    ContentSearch,
    TournamentBrackets,
    TournamentLeaderboard,
}

impl Aspect {
    #[must_use]
    pub fn namespace(self) -> Namespace {
        match self {
            Self::UserProfile | Self::UserStats => Namespace::User,
            Self::UserContent
            | Self::ContentStats
            | Self::ContentTrending
            | Self::ContentTags
            | Self::ContentSearch => Namespace::Content,
            Self::ClanMembers | Self::ClanStats => Namespace::Clan,
            Self::ClanLeaderboards | Self::UserLeaderboards | Self::LeaderboardAll => {
                Namespace::Leaderboard
            }
            Self::VotingResults => Namespace::Voting,
            Self::TournamentBrackets | Self::TournamentLeaderboard => Namespace::Tournament,
        }
    }

    /// Static cascade edges. Cycles are intentional and harmless: the
    /// expansion deduplicates visited nodes.
    #[must_use]
    pub fn cascades_to(self) -> &'static [Aspect] {
        match self {
            Self::UserProfile => &[Self::ClanMembers, Self::UserContent],
            Self::ClanMembers => &[Self::UserProfile, Self::ClanLeaderboards],
            Self::ContentStats | Self::ContentTags => &[Self::ContentTrending, Self::ContentSearch],
            _ => &[],
        }
    }
}

/// Entity ids bound from one event (or a merged batch of events of the same
/// kind). Sets keep the materialized action list duplicate-free.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    pub user_ids: BTreeSet<String>,
    pub clan_ids: BTreeSet<String>,
    pub content_ids: BTreeSet<String>,
    pub tournament_ids: BTreeSet<String>,
    pub tags: BTreeSet<String>,
}

impl Bindings {
    /// Fold one event's payload into this binding set.
    pub fn absorb(&mut self, event: &DomainEvent) {
        match event {
            DomainEvent::UserProfileUpdated { user_id, clan_ids } => {
                self.user_ids.insert(user_id.clone());
                self.clan_ids.extend(clan_ids.iter().cloned());
            }
            DomainEvent::VoteCast {
                user_id,
                content_id,
                clan_id,
            } => {
                self.user_ids.insert(user_id.clone());
                self.content_ids.insert(content_id.clone());
                if let Some(clan) = clan_id {
                    self.clan_ids.insert(clan.clone());
                }
            }
            DomainEvent::ClanMemberAdded { clan_id, user_id } => {
                self.clan_ids.insert(clan_id.clone());
                self.user_ids.insert(user_id.clone());
            }
            DomainEvent::ContentCreated { content_id, tags } => {
                self.content_ids.insert(content_id.clone());
                self.tags.extend(tags.iter().cloned());
            }
            DomainEvent::TournamentUpdated {
                tournament_id,
                participant_ids,
            } => {
                self.tournament_ids.insert(tournament_id.clone());
                self.user_ids.extend(participant_ids.iter().cloned());
            }
            DomainEvent::LeaderboardRefresh => {}
        }
    }
}

/// One concrete invalidation: a namespace plus a principal-and-tail glob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Action {
    pub namespace: Namespace,
    pub pattern: String,
}

impl Action {
    fn new(namespace: Namespace, pattern: impl Into<String>) -> Self {
        Self {
            namespace,
            pattern: pattern.into(),
        }
    }
}

/// Root aspects for an event kind. Exhaustive over the event enum.
#[must_use]
pub fn root_aspects(event: &DomainEvent) -> Vec<Aspect> {
    match event {
        DomainEvent::UserProfileUpdated { .. } => {
            vec![Aspect::UserProfile, Aspect::ClanMembers, Aspect::UserLeaderboards]
        }
        DomainEvent::VoteCast { clan_id, .. } => {
            let mut roots = vec![
                Aspect::VotingResults,
                Aspect::ContentStats,
                Aspect::LeaderboardAll,
                Aspect::UserStats,
            ];
            if clan_id.is_some() {
                roots.push(Aspect::ClanStats);
            }
            roots
        }
        DomainEvent::ClanMemberAdded { .. } => vec![
            Aspect::ClanMembers,
            Aspect::ClanStats,
            Aspect::UserProfile,
            Aspect::ClanLeaderboards,
        ],
        DomainEvent::ContentCreated { .. } => {
            vec![Aspect::ContentTrending, Aspect::ContentTags]
        }
        DomainEvent::TournamentUpdated { .. } => vec![
            Aspect::TournamentBrackets,
            Aspect::TournamentLeaderboard,
            Aspect::UserProfile,
        ],
        DomainEvent::LeaderboardRefresh => vec![Aspect::LeaderboardAll],
    }
}

/// Expand roots along the cascade graph. Visited-set BFS; terminates on
/// cycles and visits each aspect at most once.
#[must_use]
pub fn expand_cascade(roots: &[Aspect]) -> Vec<Aspect> {
    let mut visited: HashSet<Aspect> = HashSet::new();
    let mut ordered = Vec::new();
    let mut queue: VecDeque<Aspect> = VecDeque::new();

    for &root in roots {
        if visited.insert(root) {
            ordered.push(root);
            queue.push_back(root);
        }
    }

    while let Some(aspect) = queue.pop_front() {
        for &next in aspect.cascades_to() {
            if visited.insert(next) {
                ordered.push(next);
                queue.push_back(next);
            }
        }
    }

    ordered
}

/// Materialize an aspect into concrete actions given the bound entity ids.
/// Wildcard-only aspects ignore the bindings.
#[must_use]
pub fn materialize(aspect: Aspect, bindings: &Bindings) -> Vec<Action> {
    let ns = aspect.namespace();
    match aspect {
        Aspect::UserProfile => bindings
            .user_ids
            .iter()
            .map(|u| Action::new(ns, format!("*profile/{u}*")))
            .collect(),
        Aspect::UserStats => bindings
            .user_ids
            .iter()
            .map(|u| Action::new(ns, format!("*stats/{u}*")))
            .collect(),
        Aspect::UserContent => bindings
            .user_ids
            .iter()
            .map(|u| Action::new(ns, format!("*by-user/{u}*")))
            .collect(),
        Aspect::ClanMembers => bindings
            .clan_ids
            .iter()
            .map(|c| Action::new(ns, format!("*members/{c}*")))
            .collect(),
        Aspect::ClanStats => bindings
            .clan_ids
            .iter()
            .map(|c| Action::new(ns, format!("*stats/{c}*")))
            .collect(),
        Aspect::ClanLeaderboards => vec![Action::new(ns, "*clans*")],
        Aspect::UserLeaderboards => vec![Action::new(ns, "*users*")],
        Aspect::LeaderboardAll => vec![Action::new(ns, "*")],
        Aspect::VotingResults => bindings
            .content_ids
            .iter()
            .map(|c| Action::new(ns, format!("*results/{c}*")))
            .collect(),
        Aspect::ContentStats => bindings
            .content_ids
            .iter()
            .map(|c| Action::new(ns, format!("*stats/{c}*")))
            .collect(),
        Aspect::ContentTrending => vec![Action::new(ns, "*trending*")],
        Aspect::ContentTags => bindings
            .tags
            .iter()
            .map(|t| Action::new(ns, format!("*tag/{t}*")))
            .collect(),
        Aspect::ContentSearch => vec![Action::new(ns, "*search*")],
        Aspect::TournamentBrackets => bindings
            .tournament_ids
            .iter()
            .map(|t| Action::new(ns, format!("*brackets/{t}*")))
            .collect(),
        Aspect::TournamentLeaderboard => bindings
            .tournament_ids
            .iter()
            .map(|t| Action::new(ns, format!("*leaderboard/{t}*")))
            .collect(),
    }
}

/// Full pipeline: roots, cascade expansion, materialization, dedup.
#[must_use]
pub fn actions_for(roots: &[Aspect], bindings: &Bindings) -> Vec<Action> {
    let aspects = expand_cascade(roots);
    let mut seen = HashSet::new();
    let mut actions = Vec::new();
    for aspect in aspects {
        for action in materialize(aspect, bindings) {
            if seen.insert(action.clone()) {
                actions.push(action);
            }
        }
    }
    actions
}
