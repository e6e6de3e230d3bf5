//! Static routing table for queue destinations.
//!
//! Call sites name a [`QueueRoute`]; the [`RouteTable`] resolves it to the
//! routing key used on the wire. Keys follow `data.<api>.<entity>` for fetch
//! requests and `processing.<stage>.<entity>` for downstream stages.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::EisenbahnError;

/// Pipeline phase a route belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueGroup {
    AutomatedChecks,
    Osu,
    OsuTrack,
    Stats,
}

/// Logical `(group, name)` destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueRoute {
    OsuPlayers,
    OsuMatches,
    OsuBeatmaps,
    OsuTrackPlayers,
    AutomatedChecksTournaments,
    StatsTournaments,
}

impl QueueRoute {
    pub const ALL: [QueueRoute; 6] = [
        QueueRoute::OsuPlayers,
        QueueRoute::OsuMatches,
        QueueRoute::OsuBeatmaps,
        QueueRoute::OsuTrackPlayers,
        QueueRoute::AutomatedChecksTournaments,
        QueueRoute::StatsTournaments,
    ];

    pub fn group(&self) -> QueueGroup {
        match self {
            QueueRoute::OsuPlayers | QueueRoute::OsuMatches | QueueRoute::OsuBeatmaps => {
                QueueGroup::Osu
            }
            QueueRoute::OsuTrackPlayers => QueueGroup::OsuTrack,
            QueueRoute::AutomatedChecksTournaments => QueueGroup::AutomatedChecks,
            QueueRoute::StatsTournaments => QueueGroup::Stats,
        }
    }

    /// Name within the group.
    pub fn name(&self) -> &'static str {
        match self {
            QueueRoute::OsuPlayers | QueueRoute::OsuTrackPlayers => "players",
            QueueRoute::OsuMatches => "matches",
            QueueRoute::OsuBeatmaps => "beatmaps",
            QueueRoute::AutomatedChecksTournaments | QueueRoute::StatsTournaments => "tournaments",
        }
    }
}

impl std::fmt::Display for QueueRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let group = match self.group() {
            QueueGroup::AutomatedChecks => "automatedChecks",
            QueueGroup::Osu => "osu",
            QueueGroup::OsuTrack => "osuTrack",
            QueueGroup::Stats => "stats",
        };
        write!(f, "{group}.{}", self.name())
    }
}

// ── Routing keys ─────────────────────────────────────────────────────

/// Player fetch requests against the osu! API.
pub const OSU_PLAYERS: &str = "data.osu.players";

/// Multiplayer match fetch requests against the osu! API.
pub const OSU_MATCHES: &str = "data.osu.matches";

/// Beatmap fetch requests against the osu! API.
pub const OSU_BEATMAPS: &str = "data.osu.beatmaps";

/// Player stat-history fetch requests against osu!track.
pub const OSUTRACK_PLAYERS: &str = "data.osutrack.players";

/// Tournament data ready for automated verification checks.
pub const AUTOMATED_CHECKS_TOURNAMENTS: &str = "processing.checks.tournaments";

/// Tournament data ready for statistics processing.
pub const STATS_TOURNAMENTS: &str = "processing.stats.tournaments";

/// One entry of the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDef {
    pub route: QueueRoute,
    pub key: &'static str,
    /// Where messages that could not be processed end up. Only request
    /// queues have one.
    pub dead_letter_key: Option<&'static str>,
}

const STANDARD_ROUTES: &[RouteDef] = &[
    RouteDef {
        route: QueueRoute::OsuPlayers,
        key: OSU_PLAYERS,
        dead_letter_key: Some("data.osu.players.dead-letter"),
    },
    RouteDef {
        route: QueueRoute::OsuMatches,
        key: OSU_MATCHES,
        dead_letter_key: Some("data.osu.matches.dead-letter"),
    },
    RouteDef {
        route: QueueRoute::OsuBeatmaps,
        key: OSU_BEATMAPS,
        dead_letter_key: Some("data.osu.beatmaps.dead-letter"),
    },
    RouteDef {
        route: QueueRoute::OsuTrackPlayers,
        key: OSUTRACK_PLAYERS,
        dead_letter_key: Some("data.osutrack.players.dead-letter"),
    },
    RouteDef {
        route: QueueRoute::AutomatedChecksTournaments,
        key: AUTOMATED_CHECKS_TOURNAMENTS,
        dead_letter_key: None,
    },
    RouteDef {
        route: QueueRoute::StatsTournaments,
        key: STATS_TOURNAMENTS,
        dead_letter_key: None,
    },
];

/// Validated lookup table from [`QueueRoute`] to wire keys.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: HashMap<QueueRoute, RouteDef>,
}

impl RouteTable {
    /// Build a table from explicit definitions.
    ///
    /// Fails if a route is defined twice, a routing key (including dead-letter
    /// keys) is reused, or a [`QueueRoute`] has no definition.
    pub fn from_defs(defs: &[RouteDef]) -> Result<Self, EisenbahnError> {
        let mut routes = HashMap::with_capacity(defs.len());
        let mut keys = HashSet::new();

        for def in defs {
            if routes.insert(def.route, def.clone()).is_some() {
                return Err(EisenbahnError::Config(format!("route '{}' defined twice", def.route)));
            }
            for key in std::iter::once(def.key).chain(def.dead_letter_key) {
                if key.is_empty() {
                    return Err(EisenbahnError::Config(format!(
                        "route '{}' has an empty routing key",
                        def.route
                    )));
                }
                if !keys.insert(key) {
                    return Err(EisenbahnError::Config(format!(
                        "routing key '{key}' is used by more than one destination"
                    )));
                }
            }
        }

        if let Some(missing) = QueueRoute::ALL.iter().find(|r| !routes.contains_key(r)) {
            return Err(EisenbahnError::Config(format!("route '{missing}' has no routing key")));
        }

        Ok(Self { routes })
    }

    /// The production routing table.
    pub fn standard() -> Self {
        // The standard definitions are covered by `standard_table_is_valid`.
        Self::from_defs(STANDARD_ROUTES).unwrap_or_else(|e| unreachable!("invalid standard routes: {e}"))
    }

    pub fn key(&self, route: QueueRoute) -> &'static str {
        self.def(route).key
    }

    pub fn dead_letter_key(&self, route: QueueRoute) -> Option<&'static str> {
        self.def(route).dead_letter_key
    }

    /// Reverse lookup, used when a consumer only knows the wire key.
    pub fn route_for_key(&self, key: &str) -> Option<QueueRoute> {
        self.routes.values().find(|d| d.key == key).map(|d| d.route)
    }

    /// Every wire key in the table, dead-letter keys included.
    pub fn all_keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<&'static str> = self
            .routes
            .values()
            .flat_map(|d| std::iter::once(d.key).chain(d.dead_letter_key))
            .collect();
        keys.sort_unstable();
        keys
    }

    fn def(&self, route: QueueRoute) -> &RouteDef {
        // from_defs guarantees every variant is present
        &self.routes[&route]
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::standard()
    }
}
