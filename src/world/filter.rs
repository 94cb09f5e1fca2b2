use std::fmt;
use std::fmt::Write as _;

use serde::Serialize;

use crate::world::coordinate::ObjectLocation;
use crate::world::objects::WorldObject;

pub const UNKNOWN_PLAYER: &str = "Unknown";
pub const NO_ALLIANCE: &str = "No Alliance";
pub const UNKNOWN_COORDINATE: &str = "Unknown";

/// Predicate over a lowercased occupant display name.
pub type NamePredicate = dyn Fn(&str) -> bool + Send + Sync;

/// Kingdom whose occupant matched a search.
///
/// Missing snapshot fields are filled with placeholders: `player_name` is
/// [`UNKNOWN_PLAYER`], `alliance_tag` is [`NO_ALLIANCE`], `alliance_id` and
/// `world_id` are empty, and absent coordinates render as
/// [`UNKNOWN_COORDINATE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchRecord {
    pub player_name: String,
    pub alliance_tag: String,
    pub coordinates: ObjectLocation,
    pub alliance_id: String,
    pub world_id: String,
}

impl MatchRecord {
    fn from_object(object: &WorldObject) -> Option<Self> {
        let occupant = object.occupant.as_ref()?;
        Some(Self {
            player_name: occupant
                .display_name
                .clone()
                .unwrap_or_else(|| UNKNOWN_PLAYER.to_string()),
            alliance_tag: occupant
                .alliance_tag
                .clone()
                .unwrap_or_else(|| NO_ALLIANCE.to_string()),
            coordinates: object.location,
            alliance_id: occupant.alliance_id.clone().unwrap_or_default(),
            world_id: occupant.world_id.clone().unwrap_or_default(),
        })
    }
}

struct Part(Option<i64>);

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => write!(f, "{value}"),
            None => f.write_str(UNKNOWN_COORDINATE),
        }
    }
}

impl fmt::Display for MatchRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) at ({}, {})",
            self.player_name,
            self.alliance_tag,
            Part(self.coordinates.x),
            Part(self.coordinates.y)
        )
    }
}

/// Occupied kingdoms whose lowercased display name satisfies `predicate`,
/// in snapshot order.
pub fn matches(objects: &[WorldObject], predicate: &NamePredicate) -> Vec<MatchRecord> {
    objects
        .iter()
        .filter(|object| object.is_kingdom())
        .filter(|object| {
            object.occupant.as_ref().is_some_and(|occupant| {
                let name = occupant.display_name.as_deref().unwrap_or("");
                predicate(&name.to_lowercase())
            })
        })
        .filter_map(MatchRecord::from_object)
        .collect()
}

/// Case-insensitive substring match on the display name.
pub fn name_contains(query: &str) -> impl Fn(&str) -> bool + Send + Sync + 'static {
    let needle = query.to_lowercase();
    move |name: &str| name.contains(&needle)
}

/// Human-readable listing of scan results.
pub fn render_matches(query: &str, records: &[MatchRecord]) -> String {
    let mut out = String::new();
    if records.is_empty() {
        let _ = writeln!(out, "No kingdoms found with player name matching '{query}'");
        return out;
    }
    let _ = writeln!(
        out,
        "Found {} kingdom(s) with player name matching '{query}':",
        records.len()
    );
    let _ = writeln!(out, "{}", "=".repeat(80));
    for (idx, record) in records.iter().enumerate() {
        let _ = writeln!(out, "{}. Player: {}", idx + 1, record.player_name);
        let _ = writeln!(out, "   Alliance: {}", record.alliance_tag);
        let _ = writeln!(
            out,
            "   Coordinates: ({}, {})",
            Part(record.coordinates.x),
            Part(record.coordinates.y)
        );
        let _ = writeln!(out, "   World: {}", Part(record.coordinates.world));
        if !record.alliance_id.is_empty() {
            let _ = writeln!(out, "   Alliance ID: {}", record.alliance_id);
        }
        let _ = writeln!(out, "{}", "-".repeat(40));
    }
    out
}
