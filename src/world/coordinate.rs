use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

use crate::world::filter::UNKNOWN_COORDINATE;

/// Tile position on one world shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub world_id: i64,
    pub x: u32,
    pub y: u32,
}

impl Coordinate {
    pub fn new(world_id: i64, x: u32, y: u32) -> Self {
        Self { world_id, x, y }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "world {} ({}, {})", self.world_id, self.x, self.y)
    }
}

/// Location as carried by an object snapshot (`loc: [world, x, y]`); any
/// component may be missing. Missing components serialize as
/// [`UNKNOWN_COORDINATE`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ObjectLocation {
    #[serde(serialize_with = "part_or_unknown")]
    pub world: Option<i64>,
    #[serde(serialize_with = "part_or_unknown")]
    pub x: Option<i64>,
    #[serde(serialize_with = "part_or_unknown")]
    pub y: Option<i64>,
}

fn part_or_unknown<S: Serializer>(part: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
    match part {
        Some(value) => serializer.serialize_i64(*value),
        None => serializer.serialize_str(UNKNOWN_COORDINATE),
    }
}

impl ObjectLocation {
    pub fn from_parts(parts: &[serde_json::Value]) -> Self {
        let at = |idx: usize| parts.get(idx).and_then(serde_json::Value::as_i64);
        Self {
            world: at(0),
            x: at(1),
            y: at(2),
        }
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        let x = u32::try_from(self.x?).ok()?;
        let y = u32::try_from(self.y?).ok()?;
        Some(Coordinate::new(self.world?, x, y))
    }
}
