use serde_json::Value;

use crate::world::coordinate::ObjectLocation;

pub const OBJECT_CODE_KINGDOM: i64 = 20300101;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Occupant {
    pub display_name: Option<String>,
    pub alliance_tag: Option<String>,
    pub alliance_id: Option<String>,
    pub world_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldObject {
    pub id: Option<String>,
    pub code: Option<i64>,
    pub location: ObjectLocation,
    pub occupant: Option<Occupant>,
}

impl WorldObject {
    /// Lenient parse of one snapshot entry; only non-objects are rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let location = map
            .get("loc")
            .and_then(Value::as_array)
            .map(|parts| ObjectLocation::from_parts(parts))
            .unwrap_or_default();
        let occupant = map
            .get("occupied")
            .and_then(Value::as_object)
            .map(|occupied| Occupant {
                display_name: text_field(occupied.get("name")),
                alliance_tag: text_field(occupied.get("allianceTag")),
                alliance_id: text_field(occupied.get("allianceId")),
                world_id: text_field(occupied.get("worldId")),
            });
        Some(Self {
            id: text_field(map.get("_id")),
            code: map.get("code").and_then(code_field),
            location,
            occupant,
        })
    }

    pub fn is_kingdom(&self) -> bool {
        self.code == Some(OBJECT_CODE_KINGDOM)
    }
}

/// Objects of a decoded `/field/objects` payload (`{"objects": [...]}`).
pub fn parse_objects(payload: &Value) -> Vec<WorldObject> {
    payload
        .get("objects")
        .and_then(Value::as_array)
        .map(|objects| objects.iter().filter_map(WorldObject::from_value).collect())
        .unwrap_or_default()
}

fn text_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn code_field(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
