//! Serde model for the subset of the Tiled JSON export the server consumes.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct TiledDocument {
    pub width: u32,
    pub height: u32,
    #[serde(rename = "tilewidth")]
    pub tile_width: u32,
    #[serde(rename = "tileheight")]
    pub tile_height: u32,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub tilesets: Vec<Tileset>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Layer {
    #[serde(rename = "tilelayer")]
    Tile(TileLayer),
    #[serde(rename = "objectgroup")]
    Object(ObjectLayer),
}

#[derive(Debug, Deserialize)]
pub struct TileLayer {
    pub name: String,
    /// Row-major global tile ids; zero means no tile.
    #[serde(default)]
    pub data: Vec<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ObjectLayer {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub objects: Vec<MapObject>,
}

/// An object on an object layer. Coordinates are pixels; callers convert to
/// tiles by integer division by the map tile size.
#[derive(Debug, Deserialize)]
pub struct MapObject {
    #[serde(default)]
    pub name: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl MapObject {
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }

    pub fn string_property(&self, name: &str) -> Option<String> {
        match self.property(name)? {
            PropertyValue::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn int_property(&self, name: &str) -> Option<u32> {
        match self.property(name)? {
            PropertyValue::Int(n) if *n >= 0 => Some(*n as u32),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Tileset {
    #[serde(rename = "firstgid")]
    pub first_gid: u32,
    #[serde(default)]
    pub tiles: Vec<TilesetTile>,
}

/// Per-tile metadata inside a tileset. `id` is local to the tileset; add the
/// tileset's `firstgid` to obtain the global id.
#[derive(Debug, Deserialize)]
pub struct TilesetTile {
    pub id: u32,
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl TilesetTile {
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }
}

#[derive(Debug, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: PropertyValue,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_properties() {
        let json = r#"{
            "name": "entity_spawn",
            "x": 64.0,
            "y": 32,
            "properties": [
                {"name": "entity_id", "type": "string", "value": "rat"},
                {"name": "wander_radius", "type": "int", "value": 3},
                {"name": "aggressive", "type": "bool", "value": true}
            ]
        }"#;
        let obj: MapObject = serde_json::from_str(json).unwrap();
        assert_eq!(obj.string_property("entity_id").as_deref(), Some("rat"));
        assert_eq!(obj.int_property("wander_radius"), Some(3));
        assert!(matches!(
            obj.property("aggressive"),
            Some(PropertyValue::Bool(true))
        ));
        assert!(obj.property("missing").is_none());
    }
}
