//! Static map data for the Gridvale server.
//!
//! Maps are consumed from the Tiled JSON export. Tile layers whose names
//! appear in the configured collision list block movement outright; otherwise
//! a tile's `walkable` property decides, defaulting to walkable. Object
//! layers carry the player spawn and entity spawn points. All map data is
//! immutable once loaded.

mod tiled;

use std::path::Path;

use gridvale_protocol::{MapId, TilePos};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::info;

pub use tiled::{
    Layer, MapObject, ObjectLayer, Property, PropertyValue, TileLayer, TiledDocument, Tileset,
    TilesetTile,
};

#[derive(Debug, Error)]
pub enum MapError {
    #[error("failed to read map file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse map document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown map {0:?}")]
    UnknownMap(String),
    #[error("map has no tile layers")]
    Empty,
}

/// One tile layer, with collision classification resolved at load time.
#[derive(Debug)]
pub struct MapLayer {
    pub name: String,
    pub is_collision: bool,
    /// Row-major global tile ids, `width * height` entries, zero = empty.
    gids: Vec<u32>,
}

impl MapLayer {
    pub fn gid_at(&self, width: u32, pos: TilePos) -> u32 {
        self.gids[pos.y as usize * width as usize + pos.x as usize]
    }
}

/// An entity spawn point extracted from an object layer.
#[derive(Clone, Debug, PartialEq)]
pub struct EntitySpawn {
    /// Index of this spawn point within the map; respawns reference it.
    pub spawn_point_id: u32,
    /// Entity kind name, resolved by the server's kind catalog.
    pub entity_id: String,
    pub position: TilePos,
    pub wander_radius: Option<u32>,
    pub aggro_override: Option<u32>,
    pub disengage_override: Option<u32>,
}

/// A chunk of map tiles for a client chunk query.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkData {
    pub chunk_x: i32,
    pub chunk_y: i32,
    pub size: u32,
    pub layers: Vec<ChunkLayerData>,
    /// Row-major walkability over the chunk grid. Out-of-bounds tiles are not
    /// walkable.
    pub walkable: Vec<bool>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChunkLayerData {
    pub name: String,
    pub is_collision: bool,
    pub gids: Vec<u32>,
}

/// A fully loaded, immutable map.
#[derive(Debug)]
pub struct GameMap {
    pub id: MapId,
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    layers: Vec<MapLayer>,
    /// Explicit `walkable` tile properties by global id. Tiles without an
    /// entry default to walkable.
    walkable_props: FxHashMap<u32, bool>,
    player_spawn: Option<TilePos>,
    entity_spawns: Vec<EntitySpawn>,
}

impl GameMap {
    /// Parses a Tiled JSON document. `collision_layer_names` are compared
    /// case-insensitively against layer names.
    pub fn from_document(
        id: MapId,
        doc: &TiledDocument,
        collision_layer_names: &[String],
    ) -> Result<Self, MapError> {
        let collision: FxHashSet<String> = collision_layer_names
            .iter()
            .map(|n| n.to_lowercase())
            .collect();

        let mut layers = Vec::new();
        let mut player_spawn = None;
        let mut entity_spawns = Vec::new();

        for layer in &doc.layers {
            match layer {
                tiled::Layer::Tile(tile_layer) => {
                    let mut gids = tile_layer.data.clone();
                    gids.resize((doc.width * doc.height) as usize, 0);
                    layers.push(MapLayer {
                        is_collision: collision.contains(&tile_layer.name.to_lowercase()),
                        name: tile_layer.name.clone(),
                        gids,
                    });
                }
                tiled::Layer::Object(object_layer) => {
                    for obj in &object_layer.objects {
                        let pos = TilePos::new(
                            (obj.x as i32).div_euclid(doc.tile_width as i32),
                            (obj.y as i32).div_euclid(doc.tile_height as i32),
                        );
                        match obj.name.as_str() {
                            // First player spawn wins.
                            "player_spawn" if player_spawn.is_none() => {
                                player_spawn = Some(pos);
                            }
                            "entity_spawn" => {
                                let Some(entity_id) = obj.string_property("entity_id") else {
                                    continue;
                                };
                                entity_spawns.push(EntitySpawn {
                                    spawn_point_id: entity_spawns.len() as u32,
                                    entity_id,
                                    position: pos,
                                    wander_radius: obj.int_property("wander_radius"),
                                    aggro_override: obj.int_property("aggro_override"),
                                    disengage_override: obj.int_property("disengage_override"),
                                });
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        if layers.is_empty() {
            return Err(MapError::Empty);
        }

        let mut walkable_props = FxHashMap::default();
        for tileset in &doc.tilesets {
            for tile in &tileset.tiles {
                if let Some(PropertyValue::Bool(walkable)) = tile.property("walkable") {
                    walkable_props.insert(tileset.first_gid + tile.id, *walkable);
                }
            }
        }

        Ok(Self {
            id,
            width: doc.width,
            height: doc.height,
            tile_width: doc.tile_width,
            tile_height: doc.tile_height,
            layers,
            walkable_props,
            player_spawn,
            entity_spawns,
        })
    }

    pub fn from_json(
        id: MapId,
        json: &str,
        collision_layer_names: &[String],
    ) -> Result<Self, MapError> {
        let doc: TiledDocument = serde_json::from_str(json)?;
        Self::from_document(id, &doc, collision_layer_names)
    }

    pub fn in_bounds(&self, pos: TilePos) -> bool {
        pos.x >= 0 && pos.y >= 0 && (pos.x as u32) < self.width && (pos.y as u32) < self.height
    }

    /// Whether a tile can be stepped on. Collision layers block on any
    /// non-empty tile; otherwise the topmost explicit `walkable` property
    /// decides; tiles with no opinion are walkable.
    pub fn is_walkable(&self, pos: TilePos) -> bool {
        if !self.in_bounds(pos) {
            return false;
        }

        for layer in &self.layers {
            if layer.is_collision && layer.gid_at(self.width, pos) != 0 {
                return false;
            }
        }

        for layer in &self.layers {
            if layer.is_collision {
                continue;
            }
            let gid = layer.gid_at(self.width, pos);
            if gid != 0 {
                if let Some(&walkable) = self.walkable_props.get(&gid) {
                    return walkable;
                }
            }
        }

        true
    }

    /// The designated player spawn, or a walkable tile found by spiral search
    /// from the map center.
    pub fn spawn_position(&self) -> TilePos {
        if let Some(pos) = self.player_spawn {
            return pos;
        }

        let center = TilePos::new(self.width as i32 / 2, self.height as i32 / 2);
        for radius in 0..(self.width.max(self.height) as i32) {
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    if dx.abs() != radius && dy.abs() != radius {
                        continue;
                    }
                    let pos = TilePos::new(center.x + dx, center.y + dy);
                    if self.is_walkable(pos) {
                        return pos;
                    }
                }
            }
        }

        TilePos::new(1, 1)
    }

    pub fn entity_spawns(&self) -> &[EntitySpawn] {
        &self.entity_spawns
    }

    /// Extracts one `size`×`size` chunk. Chunks may extend past the map edge;
    /// out-of-bounds cells read as empty and unwalkable.
    pub fn chunk(&self, chunk_x: i32, chunk_y: i32, size: u32) -> ChunkData {
        let size_i = size as i32;
        let origin_x = chunk_x * size_i;
        let origin_y = chunk_y * size_i;

        let mut layers: Vec<ChunkLayerData> = self
            .layers
            .iter()
            .map(|layer| ChunkLayerData {
                name: layer.name.clone(),
                is_collision: layer.is_collision,
                gids: Vec::with_capacity((size * size) as usize),
            })
            .collect();
        let mut walkable = Vec::with_capacity((size * size) as usize);

        for dy in 0..size_i {
            for dx in 0..size_i {
                let pos = TilePos::new(origin_x + dx, origin_y + dy);
                let inside = self.in_bounds(pos);
                for (out, layer) in layers.iter_mut().zip(&self.layers) {
                    out.gids
                        .push(if inside { layer.gid_at(self.width, pos) } else { 0 });
                }
                walkable.push(inside && self.is_walkable(pos));
            }
        }

        ChunkData {
            chunk_x,
            chunk_y,
            size,
            layers,
            walkable,
        }
    }

    /// All chunks within `radius` chunks of the chunk containing `center`.
    pub fn chunks_around(&self, center: TilePos, radius: u32, size: u32) -> Vec<ChunkData> {
        let size_i = size as i32;
        let center_cx = center.x.div_euclid(size_i);
        let center_cy = center.y.div_euclid(size_i);
        let r = radius as i32;

        let mut chunks = Vec::new();
        for cy in (center_cy - r)..=(center_cy + r) {
            for cx in (center_cx - r)..=(center_cx + r) {
                // Skip chunks fully outside the map.
                if cx < 0 || cy < 0 {
                    continue;
                }
                if cx * size_i >= self.width as i32 || cy * size_i >= self.height as i32 {
                    continue;
                }
                chunks.push(self.chunk(cx, cy, size));
            }
        }
        chunks
    }
}

/// Read-only registry of loaded maps.
#[derive(Debug, Default)]
pub struct MapService {
    maps: FxHashMap<MapId, GameMap>,
}

impl MapService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.json` map in a directory. The map id is the file stem.
    /// Blocking; call from a blocking context at startup.
    pub fn load_dir(
        dir: &Path,
        collision_layer_names: &[String],
    ) -> Result<Self, MapError> {
        let mut service = Self::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let json = std::fs::read_to_string(&path)?;
            let map = GameMap::from_json(MapId::from(stem), &json, collision_layer_names)?;
            info!(
                map_id = %map.id,
                width = map.width,
                height = map.height,
                entity_spawns = map.entity_spawns.len(),
                "loaded map"
            );
            service.insert(map);
        }

        Ok(service)
    }

    pub fn insert(&mut self, map: GameMap) {
        self.maps.insert(map.id.clone(), map);
    }

    pub fn get(&self, id: &MapId) -> Option<&GameMap> {
        self.maps.get(id)
    }

    pub fn require(&self, id: &MapId) -> Result<&GameMap, MapError> {
        self.get(id).ok_or_else(|| MapError::UnknownMap(id.0.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &GameMap> + '_ {
        self.maps.values()
    }

    /// Validates a single-tile step. Returns the destination if it is
    /// walkable.
    pub fn validate_step(
        &self,
        map_id: &MapId,
        from: TilePos,
        dir: gridvale_protocol::Direction,
    ) -> Result<Option<TilePos>, MapError> {
        let map = self.require(map_id)?;
        let to = from.step(dir);
        Ok(map.is_walkable(to).then_some(to))
    }
}

#[cfg(test)]
mod tests {
    use gridvale_protocol::Direction;
    use pretty_assertions::assert_eq;

    use super::*;

    fn collision_names() -> Vec<String> {
        vec!["collision".into(), "water".into()]
    }

    /// 4x3 map. Ground everywhere; collision layer blocks (2,1); tile gid 3
    /// carries walkable=false and sits at (3,0) on the detail layer.
    fn test_map() -> GameMap {
        let json = r##"{
            "width": 4,
            "height": 3,
            "tilewidth": 32,
            "tileheight": 32,
            "layers": [
                {
                    "type": "tilelayer",
                    "name": "ground",
                    "data": [1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1]
                },
                {
                    "type": "tilelayer",
                    "name": "detail",
                    "data": [0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 0]
                },
                {
                    "type": "tilelayer",
                    "name": "collision",
                    "data": [0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0, 0]
                },
                {
                    "type": "objectgroup",
                    "name": "spawns",
                    "objects": [
                        {"name": "player_spawn", "x": 32, "y": 64},
                        {
                            "name": "entity_spawn",
                            "x": 96,
                            "y": 64,
                            "properties": [
                                {"name": "entity_id", "type": "string", "value": "goblin"},
                                {"name": "wander_radius", "type": "int", "value": 5}
                            ]
                        }
                    ]
                }
            ],
            "tilesets": [
                {
                    "firstgid": 1,
                    "tiles": [
                        {
                            "id": 2,
                            "properties": [
                                {"name": "walkable", "type": "bool", "value": false}
                            ]
                        }
                    ]
                }
            ]
        }"##;

        GameMap::from_json(MapId::from("testmap"), json, &collision_names()).unwrap()
    }

    #[test]
    fn walkability() {
        let map = test_map();
        assert!(map.is_walkable(TilePos::new(0, 0)));
        // Collision layer tile.
        assert!(!map.is_walkable(TilePos::new(2, 1)));
        // Explicit walkable=false property (gid 3 = firstgid 1 + id 2).
        assert!(!map.is_walkable(TilePos::new(3, 0)));
        // Off the grid.
        assert!(!map.is_walkable(TilePos::new(-1, 0)));
        assert!(!map.is_walkable(TilePos::new(4, 0)));
        assert!(!map.is_walkable(TilePos::new(0, 3)));
    }

    #[test]
    fn spawn_extraction() {
        let map = test_map();
        assert_eq!(map.spawn_position(), TilePos::new(1, 2));

        let spawns = map.entity_spawns();
        assert_eq!(spawns.len(), 1);
        assert_eq!(spawns[0].entity_id, "goblin");
        assert_eq!(spawns[0].position, TilePos::new(3, 2));
        assert_eq!(spawns[0].wander_radius, Some(5));
        assert_eq!(spawns[0].aggro_override, None);
    }

    #[test]
    fn spiral_spawn_when_unmarked() {
        let json = r#"{
            "width": 2, "height": 2, "tilewidth": 32, "tileheight": 32,
            "layers": [{"type": "tilelayer", "name": "ground", "data": [1, 1, 1, 1]}],
            "tilesets": []
        }"#;
        let map = GameMap::from_json(MapId::from("bare"), json, &collision_names()).unwrap();
        assert_eq!(map.spawn_position(), TilePos::new(1, 1));
    }

    #[test]
    fn chunk_query() {
        let map = test_map();
        let chunk = map.chunk(0, 0, 2);
        assert_eq!(chunk.size, 2);
        assert_eq!(chunk.layers.len(), 3);
        assert_eq!(chunk.layers[0].name, "ground");
        assert!(!chunk.layers[0].is_collision);
        assert!(chunk.layers[2].is_collision);
        assert_eq!(chunk.layers[0].gids, vec![1, 1, 1, 1]);
        assert_eq!(chunk.walkable, vec![true, true, true, true]);

        // Chunk overlapping the collision tile at (2, 1).
        let chunk = map.chunk(1, 0, 2);
        assert_eq!(chunk.layers[2].gids, vec![0, 0, 2, 0]);
        assert_eq!(chunk.walkable, vec![true, false, false, true]);
    }

    #[test]
    fn chunks_around_clips_to_map() {
        let map = test_map();
        let chunks = map.chunks_around(TilePos::new(0, 0), 1, 2);
        // 4x3 map with size-2 chunks spans chunk columns 0..=1, rows 0..=1.
        assert_eq!(chunks.len(), 4);
    }

    #[test]
    fn validate_step() {
        let mut service = MapService::new();
        service.insert(test_map());
        let id = MapId::from("testmap");

        assert_eq!(
            service
                .validate_step(&id, TilePos::new(1, 1), Direction::Up)
                .unwrap(),
            Some(TilePos::new(1, 0))
        );
        // Into the collision tile.
        assert_eq!(
            service
                .validate_step(&id, TilePos::new(1, 1), Direction::Right)
                .unwrap(),
            None
        );
        // Off the map edge.
        assert_eq!(
            service
                .validate_step(&id, TilePos::new(0, 0), Direction::Up)
                .unwrap(),
            None
        );
        assert!(service
            .validate_step(&MapId::from("nope"), TilePos::new(0, 0), Direction::Up)
            .is_err());
    }
}
