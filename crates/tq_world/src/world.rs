//! The process-wide world: every map plus the global entity directory.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::entity::{EntityData, EntityKind, GroundItem, MapEntity, Monster, Npc, Player};
use crate::map::Map;
use crate::position::Position;
use crate::WorldError;

/// First object id handed out. Ids below the base are reserved for
/// system objects.
pub const OBJECT_ID_BASE: u32 = 10_002;

/// Owns all maps and the directory of every live entity.
pub struct GameWorld {
    maps: RwLock<FxHashMap<u16, Arc<Map>>>,
    directory: RwLock<FxHashMap<u32, Arc<MapEntity>>>,
    next_object_id: AtomicU32,
    next_index_id: AtomicU32,
}

impl GameWorld {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(FxHashMap::default()),
            directory: RwLock::new(FxHashMap::default()),
            next_object_id: AtomicU32::new(OBJECT_ID_BASE),
            next_index_id: AtomicU32::new(1),
        }
    }

    /// Registers a map, replacing any previous map with the same id.
    pub fn add_map(&self, map: Map) -> Arc<Map> {
        let map = Arc::new(map);
        self.maps.write().insert(map.id(), Arc::clone(&map));
        info!(map = map.id(), width = map.width(), height = map.height(), "map registered");
        map
    }

    pub fn map(&self, map_id: u16) -> Option<Arc<Map>> {
        self.maps.read().get(&map_id).cloned()
    }

    pub fn map_count(&self) -> usize {
        self.maps.read().len()
    }

    pub fn entity(&self, object_id: u32) -> Option<Arc<MapEntity>> {
        self.directory.read().get(&object_id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.directory.read().len()
    }

    fn allocate_ids(&self) -> (u32, u32) {
        (
            self.next_object_id.fetch_add(1, Ordering::Relaxed),
            self.next_index_id.fetch_add(1, Ordering::Relaxed),
        )
    }

    /// Creates a player entity for a connection. The entity is not on any
    /// map until [`GameWorld::spawn`] places it.
    pub fn create_player(&self, client_id: u64, name: impl Into<String>) -> Arc<MapEntity> {
        let (object_id, index_id) = self.allocate_ids();
        Arc::new(MapEntity::new(
            object_id,
            index_id,
            EntityKind::Player,
            EntityData::Player(Mutex::new(Player::new(client_id, name))),
        ))
    }

    pub fn create_monster(&self, monster: Monster) -> Arc<MapEntity> {
        let (object_id, index_id) = self.allocate_ids();
        Arc::new(MapEntity::new(
            object_id,
            index_id,
            EntityKind::Monster,
            EntityData::Monster(monster),
        ))
    }

    pub fn create_npc(&self, npc: Npc) -> Arc<MapEntity> {
        let (object_id, index_id) = self.allocate_ids();
        Arc::new(MapEntity::new(
            object_id,
            index_id,
            EntityKind::Npc,
            EntityData::Npc(npc),
        ))
    }

    pub fn create_ground_item(&self, item: GroundItem) -> Arc<MapEntity> {
        let (object_id, index_id) = self.allocate_ids();
        Arc::new(MapEntity::new(
            object_id,
            index_id,
            EntityKind::Item,
            EntityData::Item(item),
        ))
    }

    /// Places an entity on a map and enters it into the directory.
    pub fn spawn(
        &self,
        entity: Arc<MapEntity>,
        map_id: u16,
        pos: Position,
    ) -> Result<(), WorldError> {
        let map = self.map(map_id).ok_or(WorldError::MapNotFound(map_id))?;
        entity.set_position(pos);
        entity.set_active(true);
        map.add_entity(Arc::clone(&entity))?;
        self.directory.write().insert(entity.object_id(), entity);
        Ok(())
    }

    /// Removes an entity from its map and the directory. Returns whether
    /// it existed.
    pub fn despawn(&self, object_id: u32) -> bool {
        let Some(entity) = self.directory.write().remove(&object_id) else {
            return false;
        };
        entity.set_active(false);
        if let Some(map) = self.map(entity.map_id()) {
            map.remove_entity(object_id);
        }
        debug!(object_id, "entity despawned");
        true
    }

    /// Moves an entity between maps, preserving the containment
    /// invariant on both sides.
    pub fn transfer_entity(
        &self,
        entity: &Arc<MapEntity>,
        dest_map_id: u16,
        dest_pos: Position,
    ) -> Result<(), WorldError> {
        let dest = self
            .map(dest_map_id)
            .ok_or(WorldError::MapNotFound(dest_map_id))?;
        if let Some(src) = self.map(entity.map_id()) {
            src.remove_entity(entity.object_id());
        }
        entity.set_position(dest_pos);
        dest.add_entity(Arc::clone(entity))
    }

    /// Active entities near a point on one map.
    pub fn query_nearby(
        &self,
        map_id: u16,
        center: Position,
        radius: f64,
        kind: Option<EntityKind>,
    ) -> Vec<Arc<MapEntity>> {
        match self.map(map_id) {
            Some(map) => map.spatial().query_radius(center, radius, kind),
            None => Vec::new(),
        }
    }

    /// Periodic maintenance; drives each map's spatial sweep.
    pub fn tick(&self, now: Instant) {
        let maps: Vec<Arc<Map>> = self.maps.read().values().cloned().collect();
        for map in maps {
            map.spatial().maybe_sweep(now);
        }
    }
}

impl Default for GameWorld {
    fn default() -> Self {
        Self::new()
    }
}
