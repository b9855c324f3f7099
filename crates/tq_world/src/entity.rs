//! The entities a map tracks.
//!
//! Entities are referenced by `object_id` everywhere: maps hold them by
//! id, an entity knows only the id of the map it stands on, and the link
//! between a player and its connection is a pair of ids resolved through
//! the respective registries.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::position::Position;

/// Discriminates what an entity is; spatial queries can filter on it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EntityKind {
    Player,
    Monster,
    Npc,
    Item,
}

/// Kind-specific entity state.
#[derive(Debug)]
pub enum EntityData {
    Player(Mutex<Player>),
    Monster(Monster),
    Npc(Npc),
    Item(GroundItem),
}

/// A mobile (or at least placeable) object in the world.
#[derive(Debug)]
pub struct MapEntity {
    object_id: u32,
    index_id: u32,
    kind: EntityKind,
    map_id: AtomicU32,
    position: Mutex<Position>,
    active: AtomicBool,
    data: EntityData,
}

impl MapEntity {
    pub fn new(object_id: u32, index_id: u32, kind: EntityKind, data: EntityData) -> Self {
        Self {
            object_id,
            index_id,
            kind,
            map_id: AtomicU32::new(0),
            position: Mutex::new(Position::default()),
            active: AtomicBool::new(false),
            data,
        }
    }

    /// Globally unique object id.
    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    /// Server-local allocation sequence number.
    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn map_id(&self) -> u16 {
        self.map_id.load(Ordering::Acquire) as u16
    }

    pub fn set_map_id(&self, map_id: u16) {
        self.map_id.store(u32::from(map_id), Ordering::Release);
    }

    pub fn position(&self) -> Position {
        *self.position.lock()
    }

    /// Places the entity without recording movement history.
    pub fn set_position(&self, pos: Position) {
        *self.position.lock() = pos;
    }

    /// Moves the entity, remembering the previous coordinates.
    pub fn step_to(&self, x: i16, y: i16) {
        self.position.lock().step_to(x, y);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Locks the player state, if this entity is a player.
    pub fn player(&self) -> Option<MutexGuard<'_, Player>> {
        match &self.data {
            EntityData::Player(p) => Some(p.lock()),
            _ => None,
        }
    }

    pub fn monster(&self) -> Option<&Monster> {
        match &self.data {
            EntityData::Monster(m) => Some(m),
            _ => None,
        }
    }

    pub fn npc(&self) -> Option<&Npc> {
        match &self.data {
            EntityData::Npc(n) => Some(n),
            _ => None,
        }
    }

    pub fn ground_item(&self) -> Option<&GroundItem> {
        match &self.data {
            EntityData::Item(i) => Some(i),
            _ => None,
        }
    }
}

/// Player state attached to a player entity. The connection link is the
/// client id; the network layer resolves it through its registry.
#[derive(Clone, Debug)]
pub struct Player {
    pub client_id: u64,
    pub name: String,
    pub level: u16,
    pub hp: u32,
    pub max_hp: u32,
    pub mana: u32,
    pub max_mana: u32,
    pub strength: u16,
    pub agility: u16,
    pub vitality: u16,
    pub spirit: u16,
    /// Item ids; slot semantics live with the inventory handlers.
    pub inventory: Vec<u32>,
    /// Set on any persistent-state mutation; cleared after a save.
    pub dirty: bool,
    /// Unix millis of the last login.
    pub last_login_ms: u64,
}

impl Player {
    pub fn new(client_id: u64, name: impl Into<String>) -> Self {
        Self {
            client_id,
            name: name.into(),
            level: 1,
            hp: 100,
            max_hp: 100,
            mana: 100,
            max_mana: 100,
            strength: 5,
            agility: 5,
            vitality: 5,
            spirit: 5,
            inventory: Vec::new(),
            dirty: false,
            last_login_ms: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Monster {
    pub monster_type: u32,
    pub name: String,
    pub aggressive: bool,
}

#[derive(Clone, Debug)]
pub struct Npc {
    pub npc_type: u32,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct GroundItem {
    pub item_type: u32,
    pub amount: u32,
}
