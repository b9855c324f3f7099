//! The persistence seam. The core only ever talks to this trait; storage
//! engines live elsewhere.

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::entity::Player;

/// Persisted player state.
#[derive(Clone, PartialEq, Debug)]
pub struct PlayerRecord {
    pub object_id: u32,
    pub name: String,
    pub level: u16,
    pub map_id: u16,
    pub x: i16,
    pub y: i16,
    pub hp: u32,
    pub mana: u32,
}

impl PlayerRecord {
    /// Snapshots live player state for persistence.
    pub fn from_player(object_id: u32, map_id: u16, x: i16, y: i16, player: &Player) -> Self {
        Self {
            object_id,
            name: player.name.clone(),
            level: player.level,
            map_id,
            x,
            y,
            hp: player.hp,
            mana: player.mana,
        }
    }
}

/// Repository operations the core depends on.
#[async_trait]
pub trait PlayerRepository: Send + Sync + 'static {
    async fn get_player_by_id(&self, object_id: u32) -> Option<PlayerRecord>;

    /// Inserts or updates a record. Returns whether the write succeeded.
    async fn upsert_player(&self, record: &PlayerRecord) -> bool;

    async fn is_name_available(&self, name: &str) -> bool;
}

/// Map-backed repository for tests and standalone runs.
#[derive(Default)]
pub struct InMemoryPlayerRepository {
    records: RwLock<FxHashMap<u32, PlayerRecord>>,
}

impl InMemoryPlayerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl PlayerRepository for InMemoryPlayerRepository {
    async fn get_player_by_id(&self, object_id: u32) -> Option<PlayerRecord> {
        self.records.read().get(&object_id).cloned()
    }

    async fn upsert_player(&self, record: &PlayerRecord) -> bool {
        self.records
            .write()
            .insert(record.object_id, record.clone());
        true
    }

    async fn is_name_available(&self, name: &str) -> bool {
        !self.records.read().values().any(|r| r.name == name)
    }
}
