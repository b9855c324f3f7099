//! The game world data plane: terrain cell grids, the spatial hash index
//! over live entities, per-map placement and movement rules, and the
//! world-wide map/entity directories.

pub mod cell;
pub mod entity;
pub mod loader;
pub mod map;
pub mod position;
pub mod repo;
pub mod spatial;
pub mod world;

pub use cell::{Cell, CellFlags};
pub use entity::{EntityData, EntityKind, GroundItem, MapEntity, Monster, Npc, Player};
pub use loader::{load_map, write_map, LoaderError};
pub use map::Map;
pub use position::Position;
pub use repo::{InMemoryPlayerRepository, PlayerRecord, PlayerRepository};
pub use spatial::SpatialGrid;
use thiserror::Error;
pub use world::GameWorld;

/// Errors surfaced to handlers by world mutations. None of these are
/// fatal to a connection.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum WorldError {
    #[error("map dimensions {width}x{height} are invalid")]
    InvalidDimensions { width: i32, height: i32 },
    #[error("position ({x}, {y}) is not valid on map {map_id}")]
    InvalidPosition { map_id: u16, x: i16, y: i16 },
    #[error("entity {0} is already present in the map")]
    EntityAlreadyPresent(u32),
    #[error("entity {0} not found")]
    EntityNotFound(u32),
    #[error("map {0} not found")]
    MapNotFound(u16),
}
