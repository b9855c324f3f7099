//! A bounded 2-D map: terrain grid, portal table, entity set, and the
//! spatial index over those entities.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::cell::{Cell, CellFlags};
use crate::entity::MapEntity;
use crate::position::Position;
use crate::spatial::SpatialGrid;
use crate::WorldError;

#[derive(Default, Debug)]
struct PortalTable {
    /// Portal cell -> destination map id.
    by_position: FxHashMap<(i16, i16), u16>,
    /// Destination map id -> the portal cell leading there.
    by_destination: FxHashMap<u16, Position>,
}

/// One map instance.
///
/// Invariant: an entity is in the entity set exactly when the spatial grid
/// indexes it, and then its `map_id` equals this map's id. Position
/// mutation goes through [`Map::try_move_entity`] only.
#[derive(Debug)]
pub struct Map {
    id: u16,
    width: i32,
    height: i32,
    cells: RwLock<Vec<Cell>>,
    portals: RwLock<PortalTable>,
    entities: RwLock<FxHashMap<u32, Arc<MapEntity>>>,
    spatial: SpatialGrid,
}

impl Map {
    /// Creates a map of all-open terrain.
    pub fn new(id: u16, width: i32, height: i32) -> Result<Self, WorldError> {
        Self::from_cells(id, width, height, vec![Cell::open(); grid_len(width, height)?])
    }

    /// Creates a map from pre-parsed terrain (the map file loader's
    /// output). `cells` is row-major, `width * height` long.
    pub fn from_cells(
        id: u16,
        width: i32,
        height: i32,
        cells: Vec<Cell>,
    ) -> Result<Self, WorldError> {
        if cells.len() != grid_len(width, height)? {
            return Err(WorldError::InvalidDimensions { width, height });
        }
        Ok(Self {
            id,
            width,
            height,
            cells: RwLock::new(cells),
            portals: RwLock::new(PortalTable::default()),
            entities: RwLock::new(FxHashMap::default()),
            spatial: SpatialGrid::with_default_cell_size(width, height),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn spatial(&self) -> &SpatialGrid {
        &self.spatial
    }

    fn cell_index(&self, x: i16, y: i16) -> Option<usize> {
        if x < 0 || y < 0 || i32::from(x) >= self.width || i32::from(y) >= self.height {
            return None;
        }
        Some(i32::from(y) as usize * self.width as usize + i32::from(x) as usize)
    }

    /// The cell at `(x, y)`, or the blocked sentinel out of bounds.
    pub fn cell(&self, x: i16, y: i16) -> Cell {
        match self.cell_index(x, y) {
            Some(i) => self.cells.read()[i],
            None => Cell::blocked(),
        }
    }

    /// Stores a cell back into the grid. Returns false out of bounds.
    pub fn set_cell(&self, x: i16, y: i16, cell: Cell) -> bool {
        match self.cell_index(x, y) {
            Some(i) => {
                self.cells.write()[i] = cell;
                true
            }
            None => false,
        }
    }

    /// Placement rule: in bounds and the cell's `BLOCKED` flag clear.
    /// Portal cells stay walkable under this rule.
    pub fn is_valid_position(&self, pos: Position) -> bool {
        self.cell_index(pos.x, pos.y).is_some() && !self.cell(pos.x, pos.y).is_blocked()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.read().len()
    }

    pub fn entity(&self, object_id: u32) -> Option<Arc<MapEntity>> {
        self.entities.read().get(&object_id).cloned()
    }

    pub fn contains_entity(&self, object_id: u32) -> bool {
        self.entities.read().contains_key(&object_id)
    }

    /// Inserts an entity at its current position.
    pub fn add_entity(&self, entity: Arc<MapEntity>) -> Result<(), WorldError> {
        let pos = entity.position();
        if !self.is_valid_position(pos) {
            return Err(WorldError::InvalidPosition {
                map_id: self.id,
                x: pos.x,
                y: pos.y,
            });
        }

        let mut entities = self.entities.write();
        if entities.contains_key(&entity.object_id()) {
            return Err(WorldError::EntityAlreadyPresent(entity.object_id()));
        }
        entities.insert(entity.object_id(), Arc::clone(&entity));
        drop(entities);

        self.spatial.add(&entity);
        entity.set_map_id(self.id);
        self.mark_occupancy(pos, true);
        Ok(())
    }

    /// Removes an entity from both structures. Returns whether it was
    /// present.
    pub fn remove_entity(&self, object_id: u32) -> bool {
        let Some(entity) = self.entities.write().remove(&object_id) else {
            return false;
        };
        self.spatial.remove(&entity);
        self.mark_occupancy(entity.position(), false);
        true
    }

    /// Attempts to move an entity. Rejects invalid destinations and tiles
    /// already occupied by another entity; on success the position and
    /// spatial bucket change as one transition.
    pub fn try_move_entity(&self, entity: &Arc<MapEntity>, new_pos: Position) -> bool {
        if !self.is_valid_position(new_pos) {
            return false;
        }
        let occupied = self
            .spatial
            .query_radius(new_pos, 0.5, None)
            .iter()
            .any(|e| e.object_id() != entity.object_id());
        if occupied {
            return false;
        }

        // Route the mutation through the grid so the bucket transfer and
        // the position write land under one lock.
        let old_pos = entity.position();
        let mut target = old_pos;
        target.step_to(new_pos.x, new_pos.y);
        self.spatial.update(entity, target);

        self.mark_occupancy(old_pos, false);
        self.mark_occupancy(new_pos, true);
        true
    }

    /// Registers a portal: the cell at `pos` leads to `dest_map_id`.
    pub fn add_portal(&self, dest_map_id: u16, pos: Position) -> Result<(), WorldError> {
        if !self.is_valid_position(pos) {
            return Err(WorldError::InvalidPosition {
                map_id: self.id,
                x: pos.x,
                y: pos.y,
            });
        }

        let cell = self
            .cell(pos.x, pos.y)
            .with_flag(CellFlags::PORTAL)
            .with_argument(dest_map_id);
        self.set_cell(pos.x, pos.y, cell);

        let mut portals = self.portals.write();
        portals.by_position.insert((pos.x, pos.y), dest_map_id);
        portals.by_destination.insert(dest_map_id, pos);
        debug!(map = self.id, dest = dest_map_id, %pos, "portal registered");
        Ok(())
    }

    /// Destination map id of the portal at `pos`, if any.
    pub fn get_portal_destination(&self, pos: Position) -> Option<u16> {
        self.portals.read().by_position.get(&(pos.x, pos.y)).copied()
    }

    /// The portal cell on this map leading to `dest_map_id`, if any.
    pub fn portal_to(&self, dest_map_id: u16) -> Option<Position> {
        self.portals.read().by_destination.get(&dest_map_id).copied()
    }

    /// Maintains the advisory `ENTITY` cell flag, reassigning the changed
    /// cell into the grid.
    fn mark_occupancy(&self, pos: Position, present: bool) {
        let cell = self.cell(pos.x, pos.y);
        let updated = if present {
            cell.with_flag(CellFlags::ENTITY)
        } else if self.spatial.count_in_radius(pos, 0.5) == 0 {
            cell.without_flag(CellFlags::ENTITY)
        } else {
            return;
        };
        self.set_cell(pos.x, pos.y, updated);
    }
}

fn grid_len(width: i32, height: i32) -> Result<usize, WorldError> {
    if width <= 0 || height <= 0 {
        return Err(WorldError::InvalidDimensions { width, height });
    }
    Ok(width as usize * height as usize)
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entity::{EntityData, EntityKind, Player};

    fn player(id: u32, x: i16, y: i16) -> Arc<MapEntity> {
        let e = Arc::new(MapEntity::new(
            id,
            id,
            EntityKind::Player,
            EntityData::Player(Mutex::new(Player::new(u64::from(id), format!("p{id}")))),
        ));
        e.set_position(Position::new(x, y));
        e.set_active(true);
        e
    }

    #[test]
    fn invalid_dimensions_are_rejected() {
        assert_eq!(
            Map::new(1, 0, 64).unwrap_err(),
            WorldError::InvalidDimensions { width: 0, height: 64 }
        );
        assert!(Map::new(1, -3, 64).is_err());
        assert!(Map::new(1, 64, 64).is_ok());
    }

    #[test]
    fn out_of_bounds_cell_is_the_blocked_sentinel() {
        let map = Map::new(1, 8, 8).unwrap();
        assert_eq!(map.cell(-1, 0), Cell::blocked());
        assert_eq!(map.cell(8, 0), Cell::blocked());
        assert!(!map.is_valid_position(Position::new(0, 8)));
    }

    #[test]
    fn add_entity_enforces_placement_and_uniqueness() {
        let map = Map::new(1, 64, 64).unwrap();
        let a = player(1, 10, 10);
        map.add_entity(Arc::clone(&a)).unwrap();
        assert_eq!(a.map_id(), 1);
        assert!(map.cell(10, 10).has(CellFlags::ENTITY));

        assert_eq!(
            map.add_entity(Arc::clone(&a)).unwrap_err(),
            WorldError::EntityAlreadyPresent(1)
        );

        let off_grid = player(2, 90, 10);
        assert!(matches!(
            map.add_entity(off_grid),
            Err(WorldError::InvalidPosition { .. })
        ));
    }

    #[test]
    fn entity_set_and_spatial_grid_stay_in_lockstep() {
        let map = Map::new(1, 64, 64).unwrap();
        let a = player(1, 10, 10);
        map.add_entity(Arc::clone(&a)).unwrap();
        assert!(map.contains_entity(1));
        assert!(map.spatial().contains(1, a.position()));

        assert!(map.remove_entity(1));
        assert!(!map.contains_entity(1));
        assert!(!map.spatial().contains(1, a.position()));
        assert!(!map.remove_entity(1));
        assert!(!map.cell(10, 10).has(CellFlags::ENTITY));
    }

    #[test]
    fn move_and_query_scenario() {
        let map = Map::new(1, 64, 64).unwrap();
        let a = player(1, 10, 10);
        let b = player(2, 12, 12);
        map.add_entity(Arc::clone(&a)).unwrap();
        map.add_entity(Arc::clone(&b)).unwrap();

        let nearby = map.spatial().query_radius(Position::new(10, 10), 5.0, None);
        assert_eq!(nearby.len(), 2);

        // B already stands there.
        assert!(!map.try_move_entity(&a, Position::new(12, 12)));

        assert!(map.try_move_entity(&a, Position::new(11, 11)));
        assert_eq!(a.position(), Position::new(11, 11));
        assert_eq!(a.position().last(), (10, 10));

        let nearby = map.spatial().query_radius(Position::new(10, 10), 5.0, None);
        assert_eq!(nearby.len(), 2);
        assert!(nearby
            .iter()
            .any(|e| e.object_id() == 1 && e.position() == Position::new(11, 11)));
    }

    #[test]
    fn moves_onto_blocked_cells_are_rejected() {
        let map = Map::new(1, 16, 16).unwrap();
        map.set_cell(5, 5, Cell::blocked());
        let a = player(1, 4, 4);
        map.add_entity(Arc::clone(&a)).unwrap();
        assert!(!map.try_move_entity(&a, Position::new(5, 5)));
        assert_eq!(a.position(), Position::new(4, 4));
    }

    #[test]
    fn portals_mark_cells_and_resolve_destinations() {
        let map = Map::new(1, 16, 16).unwrap();
        let pos = Position::new(3, 3);
        map.add_portal(1002, pos).unwrap();

        let cell = map.cell(3, 3);
        assert!(cell.has(CellFlags::PORTAL));
        assert!(!cell.is_blocked());
        assert_eq!(cell.portal_destination(), Some(1002));
        assert_eq!(map.get_portal_destination(pos), Some(1002));
        assert_eq!(map.portal_to(1002), Some(pos));

        // Portal cells stay walkable under the adopted placement rule.
        assert!(map.is_valid_position(pos));

        assert!(map.add_portal(1003, Position::new(40, 3)).is_err());
    }
}
