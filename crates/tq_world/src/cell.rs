//! Terrain cells.

use bitflags::bitflags;

bitflags! {
    /// Terrain attribute bits for one cell.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct CellFlags: u16 {
        const OPEN = 0x01;
        const BLOCKED = 0x02;
        const STATIC_OBJ = 0x04;
        const ENTITY = 0x08;
        const GATE = 0x10;
        const BLOCKED_OBJ = 0x20;
        const PORTAL = 0x40;
        const TERRAIN = 0x80;
    }
}

/// One terrain cell: flags, an argument (altitude, or the destination map
/// id when the `PORTAL` bit is set), and a floor type.
///
/// Cells are immutable values; mutators return the changed cell and the
/// caller stores it back into the grid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Cell {
    flags: CellFlags,
    argument: u16,
    floor_type: u16,
}

impl Cell {
    pub fn new(flags: CellFlags, argument: u16, floor_type: u16) -> Self {
        Self {
            flags,
            argument,
            floor_type,
        }
    }

    /// A plain walkable cell at altitude zero.
    pub fn open() -> Self {
        Self::new(CellFlags::OPEN, 0, 0)
    }

    /// The sentinel returned for out-of-bounds accesses.
    pub fn blocked() -> Self {
        Self::new(CellFlags::BLOCKED, 0, 0)
    }

    pub fn flags(&self) -> CellFlags {
        self.flags
    }

    /// Altitude, or the destination map id on portal cells.
    pub fn argument(&self) -> u16 {
        self.argument
    }

    pub fn floor_type(&self) -> u16 {
        self.floor_type
    }

    pub fn has(&self, flag: CellFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_open(&self) -> bool {
        self.has(CellFlags::OPEN)
    }

    pub fn is_blocked(&self) -> bool {
        self.has(CellFlags::BLOCKED)
    }

    /// Destination map id if this cell is a portal.
    pub fn portal_destination(&self) -> Option<u16> {
        self.has(CellFlags::PORTAL).then_some(self.argument)
    }

    pub fn with_flag(self, flag: CellFlags) -> Self {
        Self {
            flags: self.flags | flag,
            ..self
        }
    }

    pub fn without_flag(self, flag: CellFlags) -> Self {
        Self {
            flags: self.flags - flag,
            ..self
        }
    }

    pub fn with_argument(self, argument: u16) -> Self {
        Self { argument, ..self }
    }
}
