//! The compiled map file format.
//!
//! Maps ship as flat binary files: a magic and version, the grid
//! dimensions, one packed record per cell, then the portal table. The
//! loader produces a ready [`Map`]; the writer exists for tooling and
//! fixtures.

use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use thiserror::Error;
use tracing::debug;

use crate::cell::{Cell, CellFlags};
use crate::map::Map;
use crate::position::Position;
use crate::WorldError;

const MAGIC: &[u8; 5] = b"TQMAP";
const VERSION: u16 = 1;

/// Largest dimension a map file may declare.
const MAX_DIMENSION: u32 = 4096;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("i/o error reading map file")]
    Io(#[from] std::io::Error),
    #[error("not a map file (bad magic)")]
    BadMagic,
    #[error("unsupported map file version {0}")]
    UnsupportedVersion(u16),
    #[error("map file declares unreasonable dimensions {width}x{height}")]
    UnreasonableDimensions { width: u32, height: u32 },
    #[error(transparent)]
    World(#[from] WorldError),
}

/// Reads a compiled map file into a [`Map`] with the given id.
pub fn load_map(mut r: impl Read, id: u16) -> Result<Map, LoaderError> {
    let mut magic = [0u8; 5];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(LoaderError::BadMagic);
    }
    let version = r.read_u16::<LE>()?;
    if version != VERSION {
        return Err(LoaderError::UnsupportedVersion(version));
    }

    let width = r.read_u32::<LE>()?;
    let height = r.read_u32::<LE>()?;
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(LoaderError::UnreasonableDimensions { width, height });
    }

    let mut cells = Vec::with_capacity(width as usize * height as usize);
    for _ in 0..width as usize * height as usize {
        let flags = CellFlags::from_bits_truncate(r.read_u16::<LE>()?);
        let argument = r.read_u16::<LE>()?;
        let floor_type = r.read_u16::<LE>()?;
        cells.push(Cell::new(flags, argument, floor_type));
    }

    let map = Map::from_cells(id, width as i32, height as i32, cells)?;

    let portal_count = r.read_u32::<LE>()?;
    for _ in 0..portal_count {
        let x = r.read_u16::<LE>()? as i16;
        let y = r.read_u16::<LE>()? as i16;
        let dest = r.read_u16::<LE>()?;
        map.add_portal(dest, Position::new(x, y))?;
    }

    debug!(map = id, width, height, portals = portal_count, "map file loaded");
    Ok(map)
}

/// Writes a map back out in the file format. Portal cells are emitted
/// through the cell records; the explicit portal table carries the
/// destinations.
pub fn write_map(mut w: impl Write, map: &Map) -> Result<(), LoaderError> {
    w.write_all(MAGIC)?;
    w.write_u16::<LE>(VERSION)?;
    w.write_u32::<LE>(map.width() as u32)?;
    w.write_u32::<LE>(map.height() as u32)?;

    let mut portals = Vec::new();
    for y in 0..map.height() as i16 {
        for x in 0..map.width() as i16 {
            let cell = map.cell(x, y);
            w.write_u16::<LE>(cell.flags().bits())?;
            w.write_u16::<LE>(cell.argument())?;
            w.write_u16::<LE>(cell.floor_type())?;
            if let Some(dest) = map.get_portal_destination(Position::new(x, y)) {
                portals.push((x, y, dest));
            }
        }
    }

    w.write_u32::<LE>(portals.len() as u32)?;
    for (x, y, dest) in portals {
        w.write_u16::<LE>(x as u16)?;
        w.write_u16::<LE>(y as u16)?;
        w.write_u16::<LE>(dest)?;
    }
    Ok(())
}
