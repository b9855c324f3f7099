//! Uniform-cell spatial hashing over live entities.
//!
//! Entities are bucketed by `(x / cell_size, y / cell_size)`; a bucket key
//! packs both halves into one `u64`. Insert, remove, and move are O(1)
//! amortized; radius and rectangle queries enumerate the handful of
//! buckets a Chebyshev halo covers and filter by exact distance.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::entity::{EntityKind, MapEntity};
use crate::position::Position;

/// Default bucket edge length in tiles.
pub const DEFAULT_CELL_SIZE: i32 = 32;

/// Period of the background sweep that evicts inactive entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

fn pack_key(cx: i32, cy: i32) -> u64 {
    ((cx as u32 as u64) << 32) | (cy as u32 as u64)
}

/// The bucket index for one map.
#[derive(Debug)]
pub struct SpatialGrid {
    cell_size: i32,
    grid_width: i32,
    grid_height: i32,
    buckets: RwLock<FxHashMap<u64, Vec<Arc<MapEntity>>>>,
    entries: AtomicUsize,
    last_sweep: Mutex<Instant>,
}

impl SpatialGrid {
    pub fn new(cell_size: i32, map_width: i32, map_height: i32) -> Self {
        let cell_size = cell_size.max(1);
        Self {
            cell_size,
            grid_width: (map_width + cell_size - 1) / cell_size,
            grid_height: (map_height + cell_size - 1) / cell_size,
            buckets: RwLock::new(FxHashMap::default()),
            entries: AtomicUsize::new(0),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn with_default_cell_size(map_width: i32, map_height: i32) -> Self {
        Self::new(DEFAULT_CELL_SIZE, map_width, map_height)
    }

    fn key_for(&self, pos: Position) -> u64 {
        let cx = i32::from(pos.x).div_euclid(self.cell_size);
        let cy = i32::from(pos.y).div_euclid(self.cell_size);
        pack_key(cx, cy)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of non-empty buckets; an observability statistic.
    pub fn active_cells(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn grid_dimensions(&self) -> (i32, i32) {
        (self.grid_width, self.grid_height)
    }

    /// Inserts an entity at its current position. Re-adding an already
    /// indexed id is a no-op.
    pub fn add(&self, entity: &Arc<MapEntity>) {
        let key = self.key_for(entity.position());
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(key).or_default();
        if bucket.iter().any(|e| e.object_id() == entity.object_id()) {
            return;
        }
        bucket.push(Arc::clone(entity));
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes an entity; the bucket is dropped once empty. Returns
    /// whether the entity was indexed.
    pub fn remove(&self, entity: &Arc<MapEntity>) -> bool {
        let key = self.key_for(entity.position());
        let mut buckets = self.buckets.write();
        let Some(bucket) = buckets.get_mut(&key) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|e| e.object_id() != entity.object_id());
        let removed = bucket.len() < before;
        if bucket.is_empty() {
            buckets.remove(&key);
        }
        if removed {
            self.entries.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Moves an entity to `new_pos`, transferring it between buckets as
    /// needed. The position mutation happens under the bucket-table write
    /// lock, so concurrent queries observe the old placement or the new
    /// one, never a half-move.
    pub fn update(&self, entity: &Arc<MapEntity>, new_pos: Position) {
        let old_key = self.key_for(entity.position());
        let new_key = self.key_for(new_pos);

        let mut buckets = self.buckets.write();
        if old_key != new_key {
            if let Some(bucket) = buckets.get_mut(&old_key) {
                bucket.retain(|e| e.object_id() != entity.object_id());
                if bucket.is_empty() {
                    buckets.remove(&old_key);
                }
            }
            buckets
                .entry(new_key)
                .or_default()
                .push(Arc::clone(entity));
        }
        entity.set_position(new_pos);
    }

    /// Whether the id is indexed in the bucket covering `pos`.
    pub fn contains(&self, object_id: u32, pos: Position) -> bool {
        let key = self.key_for(pos);
        self.buckets
            .read()
            .get(&key)
            .is_some_and(|b| b.iter().any(|e| e.object_id() == object_id))
    }

    /// All active entities within `radius` (Euclidean) of `center`,
    /// optionally restricted to one kind. The result is a snapshot: it may
    /// miss an insert racing with the query but never yields an entity
    /// that was removed and deactivated before the query began.
    pub fn query_radius(
        &self,
        center: Position,
        radius: f64,
        kind: Option<EntityKind>,
    ) -> Vec<Arc<MapEntity>> {
        let halo = (radius / f64::from(self.cell_size as u32)).ceil() as i32;
        let ccx = i32::from(center.x).div_euclid(self.cell_size);
        let ccy = i32::from(center.y).div_euclid(self.cell_size);
        let radius_sq = radius * radius;

        let mut out = Vec::new();
        let mut stale = Vec::new();
        {
            let buckets = self.buckets.read();
            for cx in (ccx - halo)..=(ccx + halo) {
                for cy in (ccy - halo)..=(ccy + halo) {
                    let Some(bucket) = buckets.get(&pack_key(cx, cy)) else {
                        continue;
                    };
                    for entity in bucket {
                        if !entity.is_active() {
                            stale.push((pack_key(cx, cy), entity.object_id()));
                            continue;
                        }
                        if kind.is_some_and(|k| entity.kind() != k) {
                            continue;
                        }
                        if entity.position().distance_squared(&center) <= radius_sq {
                            out.push(Arc::clone(entity));
                        }
                    }
                }
            }
        }
        self.purge(&stale);
        out
    }

    /// All active entities inside the axis-aligned rectangle
    /// `[min, max]`, inclusive.
    pub fn query_rectangle(
        &self,
        min: Position,
        max: Position,
        kind: Option<EntityKind>,
    ) -> Vec<Arc<MapEntity>> {
        let min_cx = i32::from(min.x).div_euclid(self.cell_size);
        let min_cy = i32::from(min.y).div_euclid(self.cell_size);
        let max_cx = i32::from(max.x).div_euclid(self.cell_size);
        let max_cy = i32::from(max.y).div_euclid(self.cell_size);

        let mut out = Vec::new();
        let mut stale = Vec::new();
        {
            let buckets = self.buckets.read();
            for cx in min_cx..=max_cx {
                for cy in min_cy..=max_cy {
                    let Some(bucket) = buckets.get(&pack_key(cx, cy)) else {
                        continue;
                    };
                    for entity in bucket {
                        if !entity.is_active() {
                            stale.push((pack_key(cx, cy), entity.object_id()));
                            continue;
                        }
                        if kind.is_some_and(|k| entity.kind() != k) {
                            continue;
                        }
                        let p = entity.position();
                        if p.x >= min.x && p.x <= max.x && p.y >= min.y && p.y <= max.y {
                            out.push(Arc::clone(entity));
                        }
                    }
                }
            }
        }
        self.purge(&stale);
        out
    }

    pub fn count_in_radius(&self, center: Position, radius: f64) -> usize {
        self.query_radius(center, radius, None).len()
    }

    /// The closest entity of `kind` within `max_range`, by Euclidean
    /// distance.
    pub fn find_nearest(
        &self,
        kind: EntityKind,
        center: Position,
        max_range: f64,
    ) -> Option<Arc<MapEntity>> {
        self.query_radius(center, max_range, Some(kind))
            .into_iter()
            .min_by(|a, b| {
                let da = a.position().distance_squared(&center);
                let db = b.position().distance_squared(&center);
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// Drops every bucket.
    pub fn clear(&self) {
        self.buckets.write().clear();
        self.entries.store(0, Ordering::Relaxed);
    }

    /// Runs the periodic inactive-entry sweep if its interval elapsed.
    pub fn maybe_sweep(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock();
            if now.duration_since(*last) < SWEEP_INTERVAL {
                return;
            }
            *last = now;
        }
        self.sweep();
    }

    /// Evicts inactive entries and empty buckets.
    pub fn sweep(&self) {
        let mut buckets = self.buckets.write();
        let mut evicted = 0usize;
        buckets.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|e| e.is_active());
            evicted += before - bucket.len();
            !bucket.is_empty()
        });
        if evicted > 0 {
            self.entries.fetch_sub(evicted, Ordering::Relaxed);
            trace!(evicted, "spatial sweep evicted inactive entries");
        }
    }

    /// Removes specific stale entries noticed during a query.
    fn purge(&self, stale: &[(u64, u32)]) {
        if stale.is_empty() {
            return;
        }
        let mut buckets = self.buckets.write();
        let mut evicted = 0usize;
        for &(key, object_id) in stale {
            if let Some(bucket) = buckets.get_mut(&key) {
                let before = bucket.len();
                bucket.retain(|e| e.object_id() != object_id);
                evicted += before - bucket.len();
                if bucket.is_empty() {
                    buckets.remove(&key);
                }
            }
        }
        if evicted > 0 {
            self.entries.fetch_sub(evicted, Ordering::Relaxed);
        }
    }
}
