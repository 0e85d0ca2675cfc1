//! Tile partitioning and the bounded LRU tile cache.
//!
//! The anomaly grid is logically partitioned into fixed-size tiles. The
//! cache keeps at most `capacity` tiles resident, evicting the least
//! recently used on insert. Misses are de-duplicated per key: the first
//! requester performs the load while any concurrent requesters for the same
//! key block on that load's completion slot and receive the same tile (or
//! the same error; failed loads are never cached). Loads run outside the
//! cache lock, so misses for different tiles proceed in parallel and
//! resident lookups never wait on I/O.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{NavError, NavResult};
use crate::map::{MapHeader, RasterSource};

/// Default tile edge length in cells
pub const DEFAULT_TILE_SIZE: usize = 256;
/// Default resident-tile capacity
pub const DEFAULT_CACHE_CAPACITY: usize = 16;

/// Cache key: tile coordinates in tile units
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub row: usize,
    pub col: usize,
}

/// Sub-rectangle of a [`MapHeader`] grid, in cell units.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileMetadata {
    pub row0: usize,
    pub col0: usize,
    pub nrows: usize,
    pub ncols: usize,
}

impl TileMetadata {
    /// True iff the bilinear interpolation stencil for `(lat, lon)` fits
    /// strictly inside this sub-rectangle.
    pub fn contains(&self, header: &MapHeader, lat: f64, lon: f64) -> bool {
        let (r, c) = header.fractional_index(lat, lon);
        if !r.is_finite() || !c.is_finite() || r < 0.0 || c < 0.0 {
            return false;
        }
        let r0 = r.floor() as usize;
        let c0 = c.floor() as usize;
        r0 >= self.row0
            && r0 + 1 < self.row0 + self.nrows
            && c0 >= self.col0
            && c0 + 1 < self.col0 + self.ncols
    }
}

/// Resident sub-grid of anomaly values, addressed by absolute grid indices.
pub struct Tile {
    meta: TileMetadata,
    cells: Vec<f32>,
}

impl Tile {
    pub fn meta(&self) -> &TileMetadata {
        &self.meta
    }

    /// True when the absolute grid cell falls inside this tile
    pub fn covers(&self, row: usize, col: usize) -> bool {
        row >= self.meta.row0
            && row < self.meta.row0 + self.meta.nrows
            && col >= self.meta.col0
            && col < self.meta.col0 + self.meta.ncols
    }

    /// Value at absolute grid indices; nodata cells are NaN
    pub fn cell(&self, row: usize, col: usize) -> f64 {
        debug_assert!(self.covers(row, col));
        let local = (row - self.meta.row0) * self.meta.ncols + (col - self.meta.col0);
        self.cells[local] as f64
    }
}

/// Completion slot shared between a loader and its waiters
#[derive(Default)]
struct InFlight {
    slot: Mutex<Option<NavResult<Arc<Tile>>>>,
    ready: Condvar,
}

struct CacheState {
    resident: HashMap<TileKey, Arc<Tile>>,
    /// LRU order, most recently used at the back
    order: VecDeque<TileKey>,
    loading: HashMap<TileKey, Arc<InFlight>>,
}

/// Bounded LRU cache over grid tiles with per-key single-flight loads.
pub struct TileCache {
    tile_size: usize,
    capacity: usize,
    state: Mutex<CacheState>,
}

enum Role {
    Loader(Arc<InFlight>),
    Waiter(Arc<InFlight>),
}

impl TileCache {
    /// # Errors
    /// Returns [`NavError::Config`] when the tile size or capacity is zero.
    pub fn new(tile_size: usize, capacity: usize) -> NavResult<Self> {
        if tile_size == 0 {
            return Err(NavError::Config("tile size must be > 0".into()));
        }
        if capacity == 0 {
            return Err(NavError::Config("cache capacity must be > 0".into()));
        }
        Ok(TileCache {
            tile_size,
            capacity,
            state: Mutex::new(CacheState {
                resident: HashMap::new(),
                order: VecDeque::new(),
                loading: HashMap::new(),
            }),
        })
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of resident tiles
    pub fn resident(&self) -> usize {
        self.state.lock().expect("tile cache poisoned").resident.len()
    }

    /// Fetch a tile, loading it through `source` on a miss. Concurrent
    /// misses for the same key coalesce into a single `read_window` call.
    pub fn get_or_load(&self, key: TileKey, source: &dyn RasterSource) -> NavResult<Arc<Tile>> {
        let role = {
            let mut state = self.state.lock().expect("tile cache poisoned");
            if let Some(tile) = state.resident.get(&key) {
                let tile = Arc::clone(tile);
                Self::touch(&mut state.order, key);
                return Ok(tile);
            }
            if let Some(flight) = state.loading.get(&key) {
                Role::Waiter(Arc::clone(flight))
            } else {
                let flight = Arc::new(InFlight::default());
                state.loading.insert(key, Arc::clone(&flight));
                Role::Loader(flight)
            }
        };

        match role {
            Role::Waiter(flight) => {
                let mut slot = flight.slot.lock().expect("in-flight slot poisoned");
                while slot.is_none() {
                    slot = flight.ready.wait(slot).expect("in-flight slot poisoned");
                }
                slot.as_ref().expect("slot filled").clone()
            }
            Role::Loader(flight) => {
                let result = self.load_tile(key, source).map(Arc::new);
                {
                    let mut state = self.state.lock().expect("tile cache poisoned");
                    state.loading.remove(&key);
                    if let Ok(ref tile) = result {
                        self.insert(&mut state, key, Arc::clone(tile));
                    }
                }
                let mut slot = flight.slot.lock().expect("in-flight slot poisoned");
                *slot = Some(result.clone());
                flight.ready.notify_all();
                result
            }
        }
    }

    fn load_tile(&self, key: TileKey, source: &dyn RasterSource) -> NavResult<Tile> {
        let header = source.header();
        let row0 = key.row * self.tile_size;
        let col0 = key.col * self.tile_size;
        if row0 >= header.nrows || col0 >= header.ncols {
            return Err(NavError::Domain(format!(
                "tile ({}, {}) outside the grid",
                key.row, key.col
            )));
        }
        let nrows = self.tile_size.min(header.nrows - row0);
        let ncols = self.tile_size.min(header.ncols - col0);
        let cells = source.read_window(row0, col0, nrows, ncols)?;
        debug!(
            "loaded tile ({}, {}): {}x{} cells at ({}, {})",
            key.row, key.col, nrows, ncols, row0, col0
        );
        Ok(Tile {
            meta: TileMetadata {
                row0,
                col0,
                nrows,
                ncols,
            },
            cells,
        })
    }

    fn insert(&self, state: &mut CacheState, key: TileKey, tile: Arc<Tile>) {
        state.resident.insert(key, tile);
        Self::touch(&mut state.order, key);
        while state.resident.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.resident.remove(&oldest);
                debug!("evicted tile ({}, {})", oldest.row, oldest.col);
            } else {
                break;
            }
        }
    }

    fn touch(order: &mut VecDeque<TileKey>, key: TileKey) {
        order.retain(|k| *k != key);
        order.push_back(key);
    }
}

// === Unit tests ===
#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::GridSource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Source decorator counting window reads, for single-flight assertions
    struct CountingSource {
        inner: GridSource,
        loads: AtomicUsize,
        fail: bool,
    }

    impl CountingSource {
        fn new(inner: GridSource) -> Self {
            CountingSource {
                inner,
                loads: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    impl RasterSource for CountingSource {
        fn header(&self) -> &MapHeader {
            self.inner.header()
        }
        fn read_window(
            &self,
            row0: usize,
            col0: usize,
            nrows: usize,
            ncols: usize,
        ) -> NavResult<Vec<f32>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            // Give concurrent requesters a chance to pile onto the key
            thread::sleep(std::time::Duration::from_millis(20));
            if self.fail {
                return Err(NavError::MapIo("synthetic read failure".into()));
            }
            self.inner.read_window(row0, col0, nrows, ncols)
        }
    }

    fn ramp_source(nrows: usize, ncols: usize) -> GridSource {
        let header = MapHeader::new(nrows, ncols, 0.0, 0.0, 1.0, 1.0, None).unwrap();
        let cells: Vec<f32> = (0..nrows * ncols).map(|i| i as f32).collect();
        GridSource::new(header, cells).unwrap()
    }

    #[test]
    fn rejects_zero_parameters() {
        assert!(TileCache::new(0, 4).is_err());
        assert!(TileCache::new(16, 0).is_err());
    }

    #[test]
    fn tile_exposes_absolute_cells() {
        let source = ramp_source(8, 8);
        let cache = TileCache::new(4, 4).unwrap();
        let tile = cache
            .get_or_load(TileKey { row: 1, col: 1 }, &source)
            .unwrap();
        assert_eq!(tile.meta().row0, 4);
        assert_eq!(tile.meta().col0, 4);
        assert!(tile.covers(5, 6));
        assert!(!tile.covers(3, 6));
        assert_eq!(tile.cell(5, 6), (5 * 8 + 6) as f64);
    }

    #[test]
    fn edge_tiles_are_clipped() {
        let source = ramp_source(10, 10);
        let cache = TileCache::new(4, 4).unwrap();
        let tile = cache
            .get_or_load(TileKey { row: 2, col: 2 }, &source)
            .unwrap();
        assert_eq!(tile.meta().nrows, 2);
        assert_eq!(tile.meta().ncols, 2);
        assert_eq!(tile.cell(9, 9), 99.0);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let source = ramp_source(16, 16);
        let cache = TileCache::new(4, 2).unwrap();
        let k = |row, col| TileKey { row, col };
        cache.get_or_load(k(0, 0), &source).unwrap();
        cache.get_or_load(k(0, 1), &source).unwrap();
        // Touch (0,0) so (0,1) becomes the eviction candidate
        cache.get_or_load(k(0, 0), &source).unwrap();
        cache.get_or_load(k(0, 2), &source).unwrap();
        assert_eq!(cache.resident(), 2);
        let counting = CountingSource::new(ramp_source(16, 16));
        // (0,0) is still resident: no new load
        cache.get_or_load(k(0, 0), &counting).unwrap();
        assert_eq!(counting.loads.load(Ordering::SeqCst), 0);
        // (0,1) was evicted: reload happens
        cache.get_or_load(k(0, 1), &counting).unwrap();
        assert_eq!(counting.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn single_flight_coalesces_concurrent_misses() {
        let source = Arc::new(CountingSource::new(ramp_source(8, 8)));
        let cache = Arc::new(TileCache::new(8, 4).unwrap());
        let barrier = Arc::new(std::sync::Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let source = Arc::clone(&source);
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                cache
                    .get_or_load(TileKey { row: 0, col: 0 }, source.as_ref())
                    .map(|tile| tile.cell(3, 3))
            }));
        }
        let values: Vec<f64> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| *v == values[0]));
        assert_eq!(cache.resident(), 1);
    }

    #[test]
    fn load_failure_reaches_all_waiters_without_negative_caching() {
        let mut counting = CountingSource::new(ramp_source(8, 8));
        counting.fail = true;
        let source = Arc::new(counting);
        let cache = Arc::new(TileCache::new(8, 4).unwrap());
        let barrier = Arc::new(std::sync::Barrier::new(3));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let source = Arc::clone(&source);
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                cache.get_or_load(TileKey { row: 0, col: 0 }, source.as_ref())
            }));
        }
        for handle in handles {
            let result = handle.join().unwrap();
            assert!(matches!(result, Err(NavError::MapIo(_))));
        }
        // One coalesced attempt, nothing cached
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.resident(), 0);
        // A later request retries the load rather than replaying the error
        let retry = cache.get_or_load(TileKey { row: 0, col: 0 }, source.as_ref());
        assert!(retry.is_err());
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn out_of_grid_key_is_rejected() {
        let source = ramp_source(8, 8);
        let cache = TileCache::new(4, 4).unwrap();
        assert!(cache
            .get_or_load(TileKey { row: 9, col: 0 }, &source)
            .is_err());
    }
}
