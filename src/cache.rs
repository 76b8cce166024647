//! Per-level cell cache with single-flight asynchronous population
//!
//! Every cell of a level goes through the same state machine:
//!
//! ```text
//! UNLOADED --get/peek--> LOADING --ok--> VALID --mark_dirty--> DIRTY
//!                           |                                    |
//!                           +--error--> UNLOADED    VALID|DIRTY --invalidate--> UNLOADED
//! ```
//!
//! The blocking view ([`CellCache::get`]) and the volatile view
//! ([`CellCache::peek`]) are two accessors over that one state machine, so
//! both always observe the same cell identity and generation.

use crate::block::BlockSource;
use crate::error::{CacheError, Result};
use crate::layout::LevelLayout;
use crate::pool::SharedWorkerPool;
use crate::types::PixelBuffer;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Result of one remote fetch as seen by the callers waiting on it
#[derive(Clone)]
struct FetchOutcome {
    result: Result<Arc<PixelBuffer>>,
    /// The cell moved on while the fetch ran, so the cache dropped the result
    stale: bool,
}

/// Externally visible state of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    Unloaded,
    Loading,
    Valid,
    Dirty,
}

/// Result of a non-blocking cell access
#[derive(Debug, Clone)]
pub struct VolatileCell {
    /// Cell contents, or a zero placeholder when not yet valid
    pub data: Arc<PixelBuffer>,
    /// Whether `data` holds the cell's real contents
    pub valid: bool,
}

/// Behavior switches fixed when the cache is created
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMode {
    /// Allow `mark_dirty` (level 0 only)
    pub writable: bool,
    /// Materialize untouched cells as zeros instead of reading them, until
    /// the level is first invalidated
    pub empty_dataset: bool,
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub level: usize,
    pub generation: u64,
    /// Remote fetches started
    pub fetches: u64,
    /// Accesses answered from a valid or dirty cell
    pub hits: u64,
    /// Blocking accesses that joined an in-flight fetch
    pub joined: u64,
    pub failures: u64,
    /// Fetch results dropped because the cell was invalidated or modified meanwhile
    pub stale_discards: u64,
    pub resident_cells: usize,
    pub dirty_cells: usize,
}

enum CellState {
    Loading {
        generation: u64,
        done: watch::Receiver<Option<FetchOutcome>>,
    },
    Valid(Arc<PixelBuffer>),
    Dirty(Arc<PixelBuffer>),
}

struct LevelState {
    generation: u64,
    /// Cells absent from the map are UNLOADED
    cells: HashMap<Vec<usize>, CellState>,
    placeholders: HashMap<usize, Arc<PixelBuffer>>,
    /// Untouched cells are known to be zero remotely; cleared by invalidation
    zero_fill: bool,
}

#[derive(Default)]
struct Counters {
    fetches: AtomicU64,
    hits: AtomicU64,
    joined: AtomicU64,
    failures: AtomicU64,
    stale_discards: AtomicU64,
}

struct CacheInner {
    layout: LevelLayout,
    block: BlockSource,
    pool: SharedWorkerPool,
    mode: CacheMode,
    state: Mutex<LevelState>,
    counters: Counters,
}

/// Cache of the cells of one resolution level
#[derive(Clone)]
pub struct CellCache {
    inner: Arc<CacheInner>,
}

enum Access {
    Ready(Arc<PixelBuffer>),
    Wait {
        generation: u64,
        done: watch::Receiver<Option<FetchOutcome>>,
    },
}

impl CellCache {
    pub fn new(
        layout: LevelLayout,
        block: BlockSource,
        pool: SharedWorkerPool,
        mode: CacheMode,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                layout,
                block,
                pool,
                mode,
                state: Mutex::new(LevelState {
                    generation: 0,
                    cells: HashMap::new(),
                    placeholders: HashMap::new(),
                    zero_fill: mode.empty_dataset,
                }),
                counters: Counters::default(),
            }),
        }
    }

    pub fn layout(&self) -> &LevelLayout {
        &self.inner.layout
    }

    pub fn level(&self) -> usize {
        self.inner.layout.level
    }

    pub fn pool(&self) -> &SharedWorkerPool {
        &self.inner.pool
    }

    /// Current generation; bumped by every [`invalidate`](Self::invalidate)
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// State of a cell
    pub fn status(&self, coords: &[usize]) -> Result<CellStatus> {
        self.inner.layout.validate_cell(coords)?;
        let state = self.inner.state.lock();
        Ok(match state.cells.get(coords) {
            None => CellStatus::Unloaded,
            Some(CellState::Loading { .. }) => CellStatus::Loading,
            Some(CellState::Valid(_)) => CellStatus::Valid,
            Some(CellState::Dirty(_)) => CellStatus::Dirty,
        })
    }

    /// Contents of a cell, waiting for it to load if necessary
    ///
    /// Concurrent callers for the same unloaded cell share a single remote
    /// fetch. A failed fetch is reported to every waiter and leaves the cell
    /// unloaded, so a later call retries. If the cell is invalidated or
    /// modified while the fetch runs, its result is dropped and waiters
    /// observe the cell's new state instead.
    pub async fn get(&self, coords: &[usize]) -> Result<Arc<PixelBuffer>> {
        self.inner.layout.validate_cell(coords)?;

        loop {
            let access = {
                let mut state = self.inner.state.lock();
                match state.cells.get(coords) {
                    Some(CellState::Valid(data)) | Some(CellState::Dirty(data)) => {
                        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                        Access::Ready(data.clone())
                    }
                    Some(CellState::Loading { generation, done }) => {
                        self.inner.counters.joined.fetch_add(1, Ordering::Relaxed);
                        Access::Wait {
                            generation: *generation,
                            done: done.clone(),
                        }
                    }
                    None => self.start_load(&mut state, coords),
                }
            };

            let (generation, mut done) = match access {
                Access::Ready(data) => return Ok(data),
                Access::Wait { generation, done } => (generation, done),
            };
            let outcome = match done.wait_for(|o| o.is_some()).await {
                Ok(outcome) => (*outcome).clone(),
                Err(_) => None,
            };
            match outcome {
                Some(FetchOutcome { stale: true, .. }) => continue,
                Some(FetchOutcome { result, .. }) => return result,
                None => {
                    // Fetch task went away without publishing
                    self.inner.forget_loading(coords, generation);
                    return Err(CacheError::Transport(format!(
                        "Fetch of cell {:?} at level {} was abandoned",
                        coords,
                        self.level()
                    )));
                }
            }
        }
    }

    /// Contents of the cell starting at pixel position `min`
    ///
    /// `min` must lie on the cell grid.
    pub async fn get_at(&self, min: &[usize]) -> Result<Arc<PixelBuffer>> {
        let coords = self.inner.layout.cell_at_aligned(min)?;
        self.get(&coords).await
    }

    /// Volatile contents of the cell starting at pixel position `min`
    pub fn peek_at(&self, min: &[usize]) -> Result<VolatileCell> {
        let coords = self.inner.layout.cell_at_aligned(min)?;
        self.peek(&coords)
    }

    /// Current contents of a cell without waiting
    ///
    /// An unloaded cell is queued for loading and reported as invalid with a
    /// zero placeholder.
    pub fn peek(&self, coords: &[usize]) -> Result<VolatileCell> {
        self.inner.layout.validate_cell(coords)?;

        let mut state = self.inner.state.lock();
        let (data, valid) = match state.cells.get(coords) {
            Some(CellState::Valid(data)) | Some(CellState::Dirty(data)) => {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                (data.clone(), true)
            }
            Some(CellState::Loading { .. }) => (self.placeholder(&mut state, coords), false),
            None => match self.start_load(&mut state, coords) {
                Access::Ready(data) => (data, true),
                Access::Wait { .. } => (self.placeholder(&mut state, coords), false),
            },
        };
        Ok(VolatileCell { data, valid })
    }

    /// Replace the contents of a full-resolution cell and mark it dirty
    pub fn mark_dirty(&self, coords: &[usize], data: PixelBuffer) -> Result<()> {
        self.check_writable()?;
        let layout = &self.inner.layout;
        layout.validate_cell(coords)?;
        let expected = layout.cell_len(coords);
        if data.len() != expected || data.pixel_type() != layout.pixel_type {
            return Err(CacheError::InvalidArgument(format!(
                "Cell {:?} holds {} {} elements, got {} {}",
                coords,
                expected,
                layout.pixel_type,
                data.len(),
                data.pixel_type()
            )));
        }

        let mut state = self.inner.state.lock();
        state
            .cells
            .insert(coords.to_vec(), CellState::Dirty(Arc::new(data)));
        trace!(level = layout.level, ?coords, "cell marked dirty");
        Ok(())
    }

    /// Whether cells of this level may be modified
    pub fn is_writable(&self) -> bool {
        self.inner.layout.level == 0 && self.inner.mode.writable
    }

    /// Fail with a configuration error unless the level is writable
    pub fn check_writable(&self) -> Result<()> {
        let level = self.inner.layout.level;
        if level != 0 {
            return Err(CacheError::Configuration(format!(
                "Level {} is read-only; only level 0 can be modified",
                level
            )));
        }
        if !self.inner.mode.writable {
            return Err(CacheError::Configuration(
                "Pyramid was opened read-only".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `patch` to a cell's current contents and mark it dirty
    ///
    /// The patch runs under the cache lock, so concurrent updates of one
    /// cell never lose each other's pixels. When `covers_cell` is set the
    /// patch overwrites every pixel and an unloaded cell is not read first;
    /// otherwise the cell is loaded before patching.
    pub async fn update_cell<F>(&self, coords: &[usize], covers_cell: bool, patch: F) -> Result<()>
    where
        F: Fn(&mut PixelBuffer) -> Result<()>,
    {
        self.check_writable()?;
        let layout = &self.inner.layout;
        layout.validate_cell(coords)?;

        loop {
            {
                let mut state = self.inner.state.lock();
                let base = match state.cells.get(coords) {
                    Some(CellState::Valid(data)) | Some(CellState::Dirty(data)) => {
                        Some(PixelBuffer::clone(data))
                    }
                    _ if covers_cell => Some(PixelBuffer::zeros(
                        layout.pixel_type,
                        layout.cell_len(coords),
                    )),
                    _ => None,
                };
                if let Some(mut updated) = base {
                    patch(&mut updated)?;
                    state
                        .cells
                        .insert(coords.to_vec(), CellState::Dirty(Arc::new(updated)));
                    trace!(level = layout.level, ?coords, "cell updated");
                    return Ok(());
                }
            }
            self.get(coords).await?;
        }
    }

    /// Drop every cell and start a new generation
    ///
    /// In-flight fetches are not cancelled; their results are discarded
    /// when they arrive. Dirty cells are dropped without being written.
    pub fn invalidate(&self) -> u64 {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        state.zero_fill = false;
        let dropped = state.cells.len();
        state.cells.clear();
        debug!(
            level = self.inner.layout.level,
            generation = state.generation,
            dropped,
            "invalidated level"
        );
        state.generation
    }

    /// Coordinates of all dirty cells
    pub fn dirty_cells(&self) -> Vec<Vec<usize>> {
        let state = self.inner.state.lock();
        let mut dirty: Vec<Vec<usize>> = state
            .cells
            .iter()
            .filter(|(_, cell)| matches!(cell, CellState::Dirty(_)))
            .map(|(coords, _)| coords.clone())
            .collect();
        dirty.sort();
        dirty
    }

    /// Write every dirty cell back to the source
    ///
    /// Writes run concurrently through the worker pool. A cell becomes
    /// valid once its own write succeeds; failed cells stay dirty and are
    /// listed in [`CacheError::PartialPersist`].
    pub async fn persist_dirty(&self) -> Result<()> {
        let (generation, dirty) = {
            let state = self.inner.state.lock();
            let dirty: Vec<(Vec<usize>, Arc<PixelBuffer>)> = state
                .cells
                .iter()
                .filter_map(|(coords, cell)| match cell {
                    CellState::Dirty(data) => Some((coords.clone(), data.clone())),
                    _ => None,
                })
                .collect();
            (state.generation, dirty)
        };
        if dirty.is_empty() {
            return Ok(());
        }
        debug!(level = self.level(), cells = dirty.len(), "persisting dirty cells");

        let writes = dirty.into_iter().map(|(coords, data)| async move {
            let layout = &self.inner.layout;
            let min = layout.cell_min(&coords);
            let size = layout.cell_size(&coords);
            let result = self
                .inner
                .pool
                .run(self.inner.block.store(&min, &size, &data))
                .await;
            match result {
                Ok(()) => {
                    self.inner.mark_persisted(&coords, generation, &data);
                    None
                }
                Err(e) => {
                    warn!(level = layout.level, ?coords, error = %e, "failed to persist cell");
                    Some(coords)
                }
            }
        });

        let mut failed: Vec<Vec<usize>> = join_all(writes).await.into_iter().flatten().collect();
        if failed.is_empty() {
            Ok(())
        } else {
            failed.sort();
            Err(CacheError::PartialPersist { failed })
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        let counters = &self.inner.counters;
        CacheStats {
            level: self.inner.layout.level,
            generation: state.generation,
            fetches: counters.fetches.load(Ordering::Relaxed),
            hits: counters.hits.load(Ordering::Relaxed),
            joined: counters.joined.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            stale_discards: counters.stale_discards.load(Ordering::Relaxed),
            resident_cells: state
                .cells
                .values()
                .filter(|c| !matches!(c, CellState::Loading { .. }))
                .count(),
            dirty_cells: state
                .cells
                .values()
                .filter(|c| matches!(c, CellState::Dirty(_)))
                .count(),
        }
    }

    /// Transition an unloaded cell to LOADING and spawn its fetch
    fn start_load(&self, state: &mut LevelState, coords: &[usize]) -> Access {
        let layout = &self.inner.layout;
        if state.zero_fill {
            let data = Arc::new(PixelBuffer::zeros(layout.pixel_type, layout.cell_len(coords)));
            state
                .cells
                .insert(coords.to_vec(), CellState::Valid(data.clone()));
            return Access::Ready(data);
        }

        let generation = state.generation;
        let (tx, done) = watch::channel(None);
        state.cells.insert(
            coords.to_vec(),
            CellState::Loading {
                generation,
                done: done.clone(),
            },
        );
        self.inner.counters.fetches.fetch_add(1, Ordering::Relaxed);
        trace!(level = layout.level, ?coords, generation, "scheduling cell fetch");

        let inner = self.inner.clone();
        let key = coords.to_vec();
        self.inner.pool.spawn(async move {
            let min = inner.layout.cell_min(&key);
            let size = inner.layout.cell_size(&key);
            let result = inner
                .pool
                .run(inner.block.fetch(inner.layout.level, &min, &size))
                .await
                .map(Arc::new);
            let stale = !inner.publish(&key, generation, &result);
            let _ = tx.send(Some(FetchOutcome { result, stale }));
        });

        Access::Wait { generation, done }
    }

    fn placeholder(&self, state: &mut LevelState, coords: &[usize]) -> Arc<PixelBuffer> {
        let len = self.inner.layout.cell_len(coords);
        let pixel_type = self.inner.layout.pixel_type;
        state
            .placeholders
            .entry(len)
            .or_insert_with(|| Arc::new(PixelBuffer::zeros(pixel_type, len)))
            .clone()
    }
}

impl CacheInner {
    /// Store a fetch result if the cell is still waiting for it
    ///
    /// Returns false when the result was dropped as stale.
    fn publish(&self, coords: &[usize], generation: u64, result: &Result<Arc<PixelBuffer>>) -> bool {
        let mut state = self.state.lock();
        let current = state.generation == generation
            && matches!(
                state.cells.get(coords),
                Some(CellState::Loading { generation: g, .. }) if *g == generation
            );
        if !current {
            self.counters.stale_discards.fetch_add(1, Ordering::Relaxed);
            debug!(
                level = self.layout.level,
                ?coords,
                generation,
                "discarding stale fetch result"
            );
            return false;
        }

        match result {
            Ok(data) => {
                state
                    .cells
                    .insert(coords.to_vec(), CellState::Valid(data.clone()));
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(level = self.layout.level, ?coords, error = %e, "cell fetch failed");
                state.cells.remove(coords);
            }
        }
        true
    }

    fn forget_loading(&self, coords: &[usize], generation: u64) {
        let mut state = self.state.lock();
        if matches!(
            state.cells.get(coords),
            Some(CellState::Loading { generation: g, .. }) if *g == generation
        ) {
            state.cells.remove(coords);
        }
    }

    /// DIRTY -> VALID, unless the cell changed while it was being written
    fn mark_persisted(&self, coords: &[usize], generation: u64, written: &Arc<PixelBuffer>) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        let unchanged = matches!(
            state.cells.get(coords),
            Some(CellState::Dirty(data)) if Arc::ptr_eq(data, written)
        );
        if unchanged {
            state
                .cells
                .insert(coords.to_vec(), CellState::Valid(written.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axes::AxisMap;
    use crate::source::MemoryDataSource;
    use crate::types::PixelType;
    use std::time::Duration;

    fn create_test_cache(mode: CacheMode) -> (Arc<MemoryDataSource>, CellCache) {
        let memory = Arc::new(
            MemoryDataSource::new(PixelType::U8, vec![[8, 8, 1, 1, 1]], [4, 4, 1, 1, 1]).unwrap(),
        );
        memory.fill_level(0, |p| (p[0] + 8 * p[1]) as f64).unwrap();
        let axis_map = AxisMap::from_sizes([8, 8, 1, 1, 1]).unwrap();
        let block = BlockSource::new(memory.clone(), axis_map, PixelType::U8);
        let layout = LevelLayout::new(0, PixelType::U8, vec![8, 8], vec![4, 4]).unwrap();
        let pool = SharedWorkerPool::new(4).unwrap();
        (memory, CellCache::new(layout, block, pool, mode))
    }

    async fn wait_until_valid(cache: &CellCache, coords: &[usize]) {
        for _ in 0..200 {
            if cache.status(coords).unwrap() == CellStatus::Valid {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cell {:?} never became valid", coords);
    }

    #[tokio::test]
    async fn test_get_loads_cell_once() {
        let (memory, cache) = create_test_cache(CacheMode::default());
        assert_eq!(cache.status(&[1, 0]).unwrap(), CellStatus::Unloaded);

        let data = cache.get(&[1, 0]).await.unwrap();
        assert_eq!(&data.as_slice::<u8>().unwrap()[0..4], &[4, 5, 6, 7]);
        assert_eq!(cache.status(&[1, 0]).unwrap(), CellStatus::Valid);

        cache.get(&[1, 0]).await.unwrap();
        assert_eq!(memory.read_count(), 1);
        assert_eq!(cache.stats().fetches, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_peek_schedules_load() {
        let (memory, cache) = create_test_cache(CacheMode::default());

        let first = cache.peek(&[0, 1]).unwrap();
        assert!(!first.valid);
        assert_eq!(first.data.len(), 16);
        assert!(first.data.as_slice::<u8>().unwrap().iter().all(|&v| v == 0));

        wait_until_valid(&cache, &[0, 1]).await;
        let second = cache.peek(&[0, 1]).unwrap();
        assert!(second.valid);
        assert_eq!(second.data.as_slice::<u8>().unwrap()[0], 32);
        assert_eq!(memory.read_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_coordinates_rejected_before_fetch() {
        let (memory, cache) = create_test_cache(CacheMode::default());
        assert!(matches!(
            cache.get(&[2, 0]).await,
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(cache.peek(&[0]), Err(CacheError::InvalidArgument(_))));
        assert_eq!(memory.read_count(), 0);
    }

    #[tokio::test]
    async fn test_mark_dirty_requires_writable() {
        let (_, cache) = create_test_cache(CacheMode::default());
        let err = cache
            .mark_dirty(&[0, 0], PixelBuffer::zeros(PixelType::U8, 16))
            .unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_mark_dirty_checks_buffer() {
        let (_, cache) = create_test_cache(CacheMode {
            writable: true,
            ..Default::default()
        });
        assert!(matches!(
            cache.mark_dirty(&[0, 0], PixelBuffer::zeros(PixelType::U8, 15)),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            cache.mark_dirty(&[0, 0], PixelBuffer::zeros(PixelType::U16, 16)),
            Err(CacheError::InvalidArgument(_))
        ));

        cache
            .mark_dirty(&[0, 0], PixelBuffer::from(vec![9u8; 16]))
            .unwrap();
        assert_eq!(cache.status(&[0, 0]).unwrap(), CellStatus::Dirty);
        assert_eq!(cache.dirty_cells(), vec![vec![0, 0]]);
        let data = cache.get(&[0, 0]).await.unwrap();
        assert_eq!(data.as_slice::<u8>().unwrap()[0], 9);
    }

    #[tokio::test]
    async fn test_persist_writes_and_validates() {
        let (memory, cache) = create_test_cache(CacheMode {
            writable: true,
            ..Default::default()
        });
        cache
            .mark_dirty(&[1, 1], PixelBuffer::from(vec![200u8; 16]))
            .unwrap();
        cache.persist_dirty().await.unwrap();

        assert_eq!(memory.write_count(), 1);
        assert_eq!(cache.status(&[1, 1]).unwrap(), CellStatus::Valid);
        let level = memory.snapshot(0).unwrap();
        assert_eq!(level.value_at(4 + 8 * 4), Some(200.0));
        assert_eq!(level.value_at(0), Some(0.0));
    }

    #[tokio::test]
    async fn test_invalidate_drops_cells() {
        let (memory, cache) = create_test_cache(CacheMode {
            writable: true,
            ..Default::default()
        });
        cache.get(&[0, 0]).await.unwrap();
        cache
            .mark_dirty(&[1, 0], PixelBuffer::from(vec![1u8; 16]))
            .unwrap();

        assert_eq!(cache.invalidate(), 1);
        assert_eq!(cache.status(&[0, 0]).unwrap(), CellStatus::Unloaded);
        assert_eq!(cache.status(&[1, 0]).unwrap(), CellStatus::Unloaded);

        cache.get(&[0, 0]).await.unwrap();
        assert_eq!(memory.read_count(), 2);
        assert_eq!(cache.stats().generation, 1);
    }

    #[tokio::test]
    async fn test_empty_dataset_skips_reads() {
        let (memory, cache) = create_test_cache(CacheMode {
            writable: true,
            empty_dataset: true,
        });
        let peeked = cache.peek(&[1, 1]).unwrap();
        assert!(peeked.valid);
        let data = cache.get(&[0, 1]).await.unwrap();
        assert!(data.as_slice::<u8>().unwrap().iter().all(|&v| v == 0));
        assert_eq!(memory.read_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_dataset_reads_after_invalidate() {
        let (memory, cache) = create_test_cache(CacheMode {
            writable: true,
            empty_dataset: true,
        });
        cache
            .mark_dirty(&[0, 0], PixelBuffer::from(vec![9u8; 16]))
            .unwrap();
        cache.persist_dirty().await.unwrap();
        cache.invalidate();

        let data = cache.get(&[0, 0]).await.unwrap();
        assert_eq!(data.value_at(0), Some(9.0));
        assert_eq!(memory.read_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_keep_every_pixel() {
        let (_, cache) = create_test_cache(CacheMode {
            writable: true,
            ..Default::default()
        });
        let marker = PixelBuffer::from(vec![100u8]);

        for _ in 0..50 {
            let tasks: Vec<_> = (0..8)
                .map(|i| {
                    let cache = cache.clone();
                    let marker = marker.clone();
                    tokio::spawn(async move {
                        cache
                            .update_cell(&[0, 0], false, |buf| {
                                buf.copy_within_from(i, &marker, 0, 1)
                            })
                            .await
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap().unwrap();
            }

            let data = cache.get(&[0, 0]).await.unwrap();
            assert_eq!(&data.as_slice::<u8>().unwrap()[0..8], &[100; 8]);
            assert_eq!(data.value_at(8), Some(8.0));
            cache.invalidate();
        }
    }

    #[tokio::test]
    async fn test_update_covering_cell_skips_read() {
        let (memory, cache) = create_test_cache(CacheMode {
            writable: true,
            ..Default::default()
        });
        let full = PixelBuffer::from(vec![3u8; 16]);
        cache
            .update_cell(&[1, 1], true, |buf| buf.copy_within_from(0, &full, 0, 16))
            .await
            .unwrap();

        assert_eq!(cache.status(&[1, 1]).unwrap(), CellStatus::Dirty);
        assert_eq!(memory.read_count(), 0);
    }

    #[tokio::test]
    async fn test_update_rejected_before_fetch_when_read_only() {
        let (memory, cache) = create_test_cache(CacheMode::default());
        assert!(!cache.is_writable());
        let err = cache
            .update_cell(&[0, 0], false, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
        assert_eq!(memory.read_count(), 0);
    }

    #[tokio::test]
    async fn test_cell_access_by_aligned_position() {
        let (memory, cache) = create_test_cache(CacheMode::default());
        let data = cache.get_at(&[4, 0]).await.unwrap();
        assert_eq!(data.value_at(0), Some(4.0));
        assert!(cache.peek_at(&[4, 0]).unwrap().valid);

        assert!(matches!(
            cache.get_at(&[3, 0]).await,
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            cache.peek_at(&[8, 0]),
            Err(CacheError::InvalidArgument(_))
        ));
        assert_eq!(memory.read_count(), 1);
    }
}
