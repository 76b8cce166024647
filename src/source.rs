//! Remote data sources the cache reads from and writes back to

use crate::error::{CacheError, Result};
use crate::types::{PixelBuffer, PixelType, CANONICAL_AXES};
use crate::utils::copy_block;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Capability interface of a remote multi-resolution dataset
///
/// All coordinates are canonical `[x, y, z, c, t]`. Implementations must be
/// safe to call from many worker tasks at once; any timeout policy belongs
/// to the implementation's transport.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Pixel type of every level
    async fn pixel_type(&self) -> Result<PixelType>;

    /// Number of resolution levels
    async fn num_levels(&self) -> Result<usize>;

    /// Canonical size of a level
    async fn sizes(&self, level: usize) -> Result<[usize; CANONICAL_AXES]>;

    /// Native block shape of a level
    async fn cell_shape(&self, level: usize) -> Result<[usize; CANONICAL_AXES]>;

    /// Read `size` pixels starting at `min`, flattened with X fastest
    ///
    /// Must return exactly `size.iter().product()` elements or fail.
    async fn read(
        &self,
        level: usize,
        min: [usize; CANONICAL_AXES],
        size: [usize; CANONICAL_AXES],
    ) -> Result<PixelBuffer>;

    /// Write a region of the full-resolution level
    async fn write(
        &self,
        min: [usize; CANONICAL_AXES],
        size: [usize; CANONICAL_AXES],
        data: &PixelBuffer,
    ) -> Result<()>;

    /// Whether one `read`/`write` may span several channels or timepoints
    fn supports_multi_slice(&self) -> bool {
        false
    }
}

/// In-memory multi-resolution dataset
///
/// Useful as a local backend and as a stand-in for the remote process in
/// tests. Levels are stored as dense canonical volumes.
pub struct MemoryDataSource {
    pixel_type: PixelType,
    sizes: Vec<[usize; CANONICAL_AXES]>,
    block_shape: [usize; CANONICAL_AXES],
    levels: Vec<RwLock<PixelBuffer>>,
    multi_slice: bool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryDataSource {
    /// Create a zero-filled dataset with the given per-level canonical sizes
    pub fn new(
        pixel_type: PixelType,
        sizes: Vec<[usize; CANONICAL_AXES]>,
        block_shape: [usize; CANONICAL_AXES],
    ) -> Result<Self> {
        if sizes.is_empty() {
            return Err(CacheError::Configuration(
                "Dataset needs at least one resolution level".to_string(),
            ));
        }
        if sizes.iter().flatten().any(|&s| s == 0) {
            return Err(CacheError::Configuration(format!(
                "Dataset sizes must be positive: {:?}",
                sizes
            )));
        }
        let levels = sizes
            .iter()
            .map(|s| RwLock::new(PixelBuffer::zeros(pixel_type, s.iter().product())))
            .collect();

        Ok(Self {
            pixel_type,
            sizes,
            block_shape,
            levels,
            multi_slice: false,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    /// Create a dataset whose levels halve X, Y and Z until `num_levels` exist
    pub fn with_halving_levels(
        pixel_type: PixelType,
        full_size: [usize; CANONICAL_AXES],
        block_shape: [usize; CANONICAL_AXES],
        num_levels: usize,
    ) -> Result<Self> {
        let mut sizes = vec![full_size];
        for _ in 1..num_levels.max(1) {
            let prev = sizes[sizes.len() - 1];
            let mut next = prev;
            for s in next.iter_mut().take(3) {
                *s = (*s / 2).max(1);
            }
            sizes.push(next);
        }
        Self::new(pixel_type, sizes, block_shape)
    }

    /// Allow reads and writes spanning several channels/timepoints
    pub fn with_multi_slice(mut self, multi_slice: bool) -> Self {
        self.multi_slice = multi_slice;
        self
    }

    /// Overwrite every pixel of a level with `f([x, y, z, c, t])`
    pub fn fill_level<F>(&self, level: usize, f: F) -> Result<()>
    where
        F: Fn([usize; CANONICAL_AXES]) -> f64,
    {
        let sizes = *self.level_sizes(level)?;
        let mut data = self.levels[level].write();
        let mut pos = [0usize; CANONICAL_AXES];
        for i in 0..data.len() {
            let mut rem = i;
            for (p, &s) in pos.iter_mut().zip(sizes.iter()) {
                *p = rem % s;
                rem /= s;
            }
            let v = f(pos);
            match &mut *data {
                PixelBuffer::U8(d) => d[i] = v as u8,
                PixelBuffer::U16(d) => d[i] = v as u16,
                PixelBuffer::F32(d) => d[i] = v as f32,
            }
        }
        Ok(())
    }

    /// Copy of a whole level
    pub fn snapshot(&self, level: usize) -> Result<PixelBuffer> {
        self.level_sizes(level)?;
        Ok(self.levels[level].read().clone())
    }

    /// Number of `read` calls served so far
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `write` calls served so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn level_sizes(&self, level: usize) -> Result<&[usize; CANONICAL_AXES]> {
        self.sizes.get(level).ok_or_else(|| {
            CacheError::InvalidArgument(format!(
                "Level {} out of range ({} levels)",
                level,
                self.sizes.len()
            ))
        })
    }

    fn check_region(
        &self,
        level: usize,
        min: &[usize; CANONICAL_AXES],
        size: &[usize; CANONICAL_AXES],
    ) -> Result<[usize; CANONICAL_AXES]> {
        let sizes = *self.level_sizes(level)?;
        let in_bounds = (0..CANONICAL_AXES).all(|i| {
            size[i] > 0 && min[i].checked_add(size[i]).is_some_and(|end| end <= sizes[i])
        });
        if !in_bounds {
            return Err(CacheError::Transport(format!(
                "Region {:?}+{:?} outside level {} of size {:?}",
                min, size, level, sizes
            )));
        }
        if !self.multi_slice && (size[3] > 1 || size[4] > 1) {
            return Err(CacheError::Transport(format!(
                "Multi-slice request {:?} not supported",
                size
            )));
        }
        Ok(sizes)
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    async fn pixel_type(&self) -> Result<PixelType> {
        Ok(self.pixel_type)
    }

    async fn num_levels(&self) -> Result<usize> {
        Ok(self.sizes.len())
    }

    async fn sizes(&self, level: usize) -> Result<[usize; CANONICAL_AXES]> {
        self.level_sizes(level).copied()
    }

    async fn cell_shape(&self, level: usize) -> Result<[usize; CANONICAL_AXES]> {
        self.level_sizes(level)?;
        Ok(self.block_shape)
    }

    async fn read(
        &self,
        level: usize,
        min: [usize; CANONICAL_AXES],
        size: [usize; CANONICAL_AXES],
    ) -> Result<PixelBuffer> {
        let sizes = self.check_region(level, &min, &size)?;
        self.reads.fetch_add(1, Ordering::SeqCst);

        let volume = self.levels[level].read();
        let mut out = PixelBuffer::zeros(self.pixel_type, size.iter().product());
        copy_block(&volume, &sizes, &min, &mut out, &size, &[0; CANONICAL_AXES], &size)?;
        Ok(out)
    }

    async fn write(
        &self,
        min: [usize; CANONICAL_AXES],
        size: [usize; CANONICAL_AXES],
        data: &PixelBuffer,
    ) -> Result<()> {
        let sizes = self.check_region(0, &min, &size)?;
        if data.len() != size.iter().product::<usize>() || data.pixel_type() != self.pixel_type {
            return Err(CacheError::Transport(format!(
                "Write buffer of {} {} elements does not match region {:?}",
                data.len(),
                data.pixel_type(),
                size
            )));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut volume = self.levels[0].write();
        copy_block(data, &size, &[0; CANONICAL_AXES], &mut volume, &sizes, &min, &size)
    }

    fn supports_multi_slice(&self) -> bool {
        self.multi_slice
    }
}
