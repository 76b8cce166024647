//! Multi-resolution image pyramid backed by one cell cache per level

use crate::axes::AxisMap;
use crate::block::BlockSource;
use crate::cache::{CacheMode, CacheStats, CellCache};
use crate::config::PyramidOptions;
use crate::error::{CacheError, Result};
use crate::layout::LevelLayout;
use crate::pool::SharedWorkerPool;
use crate::source::DataSource;
use crate::types::{Axis, PixelType, CANONICAL_AXES};
use crate::view::ImageView;
use std::sync::Arc;
use tracing::{debug, info};

/// Number of spatial axes scale factors are computed for
pub const SPATIAL_AXES: usize = 3;

/// Per-level scale factors relative to full resolution
///
/// A level counts as half its predecessor along an axis only when
/// `parent / 2 == size` in integer division; otherwise the parent's factor
/// carries over unchanged.
pub fn mipmap_scales(sizes: &[Vec<usize>]) -> Vec<Vec<f64>> {
    let mut scales: Vec<Vec<f64>> = Vec::with_capacity(sizes.len());
    for (level, level_sizes) in sizes.iter().enumerate() {
        if level == 0 {
            scales.push(vec![1.0; level_sizes.len()]);
            continue;
        }
        let parent = &sizes[level - 1];
        let parent_scale = &scales[level - 1];
        let scale = level_sizes
            .iter()
            .enumerate()
            .map(|(d, &size)| {
                let factor = parent_scale.get(d).copied().unwrap_or(1.0);
                match parent.get(d) {
                    Some(&p) if p / 2 == size => 2.0 * factor,
                    _ => factor,
                }
            })
            .collect();
        scales.push(scale);
    }
    scales
}

/// Lazily loaded multi-resolution view of a remote dataset
pub struct ImagePyramid {
    pixel_type: PixelType,
    axis_map: AxisMap,
    level_sizes: Vec<[usize; CANONICAL_AXES]>,
    scales: Vec<[f64; SPATIAL_AXES]>,
    levels: Vec<CellCache>,
    pool: SharedWorkerPool,
    owns_pool: bool,
}

impl ImagePyramid {
    /// Open a pyramid with its own worker pool of `options.num_workers` slots
    pub async fn open(source: Arc<dyn DataSource>, options: PyramidOptions) -> Result<Self> {
        options.validate()?;
        let pool = SharedWorkerPool::new(options.num_workers)?;
        let mut pyramid = Self::open_with_pool(source, pool, options).await?;
        pyramid.owns_pool = true;
        Ok(pyramid)
    }

    /// Open a pyramid that loads through an existing, possibly shared, pool
    pub async fn open_with_pool(
        source: Arc<dyn DataSource>,
        pool: SharedWorkerPool,
        options: PyramidOptions,
    ) -> Result<Self> {
        options.validate()?;

        let pixel_type = source.pixel_type().await?;
        let num_levels = source.num_levels().await?;
        if num_levels == 0 {
            return Err(CacheError::Configuration(
                "Dataset has no resolution levels".to_string(),
            ));
        }

        let mut level_sizes = Vec::with_capacity(num_levels);
        let mut block_shapes = Vec::with_capacity(num_levels);
        for level in 0..num_levels {
            level_sizes.push(source.sizes(level).await?);
            block_shapes.push(source.cell_shape(level).await?);
        }

        let axis_map = AxisMap::from_sizes(level_sizes[0])?;
        check_level_consistency(&axis_map, &level_sizes)?;

        let block = BlockSource::new(source, axis_map, pixel_type);
        let mut levels = Vec::with_capacity(num_levels);
        for (level, (sizes, block_shape)) in level_sizes.iter().zip(&block_shapes).enumerate() {
            let dims = axis_map.reduced_dims(sizes);
            let cell_shape = level_cell_shape(&axis_map, level, block_shape, &options);
            let layout = LevelLayout::new(level, pixel_type, dims, cell_shape)?;
            debug!("{}", layout.summary());

            let mode = CacheMode {
                writable: options.writable && level == 0,
                empty_dataset: options.empty_dataset,
            };
            levels.push(CellCache::new(layout, block.clone(), pool.clone(), mode));
        }

        let spatial: Vec<Vec<usize>> = level_sizes
            .iter()
            .map(|s| s[..SPATIAL_AXES].to_vec())
            .collect();
        let scales = mipmap_scales(&spatial)
            .into_iter()
            .map(|s| [s[0], s[1], s[2]])
            .collect();

        info!(
            axes = %axis_map,
            levels = num_levels,
            pixel_type = %pixel_type,
            workers = pool.num_workers(),
            "opened image pyramid"
        );

        Ok(Self {
            pixel_type,
            axis_map,
            level_sizes,
            scales,
            levels,
            pool,
            owns_pool: false,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn num_channels(&self) -> usize {
        self.level_sizes[0][Axis::C.index()]
    }

    pub fn num_timepoints(&self) -> usize {
        self.level_sizes[0][Axis::T.index()]
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    /// Mapping between canonical and reduced axes, including presence flags
    pub fn axis_map(&self) -> &AxisMap {
        &self.axis_map
    }

    /// Worker pool shared by all levels
    pub fn pool(&self) -> &SharedWorkerPool {
        &self.pool
    }

    /// Canonical sizes of a level
    pub fn canonical_sizes(&self, level: usize) -> Result<[usize; CANONICAL_AXES]> {
        self.check_level(level)?;
        Ok(self.level_sizes[level])
    }

    /// Reduced dimensions of a level
    pub fn dimensions(&self, level: usize) -> Result<Vec<usize>> {
        Ok(self.level(level)?.layout().dims.clone())
    }

    /// Cell shape of a level
    pub fn cell_shape(&self, level: usize) -> Result<Vec<usize>> {
        Ok(self.level(level)?.layout().cell_shape.clone())
    }

    /// X, Y, Z scale factors of a level relative to level 0
    pub fn scale_factors(&self, level: usize) -> Result<[f64; SPATIAL_AXES]> {
        self.check_level(level)?;
        Ok(self.scales[level])
    }

    /// Cell cache of a level
    pub fn level(&self, level: usize) -> Result<&CellCache> {
        self.check_level(level)?;
        Ok(&self.levels[level])
    }

    /// View of all axes of a level
    pub fn image(&self, level: usize) -> Result<ImageView> {
        Ok(ImageView::new(self.level(level)?.clone()))
    }

    /// One pyramid per channel, all sharing this pyramid's caches and pool
    pub fn split_into_channels(&self) -> Result<Vec<ChannelPyramid>> {
        (0..self.num_channels())
            .map(|channel| {
                let images = self
                    .levels
                    .iter()
                    .map(|cache| match self.axis_map.dimension_of(Axis::C) {
                        Some(dim) => ImageView::for_channel(cache.clone(), dim, channel),
                        None => Ok(ImageView::new(cache.clone())),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(ChannelPyramid {
                    channel,
                    images,
                    scales: self.scales.clone(),
                    has_timepoints: self.axis_map.has_timepoints(),
                })
            })
            .collect()
    }

    /// Write every dirty full-resolution cell back to the source
    pub async fn persist(&self) -> Result<()> {
        self.levels[0].persist_dirty().await
    }

    /// Drop the cached state of every level
    pub fn invalidate(&self) {
        for cache in &self.levels {
            cache.invalidate();
        }
    }

    /// Counters of every level
    pub fn stats(&self) -> PyramidStats {
        PyramidStats {
            axis_order: self.axis_map.axis_order(),
            pixel_type: self.pixel_type,
            levels: self.levels.iter().map(|c| c.stats()).collect(),
        }
    }

    /// Release the pyramid; a pool created by [`open`](Self::open) is closed
    pub fn close(self) {
        if self.owns_pool {
            self.pool.close();
        }
        debug!(axes = %self.axis_map, "closed image pyramid");
    }

    fn check_level(&self, level: usize) -> Result<()> {
        if level >= self.levels.len() {
            return Err(CacheError::InvalidArgument(format!(
                "Level {} out of range ({} levels)",
                level,
                self.levels.len()
            )));
        }
        Ok(())
    }
}

/// Per-channel stack of level views
#[derive(Clone)]
pub struct ChannelPyramid {
    channel: usize,
    images: Vec<ImageView>,
    scales: Vec<[f64; SPATIAL_AXES]>,
    has_timepoints: bool,
}

impl ChannelPyramid {
    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn num_levels(&self) -> usize {
        self.images.len()
    }

    pub fn has_timepoints(&self) -> bool {
        self.has_timepoints
    }

    /// View of this channel at a level
    pub fn image(&self, level: usize) -> Option<&ImageView> {
        self.images.get(level)
    }

    pub fn images(&self) -> &[ImageView] {
        &self.images
    }

    pub fn scale_factors(&self, level: usize) -> Option<[f64; SPATIAL_AXES]> {
        self.scales.get(level).copied()
    }
}

/// Statistics of a whole pyramid
#[derive(Debug, Clone)]
pub struct PyramidStats {
    pub axis_order: String,
    pub pixel_type: PixelType,
    pub levels: Vec<CacheStats>,
}

impl PyramidStats {
    pub fn total_fetches(&self) -> u64 {
        self.levels.iter().map(|l| l.fetches).sum()
    }

    pub fn summary(&self) -> String {
        let resident: usize = self.levels.iter().map(|l| l.resident_cells).sum();
        let dirty: usize = self.levels.iter().map(|l| l.dirty_cells).sum();
        format!(
            "{} {} pyramid: {} levels, {} resident cells ({} dirty), {} fetches",
            self.axis_order,
            self.pixel_type,
            self.levels.len(),
            resident,
            dirty,
            self.total_fetches()
        )
    }
}

/// Reduced cell shape of a level
///
/// Spatial axes use the source's native block size, C and T one slice per
/// cell. The options may override the full-resolution shape.
fn level_cell_shape(
    axis_map: &AxisMap,
    level: usize,
    block_shape: &[usize; CANONICAL_AXES],
    options: &PyramidOptions,
) -> Vec<usize> {
    let mut shape = vec![1; axis_map.num_dimensions()];
    for axis in Axis::ALL {
        if let Some(d) = axis_map.dimension_of(axis) {
            shape[d] = if axis.is_spatial() {
                block_shape[axis.index()].max(1)
            } else {
                1
            };
            if level == 0 {
                if let Some(extent) = options.cell_dimension(d) {
                    shape[d] = extent;
                }
            }
        }
    }
    shape
}

/// Reject pyramids whose levels disagree on channels, timepoints or axes
fn check_level_consistency(
    axis_map: &AxisMap,
    level_sizes: &[[usize; CANONICAL_AXES]],
) -> Result<()> {
    let base = level_sizes[0];
    for (level, sizes) in level_sizes.iter().enumerate().skip(1) {
        for axis in [Axis::C, Axis::T] {
            if sizes[axis.index()] != base[axis.index()] {
                return Err(CacheError::Configuration(format!(
                    "Level {} has {} {} slices, level 0 has {}",
                    level,
                    sizes[axis.index()],
                    axis.label(),
                    base[axis.index()]
                )));
            }
        }
        for axis in Axis::ALL {
            if axis_map.dimension_of(axis).is_none() && sizes[axis.index()] > 1 {
                return Err(CacheError::Configuration(format!(
                    "Level {} has extent {} along {}, which is absent at full resolution",
                    level,
                    sizes[axis.index()],
                    axis.label()
                )));
            }
        }
    }
    Ok(())
}
