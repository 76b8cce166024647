//! Array-like views over a level cache, optionally restricted to one channel

use crate::cache::CellCache;
use crate::error::{CacheError, Result};
use crate::layout::LevelLayout;
use crate::types::{Pixel, PixelBuffer};
use crate::utils::copy_block;
use futures::future::try_join_all;
use ndarray::ArrayD;

/// Region read through the volatile path
#[derive(Debug, Clone)]
pub struct VolatileRegion {
    /// Region contents; pixels of cells that are not loaded yet are zero
    pub data: PixelBuffer,
    /// True only if every covered cell was valid
    pub valid: bool,
}

/// Restriction of a view to a single channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChannelSlice {
    /// Reduced dimension holding the channel axis
    dim: usize,
    channel: usize,
}

/// View of one resolution level backed by its cell cache
#[derive(Clone)]
pub struct ImageView {
    cache: CellCache,
    channel: Option<ChannelSlice>,
}

impl ImageView {
    /// View of every axis of the level
    pub fn new(cache: CellCache) -> Self {
        Self {
            cache,
            channel: None,
        }
    }

    /// View of one channel; `channel_dim` is the reduced dimension of C
    pub fn for_channel(cache: CellCache, channel_dim: usize, channel: usize) -> Result<Self> {
        let dims = &cache.layout().dims;
        if channel_dim >= dims.len() || channel >= dims[channel_dim] {
            return Err(CacheError::InvalidArgument(format!(
                "Channel {} (dimension {}) outside level dimensions {:?}",
                channel, channel_dim, dims
            )));
        }
        Ok(Self {
            cache,
            channel: Some(ChannelSlice {
                dim: channel_dim,
                channel,
            }),
        })
    }

    pub fn cache(&self) -> &CellCache {
        &self.cache
    }

    pub fn level(&self) -> usize {
        self.cache.level()
    }

    /// Channel this view is restricted to
    pub fn channel(&self) -> Option<usize> {
        self.channel.map(|c| c.channel)
    }

    /// Dimensions of the view
    pub fn dimensions(&self) -> Vec<usize> {
        self.strip(&self.cache.layout().dims)
    }

    /// Cell shape of the view
    pub fn cell_shape(&self) -> Vec<usize> {
        self.strip(&self.cache.layout().cell_shape)
    }

    /// Read a region, waiting for every covered cell
    pub async fn get_region(&self, min: &[usize], size: &[usize]) -> Result<PixelBuffer> {
        let (min, size) = self.expand_region(min, size)?;
        let layout = self.cache.layout();
        let cells = layout.cells_overlapping(&min, &size)?;

        let loads = cells.iter().map(|coords| self.cache.get(coords));
        let buffers = try_join_all(loads).await?;

        let mut out = PixelBuffer::zeros(layout.pixel_type, size.iter().product());
        for (coords, data) in cells.iter().zip(buffers.iter()) {
            copy_cell_overlap(layout, coords, data, &min, &size, &mut out)?;
        }
        Ok(out)
    }

    /// Read a region as an array indexed in reverse axis order
    pub async fn get_array<T: Pixel>(&self, min: &[usize], size: &[usize]) -> Result<ArrayD<T>> {
        self.get_region(min, size).await?.to_array(size)
    }

    /// Read a region without waiting; missing cells are queued for loading
    pub fn peek_region(&self, min: &[usize], size: &[usize]) -> Result<VolatileRegion> {
        let (min, size) = self.expand_region(min, size)?;
        let layout = self.cache.layout();

        let mut out = PixelBuffer::zeros(layout.pixel_type, size.iter().product());
        let mut valid = true;
        for coords in layout.cells_overlapping(&min, &size)? {
            let cell = self.cache.peek(&coords)?;
            if cell.valid {
                copy_cell_overlap(layout, &coords, &cell.data, &min, &size, &mut out)?;
            } else {
                valid = false;
            }
        }
        Ok(VolatileRegion { data: out, valid })
    }

    /// Value of a single pixel
    pub async fn get_sample(&self, position: &[usize]) -> Result<f64> {
        let ones = vec![1; position.len()];
        let data = self.get_region(position, &ones).await?;
        data.value_at(0).ok_or_else(|| {
            CacheError::InvalidArgument(format!("No sample at {:?}", position))
        })
    }

    /// Overwrite a full-resolution region; touched cells become dirty
    ///
    /// Cells only partly covered by the region are loaded first.
    pub async fn write_region(&self, min: &[usize], size: &[usize], data: &PixelBuffer) -> Result<()> {
        self.cache.check_writable()?;
        let (min, size) = self.expand_region(min, size)?;
        let layout = self.cache.layout();
        if data.len() != size.iter().product::<usize>() || data.pixel_type() != layout.pixel_type {
            return Err(CacheError::InvalidArgument(format!(
                "Region {:?} needs {} {} elements, got {} {}",
                size,
                size.iter().product::<usize>(),
                layout.pixel_type,
                data.len(),
                data.pixel_type()
            )));
        }

        for coords in layout.cells_overlapping(&min, &size)? {
            let overlap = CellOverlap::new(layout, &coords, &min, &size);
            let covers_cell = overlap.block == overlap.cell_dims;
            self.cache
                .update_cell(&coords, covers_cell, |cell| {
                    copy_block(
                        data,
                        &size,
                        &overlap.region_min,
                        cell,
                        &overlap.cell_dims,
                        &overlap.cell_min,
                        &overlap.block,
                    )
                })
                .await?;
        }
        Ok(())
    }

    fn strip(&self, values: &[usize]) -> Vec<usize> {
        match self.channel {
            Some(slice) => values
                .iter()
                .enumerate()
                .filter(|(d, _)| *d != slice.dim)
                .map(|(_, &v)| v)
                .collect(),
            None => values.to_vec(),
        }
    }

    /// Translate a view region to level coordinates and validate it
    fn expand_region(&self, min: &[usize], size: &[usize]) -> Result<(Vec<usize>, Vec<usize>)> {
        let (min, size) = match self.channel {
            Some(slice) => {
                let rank = self.cache.layout().num_dimensions() - 1;
                if min.len() != rank || size.len() != rank {
                    return Err(CacheError::InvalidArgument(format!(
                        "Channel view expects {} coordinates",
                        rank
                    )));
                }
                let mut full_min = min.to_vec();
                let mut full_size = size.to_vec();
                full_min.insert(slice.dim, slice.channel);
                full_size.insert(slice.dim, 1);
                (full_min, full_size)
            }
            None => (min.to_vec(), size.to_vec()),
        };
        self.cache.layout().validate_region(&min, &size)?;
        Ok((min, size))
    }
}

/// Intersection of one cell with a region, in cell-local and region-local offsets
struct CellOverlap {
    cell_dims: Vec<usize>,
    cell_min: Vec<usize>,
    region_min: Vec<usize>,
    block: Vec<usize>,
}

impl CellOverlap {
    fn new(layout: &LevelLayout, coords: &[usize], min: &[usize], size: &[usize]) -> Self {
        let range = layout.cell_data_range(coords);
        let lo: Vec<usize> = range.iter().zip(min).map(|(r, &m)| r.0.max(m)).collect();
        let hi: Vec<usize> = range
            .iter()
            .zip(min.iter().zip(size))
            .map(|(r, (&m, &s))| r.1.min(m + s))
            .collect();

        Self {
            cell_dims: layout.cell_size(coords),
            cell_min: lo.iter().zip(&range).map(|(&l, r)| l - r.0).collect(),
            region_min: lo.iter().zip(min).map(|(&l, &m)| l - m).collect(),
            block: lo.iter().zip(&hi).map(|(&l, &h)| h - l).collect(),
        }
    }
}

/// Copy the part of a cell that overlaps the region `[min, min + size)` into `out`
fn copy_cell_overlap(
    layout: &LevelLayout,
    coords: &[usize],
    cell: &PixelBuffer,
    min: &[usize],
    size: &[usize],
    out: &mut PixelBuffer,
) -> Result<()> {
    let overlap = CellOverlap::new(layout, coords, min, size);
    copy_block(
        cell,
        &overlap.cell_dims,
        &overlap.cell_min,
        out,
        size,
        &overlap.region_min,
        &overlap.block,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axes::AxisMap;
    use crate::block::BlockSource;
    use crate::cache::CacheMode;
    use crate::pool::SharedWorkerPool;
    use crate::source::MemoryDataSource;
    use crate::types::PixelType;
    use std::sync::Arc;

    fn create_test_view(writable: bool) -> (Arc<MemoryDataSource>, ImageView) {
        let memory = Arc::new(
            MemoryDataSource::new(PixelType::U16, vec![[10, 6, 1, 2, 1]], [4, 4, 1, 1, 1]).unwrap(),
        );
        memory
            .fill_level(0, |p| (p[0] + 10 * p[1] + 1000 * p[3]) as f64)
            .unwrap();
        let axis_map = AxisMap::from_sizes([10, 6, 1, 2, 1]).unwrap();
        let block = BlockSource::new(memory.clone(), axis_map, PixelType::U16);
        let layout = LevelLayout::new(0, PixelType::U16, vec![10, 6, 2], vec![4, 4, 1]).unwrap();
        let pool = SharedWorkerPool::new(2).unwrap();
        let mode = CacheMode {
            writable,
            ..Default::default()
        };
        (memory, ImageView::new(CellCache::new(layout, block, pool, mode)))
    }

    #[tokio::test]
    async fn test_region_across_cells() {
        let (memory, view) = create_test_view(false);
        let data = view.get_region(&[3, 3, 1], &[3, 2, 1]).await.unwrap();
        assert_eq!(
            data.as_slice::<u16>().unwrap(),
            &[1033, 1034, 1035, 1043, 1044, 1045]
        );
        // cells (0,0,1), (1,0,1), (0,1,1), (1,1,1)
        assert_eq!(memory.read_count(), 4);
    }

    #[tokio::test]
    async fn test_channel_view() {
        let (_, view) = create_test_view(false);
        let channel = ImageView::for_channel(view.cache().clone(), 2, 1).unwrap();
        assert_eq!(channel.dimensions(), vec![10, 6]);
        assert_eq!(channel.cell_shape(), vec![4, 4]);
        assert_eq!(channel.get_sample(&[9, 5]).await.unwrap(), 1059.0);
        assert!(ImageView::for_channel(view.cache().clone(), 2, 2).is_err());
        assert!(channel.get_region(&[0, 0, 0], &[1, 1, 1]).await.is_err());
    }

    #[tokio::test]
    async fn test_peek_region_reports_validity() {
        let (_, view) = create_test_view(false);
        let first = view.peek_region(&[0, 0, 0], &[2, 2, 1]).unwrap();
        assert!(!first.valid);
        assert_eq!(first.data.len(), 4);

        view.get_region(&[0, 0, 0], &[2, 2, 1]).await.unwrap();
        let second = view.peek_region(&[0, 0, 0], &[2, 2, 1]).unwrap();
        assert!(second.valid);
        assert_eq!(second.data.as_slice::<u16>().unwrap(), &[0, 1, 10, 11]);
    }

    #[tokio::test]
    async fn test_write_region_marks_cells_dirty() {
        let (_, view) = create_test_view(true);
        let patch = PixelBuffer::from(vec![7u16; 4]);
        view.write_region(&[3, 0, 0], &[2, 2, 1], &patch).await.unwrap();

        assert_eq!(view.cache().dirty_cells(), vec![vec![0, 0, 0], vec![1, 0, 0]]);
        let data = view.get_region(&[2, 0, 0], &[4, 1, 1]).await.unwrap();
        assert_eq!(data.as_slice::<u16>().unwrap(), &[2, 7, 7, 5]);
    }

    #[tokio::test]
    async fn test_get_array() {
        let (_, view) = create_test_view(false);
        let channel = ImageView::for_channel(view.cache().clone(), 2, 0).unwrap();
        let array = channel.get_array::<u16>(&[4, 1], &[3, 2]).await.unwrap();
        assert_eq!(array.shape(), &[2, 3]);
        assert_eq!(array[[1, 2]], 26);
        assert!(channel.get_array::<f32>(&[4, 1], &[3, 2]).await.is_err());
    }

    #[tokio::test]
    async fn test_write_region_rejected_before_fetch_when_read_only() {
        let (memory, view) = create_test_view(false);
        let err = view
            .write_region(&[0, 0, 0], &[1, 1, 1], &PixelBuffer::from(vec![1u16]))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
        assert_eq!(memory.read_count(), 0);
    }

    #[tokio::test]
    async fn test_write_region_skips_reads_of_covered_cells() {
        let (memory, view) = create_test_view(true);
        // Covers cell (0,0,0) fully and cell (1,0,0) partly
        let patch = PixelBuffer::from(vec![5u16; 24]);
        view.write_region(&[0, 0, 0], &[6, 4, 1], &patch).await.unwrap();

        assert_eq!(memory.read_count(), 1);
        let data = view.get_region(&[3, 0, 0], &[4, 1, 1]).await.unwrap();
        assert_eq!(data.as_slice::<u16>().unwrap(), &[5, 5, 5, 6]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_region_writes_to_one_cell() {
        let (_, view) = create_test_view(true);
        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let view = view.clone();
                tokio::spawn(async move {
                    view.write_region(&[i, 0, 0], &[1, 1, 1], &PixelBuffer::from(vec![900u16]))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let data = view.get_region(&[0, 0, 0], &[5, 1, 1]).await.unwrap();
        assert_eq!(data.as_slice::<u16>().unwrap(), &[900, 900, 900, 900, 4]);
    }

    #[tokio::test]
    async fn test_region_out_of_bounds() {
        let (memory, view) = create_test_view(false);
        assert!(matches!(
            view.peek_region(&[usize::MAX, 0, 0], &[2, 1, 1]),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            view.get_region(&[0, usize::MAX, 0], &[1, 2, 1]).await,
            Err(CacheError::InvalidArgument(_))
        ));
        assert_eq!(memory.read_count(), 0);
    }

    #[tokio::test]
    async fn test_region_past_level_end() {
        let (memory, view) = create_test_view(false);
        assert!(matches!(
            view.get_region(&[8, 0, 0], &[3, 1, 1]).await,
            Err(CacheError::InvalidArgument(_))
        ));
        assert_eq!(memory.read_count(), 0);
    }
}
