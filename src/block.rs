//! Block source - typed sub-volume reads and writes against a [`DataSource`]

use crate::axes::AxisMap;
use crate::error::{CacheError, Result};
use crate::source::DataSource;
use crate::types::{PixelBuffer, PixelType, CANONICAL_AXES};
use std::sync::Arc;
use tracing::trace;

/// Reads and writes rectangular regions, splitting them into one remote call
/// per (channel, timepoint) slice when the source cannot serve them whole
#[derive(Clone)]
pub struct BlockSource {
    source: Arc<dyn DataSource>,
    axis_map: AxisMap,
    pixel_type: PixelType,
}

impl BlockSource {
    pub fn new(source: Arc<dyn DataSource>, axis_map: AxisMap, pixel_type: PixelType) -> Self {
        Self {
            source,
            axis_map,
            pixel_type,
        }
    }

    pub fn axis_map(&self) -> &AxisMap {
        &self.axis_map
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    /// Fetch a region given in reduced coordinates
    pub async fn fetch(&self, level: usize, min: &[usize], size: &[usize]) -> Result<PixelBuffer> {
        let min = self.axis_map.to_canonical_position(min)?;
        let size = self.axis_map.to_canonical_extent(size)?;
        self.fetch_canonical(level, min, size).await
    }

    /// Fetch a region given in canonical coordinates
    ///
    /// Multi-slice results are laid out channel-fastest within each
    /// timepoint: slice `(dc, dt)` starts at `(dt * sc + dc) * sx * sy * sz`.
    pub async fn fetch_canonical(
        &self,
        level: usize,
        min: [usize; CANONICAL_AXES],
        size: [usize; CANONICAL_AXES],
    ) -> Result<PixelBuffer> {
        let total: usize = size.iter().product();
        let (sc, st) = (size[3], size[4]);

        if (sc == 1 && st == 1) || self.source.supports_multi_slice() {
            let data = self.read_checked(level, min, size).await?;
            return Ok(data);
        }

        trace!(level, ?min, ?size, "splitting fetch into {} slices", sc * st);
        let slice_len = size[0] * size[1] * size[2];
        let mut slice_size = size;
        slice_size[3] = 1;
        slice_size[4] = 1;

        let mut out = PixelBuffer::zeros(self.pixel_type, total);
        for dt in 0..st {
            for dc in 0..sc {
                let mut slice_min = min;
                slice_min[3] += dc;
                slice_min[4] += dt;
                let slice = self.read_checked(level, slice_min, slice_size).await?;
                out.copy_within_from((dt * sc + dc) * slice_len, &slice, 0, slice_len)?;
            }
        }
        Ok(out)
    }

    /// Write a full-resolution region given in reduced coordinates
    pub async fn store(&self, min: &[usize], size: &[usize], data: &PixelBuffer) -> Result<()> {
        let min = self.axis_map.to_canonical_position(min)?;
        let size = self.axis_map.to_canonical_extent(size)?;
        self.store_canonical(min, size, data).await
    }

    /// Write a full-resolution region given in canonical coordinates
    pub async fn store_canonical(
        &self,
        min: [usize; CANONICAL_AXES],
        size: [usize; CANONICAL_AXES],
        data: &PixelBuffer,
    ) -> Result<()> {
        let total: usize = size.iter().product();
        if data.len() != total || data.pixel_type() != self.pixel_type {
            return Err(CacheError::InvalidArgument(format!(
                "Buffer of {} {} elements does not match region {:?} of {}",
                data.len(),
                data.pixel_type(),
                size,
                self.pixel_type
            )));
        }

        let (sc, st) = (size[3], size[4]);
        if (sc == 1 && st == 1) || self.source.supports_multi_slice() {
            return self.source.write(min, size, data).await.map_err(into_transport);
        }

        let slice_len = size[0] * size[1] * size[2];
        let mut slice_size = size;
        slice_size[3] = 1;
        slice_size[4] = 1;

        for dt in 0..st {
            for dc in 0..sc {
                let mut slice_min = min;
                slice_min[3] += dc;
                slice_min[4] += dt;
                let mut slice = PixelBuffer::zeros(self.pixel_type, slice_len);
                slice.copy_within_from(0, data, (dt * sc + dc) * slice_len, slice_len)?;
                self.source
                    .write(slice_min, slice_size, &slice)
                    .await
                    .map_err(into_transport)?;
            }
        }
        Ok(())
    }

    async fn read_checked(
        &self,
        level: usize,
        min: [usize; CANONICAL_AXES],
        size: [usize; CANONICAL_AXES],
    ) -> Result<PixelBuffer> {
        let data = self
            .source
            .read(level, min, size)
            .await
            .map_err(into_transport)?;

        let expected: usize = size.iter().product();
        if data.len() != expected || data.pixel_type() != self.pixel_type {
            return Err(CacheError::Transport(format!(
                "Source returned {} {} elements for region {:?}, expected {} {}",
                data.len(),
                data.pixel_type(),
                size,
                expected,
                self.pixel_type
            )));
        }
        Ok(data)
    }
}

/// Every failure coming back from the remote is a transport failure
fn into_transport(err: CacheError) -> CacheError {
    match err {
        CacheError::Transport(_) => err,
        other => CacheError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryDataSource;

    fn source_xyct() -> Arc<MemoryDataSource> {
        let source =
            MemoryDataSource::new(PixelType::U16, vec![[2, 2, 1, 3, 2]], [2, 2, 1, 1, 1]).unwrap();
        // value encodes channel and time
        source
            .fill_level(0, |p| (p[0] + 2 * p[1] + 100 * p[3] + 1000 * p[4]) as f64)
            .unwrap();
        Arc::new(source)
    }

    #[tokio::test]
    async fn test_fetch_splits_slices_channel_fastest() {
        let memory = source_xyct();
        let axis_map = AxisMap::from_sizes([2, 2, 1, 3, 2]).unwrap();
        let block = BlockSource::new(memory.clone(), axis_map, PixelType::U16);

        let data = block.fetch(0, &[0, 0, 1, 0], &[2, 2, 2, 2]).await.unwrap();
        assert_eq!(memory.read_count(), 4);

        let values = data.as_slice::<u16>().unwrap();
        assert_eq!(values.len(), 16);
        // (c=1, t=0), (c=2, t=0), (c=1, t=1), (c=2, t=1)
        assert_eq!(&values[0..4], &[100, 101, 102, 103]);
        assert_eq!(&values[4..8], &[200, 201, 202, 203]);
        assert_eq!(&values[8..12], &[1100, 1101, 1102, 1103]);
        assert_eq!(&values[12..16], &[1200, 1201, 1202, 1203]);
    }

    #[tokio::test]
    async fn test_fetch_single_call_with_multi_slice_source() {
        let memory = Arc::new(
            MemoryDataSource::new(PixelType::U8, vec![[2, 2, 1, 3, 1]], [2, 2, 1, 1, 1])
                .unwrap()
                .with_multi_slice(true),
        );
        let axis_map = AxisMap::from_sizes([2, 2, 1, 3, 1]).unwrap();
        let block = BlockSource::new(memory.clone(), axis_map, PixelType::U8);

        let data = block.fetch(0, &[0, 0, 0], &[2, 2, 3]).await.unwrap();
        assert_eq!(data.len(), 12);
        assert_eq!(memory.read_count(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_is_transport_error() {
        let memory = source_xyct();
        let axis_map = AxisMap::from_sizes([2, 2, 1, 3, 2]).unwrap();
        let block = BlockSource::new(memory, axis_map, PixelType::U16);

        let err = block.fetch(0, &[0, 0, 2, 0], &[2, 2, 2, 1]).await.unwrap_err();
        assert!(matches!(err, CacheError::Transport(_)));
    }

    #[tokio::test]
    async fn test_store_splits_slices() {
        let memory = source_xyct();
        let axis_map = AxisMap::from_sizes([2, 2, 1, 3, 2]).unwrap();
        let block = BlockSource::new(memory.clone(), axis_map, PixelType::U16);

        let data = PixelBuffer::from((0..8).map(|v| v as u16).collect::<Vec<_>>());
        block.store(&[0, 0, 0, 1], &[2, 2, 2, 1], &data).await.unwrap();
        assert_eq!(memory.write_count(), 2);

        let back = block.fetch(0, &[0, 0, 0, 1], &[2, 2, 2, 1]).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_store_rejects_mismatched_buffer() {
        let memory = source_xyct();
        let axis_map = AxisMap::from_sizes([2, 2, 1, 3, 2]).unwrap();
        let block = BlockSource::new(memory.clone(), axis_map, PixelType::U16);

        let data = PixelBuffer::from(vec![0u8; 4]);
        let err = block.store(&[0, 0, 0, 0], &[2, 2, 1, 1], &data).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)));
        assert_eq!(memory.write_count(), 0);
    }
}
