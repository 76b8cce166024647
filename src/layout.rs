//! Level layout - how one resolution level is divided into cells

use crate::error::{CacheError, Result};
use crate::types::PixelType;
use serde::{Deserialize, Serialize};

/// Dimensions and cell shape of one resolution level, in reduced space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelLayout {
    /// Resolution level (0 is full resolution)
    pub level: usize,

    /// Pixel type shared by every level
    pub pixel_type: PixelType,

    /// Size of the level along each reduced axis
    pub dims: Vec<usize>,

    /// Cell shape along each reduced axis
    pub cell_shape: Vec<usize>,
}

impl LevelLayout {
    /// Create a new level layout
    pub fn new(
        level: usize,
        pixel_type: PixelType,
        dims: Vec<usize>,
        cell_shape: Vec<usize>,
    ) -> Result<Self> {
        if dims.is_empty() {
            return Err(CacheError::Configuration(
                "Level must have at least one dimension".to_string(),
            ));
        }
        if dims.len() != cell_shape.len() {
            return Err(CacheError::Configuration(format!(
                "Cell shape {:?} does not match dimensions {:?}",
                cell_shape, dims
            )));
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(CacheError::Configuration(format!(
                "Level {} has an empty dimension: {:?}",
                level, dims
            )));
        }
        if cell_shape.iter().any(|&c| c == 0) {
            return Err(CacheError::Configuration(format!(
                "Level {} has a zero cell extent: {:?}",
                level, cell_shape
            )));
        }

        Ok(Self {
            level,
            pixel_type,
            dims,
            cell_shape,
        })
    }

    /// Number of reduced dimensions
    pub fn num_dimensions(&self) -> usize {
        self.dims.len()
    }

    /// Number of cells along each dimension
    pub fn cell_grid(&self) -> Vec<usize> {
        self.dims
            .iter()
            .zip(self.cell_shape.iter())
            .map(|(&dim, &cell)| dim.div_ceil(cell))
            .collect()
    }

    /// Total number of cells in the level
    pub fn total_cells(&self) -> usize {
        self.cell_grid().iter().product()
    }

    /// Reject cell coordinates of the wrong rank or outside the cell grid
    pub fn validate_cell(&self, coords: &[usize]) -> Result<()> {
        if coords.len() != self.num_dimensions() {
            return Err(CacheError::InvalidArgument(format!(
                "Cell coordinate {:?} has rank {}, level {} has rank {}",
                coords,
                coords.len(),
                self.level,
                self.num_dimensions()
            )));
        }
        let grid = self.cell_grid();
        if coords.iter().zip(grid.iter()).any(|(&c, &g)| c >= g) {
            return Err(CacheError::InvalidArgument(format!(
                "Cell coordinate {:?} outside cell grid {:?} of level {}",
                coords, grid, self.level
            )));
        }
        Ok(())
    }

    /// Cell containing a pixel position; the position must be cell-aligned
    pub fn cell_at_aligned(&self, position: &[usize]) -> Result<Vec<usize>> {
        if !self.is_in_bounds(position) {
            return Err(CacheError::InvalidArgument(format!(
                "Position {:?} outside level {} dimensions {:?}",
                position, self.level, self.dims
            )));
        }
        if position
            .iter()
            .zip(self.cell_shape.iter())
            .any(|(&p, &c)| p % c != 0)
        {
            return Err(CacheError::InvalidArgument(format!(
                "Position {:?} is not aligned to cell shape {:?}",
                position, self.cell_shape
            )));
        }
        Ok(position
            .iter()
            .zip(self.cell_shape.iter())
            .map(|(&p, &c)| p / c)
            .collect())
    }

    /// Minimum pixel position of a cell
    pub fn cell_min(&self, coords: &[usize]) -> Vec<usize> {
        coords
            .iter()
            .zip(self.cell_shape.iter())
            .map(|(&c, &s)| c * s)
            .collect()
    }

    /// Size of a cell, clipped at the level boundary
    pub fn cell_size(&self, coords: &[usize]) -> Vec<usize> {
        coords
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let start = c * self.cell_shape[i];
                (start + self.cell_shape[i]).min(self.dims[i]) - start
            })
            .collect()
    }

    /// Number of elements in a (clipped) cell
    pub fn cell_len(&self, coords: &[usize]) -> usize {
        self.cell_size(coords).iter().product()
    }

    /// Pixel range `(start, end)` covered by a cell along each dimension
    pub fn cell_data_range(&self, coords: &[usize]) -> Vec<(usize, usize)> {
        self.cell_min(coords)
            .into_iter()
            .zip(self.cell_size(coords))
            .map(|(start, size)| (start, start + size))
            .collect()
    }

    /// Check if a pixel position is within bounds
    pub fn is_in_bounds(&self, position: &[usize]) -> bool {
        position.len() == self.num_dimensions()
            && position
                .iter()
                .zip(self.dims.iter())
                .all(|(&p, &d)| p < d)
    }

    /// Validate a region given by `min` and `size`
    pub fn validate_region(&self, min: &[usize], size: &[usize]) -> Result<()> {
        if min.len() != self.num_dimensions() || size.len() != self.num_dimensions() {
            return Err(CacheError::InvalidArgument(format!(
                "Region rank does not match level rank {}",
                self.num_dimensions()
            )));
        }
        for i in 0..self.num_dimensions() {
            if size[i] == 0 {
                return Err(CacheError::InvalidArgument(
                    "Region size must be positive".to_string(),
                ));
            }
            let end = min[i].checked_add(size[i]);
            if end.map_or(true, |end| end > self.dims[i]) {
                return Err(CacheError::InvalidArgument(format!(
                    "Region {:?}+{:?} outside level {} dimensions {:?}",
                    min, size, self.level, self.dims
                )));
            }
        }
        Ok(())
    }

    /// Cells overlapping the region `[min, min + size)`, first axis fastest
    pub fn cells_overlapping(&self, min: &[usize], size: &[usize]) -> Result<Vec<Vec<usize>>> {
        self.validate_region(min, size)?;
        let min_cell: Vec<usize> = min
            .iter()
            .zip(self.cell_shape.iter())
            .map(|(&m, &c)| m / c)
            .collect();
        let max_cell: Vec<usize> = min
            .iter()
            .zip(size.iter())
            .zip(self.cell_shape.iter())
            .map(|((&m, &s), &c)| (m + s - 1) / c)
            .collect();

        let mut cells = Vec::new();
        let mut coords = min_cell.clone();
        loop {
            cells.push(coords.clone());

            let mut dim = 0;
            loop {
                coords[dim] += 1;
                if coords[dim] <= max_cell[dim] {
                    break;
                }
                coords[dim] = min_cell[dim];
                dim += 1;
                if dim == coords.len() {
                    return Ok(cells);
                }
            }
        }
    }

    /// Size in bytes of a full (unclipped) cell
    pub fn cell_size_bytes(&self) -> usize {
        self.cell_shape.iter().product::<usize>() * self.pixel_type.size_in_bytes()
    }

    /// Total size of the level in bytes
    pub fn total_size_bytes(&self) -> usize {
        self.dims.iter().product::<usize>() * self.pixel_type.size_in_bytes()
    }

    /// Get a summary string of the layout
    pub fn summary(&self) -> String {
        let join = |v: &[usize]| {
            v.iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" x ")
        };

        format!(
            "Level {}: {} ({}), cells {} -> {} cells, {}",
            self.level,
            join(&self.dims),
            self.pixel_type,
            join(&self.cell_shape),
            self.total_cells(),
            crate::utils::format_bytes(self.total_size_bytes())
        )
    }
}
