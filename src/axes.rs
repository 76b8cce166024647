//! Mapping between the canonical X,Y,Z,C,T space and the reduced array space
//!
//! The remote source always addresses pixels with five coordinates. Axes of
//! size 1 carry no information, so the in-memory arrays drop them: an image
//! with sizes `[512, 512, 1, 3, 1]` is handled as a 3D `X,Y,C` array.

use crate::error::{CacheError, Result};
use crate::types::{Axis, CANONICAL_AXES};
use serde::{Deserialize, Serialize};
use std::fmt;

/// For each canonical axis, its index in the reduced space (`None` if dropped)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisMap {
    map: [Option<usize>; CANONICAL_AXES],
    num_dimensions: usize,
}

impl AxisMap {
    /// Build the mapping from the full-resolution canonical sizes
    ///
    /// Axes with size <= 1 are dropped. At least two axes must remain.
    pub fn from_sizes(sizes: [usize; CANONICAL_AXES]) -> Result<Self> {
        let mut map = [None; CANONICAL_AXES];
        let mut next = 0;
        for (slot, &size) in map.iter_mut().zip(sizes.iter()) {
            if size > 1 {
                *slot = Some(next);
                next += 1;
            }
        }

        if next < 2 {
            return Err(CacheError::Configuration(format!(
                "Degenerate volume {:?}: at least 2 axes with size > 1 are required",
                sizes
            )));
        }

        Ok(Self {
            map,
            num_dimensions: next,
        })
    }

    /// Number of axes in the reduced space
    pub fn num_dimensions(&self) -> usize {
        self.num_dimensions
    }

    /// Reduced dimension index of a canonical axis
    pub fn dimension_of(&self, axis: Axis) -> Option<usize> {
        self.map[axis.index()]
    }

    /// Canonical axes present in the reduced space, in reduced order
    pub fn axes(&self) -> Vec<Axis> {
        Axis::ALL
            .iter()
            .copied()
            .filter(|a| self.map[a.index()].is_some())
            .collect()
    }

    pub fn has_z(&self) -> bool {
        self.map[Axis::Z.index()].is_some()
    }

    pub fn has_channels(&self) -> bool {
        self.map[Axis::C.index()].is_some()
    }

    pub fn has_timepoints(&self) -> bool {
        self.map[Axis::T.index()].is_some()
    }

    /// Axis order of the reduced space, e.g. `"XYZT"`
    pub fn axis_order(&self) -> String {
        self.axes().iter().map(|a| a.label()).collect()
    }

    /// Project canonical values (sizes or coordinates) onto the reduced axes
    pub fn to_reduced(&self, canonical: &[usize; CANONICAL_AXES]) -> Vec<usize> {
        let mut reduced = vec![0; self.num_dimensions];
        for (axis, slot) in self.map.iter().enumerate() {
            if let Some(d) = slot {
                reduced[*d] = canonical[axis];
            }
        }
        reduced
    }

    /// Reduced dimensions of a level given its canonical sizes
    pub fn reduced_dims(&self, sizes: &[usize; CANONICAL_AXES]) -> Vec<usize> {
        self.to_reduced(sizes)
    }

    /// Canonical position of a reduced coordinate (dropped axes at 0)
    pub fn to_canonical_position(&self, reduced: &[usize]) -> Result<[usize; CANONICAL_AXES]> {
        self.expand(reduced, 0)
    }

    /// Canonical extent of a reduced size (dropped axes have extent 1)
    pub fn to_canonical_extent(&self, reduced: &[usize]) -> Result<[usize; CANONICAL_AXES]> {
        self.expand(reduced, 1)
    }

    fn expand(&self, reduced: &[usize], fill: usize) -> Result<[usize; CANONICAL_AXES]> {
        if reduced.len() != self.num_dimensions {
            return Err(CacheError::InvalidArgument(format!(
                "Expected {} reduced coordinates ({}), got {}",
                self.num_dimensions,
                self.axis_order(),
                reduced.len()
            )));
        }
        let mut canonical = [fill; CANONICAL_AXES];
        for (axis, slot) in self.map.iter().enumerate() {
            if let Some(d) = slot {
                canonical[axis] = reduced[*d];
            }
        }
        Ok(canonical)
    }
}

impl fmt::Display for AxisMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.axis_order())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xyc_mapping() {
        let map = AxisMap::from_sizes([512, 512, 1, 3, 1]).unwrap();
        assert_eq!(map.num_dimensions(), 3);
        assert_eq!(map.reduced_dims(&[512, 512, 1, 3, 1]), vec![512, 512, 3]);
        assert_eq!(map.dimension_of(Axis::Z), None);
        assert_eq!(map.dimension_of(Axis::T), None);
        assert_eq!(map.dimension_of(Axis::C), Some(2));
        assert_eq!(
            map.to_canonical_position(&[10, 20, 2]).unwrap(),
            [10, 20, 0, 2, 0]
        );
        assert_eq!(
            map.to_canonical_extent(&[64, 64, 1]).unwrap(),
            [64, 64, 1, 1, 1]
        );
        assert_eq!(map.axis_order(), "XYC");
        assert!(map.has_channels());
        assert!(!map.has_z());
        assert!(!map.has_timepoints());
    }

    #[test]
    fn test_full_5d_mapping() {
        let map = AxisMap::from_sizes([100, 80, 40, 2, 5]).unwrap();
        assert_eq!(map.num_dimensions(), 5);
        assert_eq!(map.axis_order(), "XYZCT");
        assert_eq!(map.to_reduced(&[1, 2, 3, 4, 5]), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_degenerate_volume_rejected() {
        assert!(matches!(
            AxisMap::from_sizes([512, 1, 1, 1, 1]),
            Err(CacheError::Configuration(_))
        ));
        assert!(matches!(
            AxisMap::from_sizes([1, 1, 1, 1, 1]),
            Err(CacheError::Configuration(_))
        ));
        // A single slice over time is still two axes
        assert!(AxisMap::from_sizes([1, 64, 1, 1, 10]).is_ok());
    }

    #[test]
    fn test_wrong_rank_rejected() {
        let map = AxisMap::from_sizes([64, 64, 16, 1, 1]).unwrap();
        assert!(matches!(
            map.to_canonical_position(&[1, 2]),
            Err(CacheError::InvalidArgument(_))
        ));
    }
}
