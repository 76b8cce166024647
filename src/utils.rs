//! Utility functions

use crate::error::Result;
use crate::types::PixelBuffer;

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Linear offset of `position` in a buffer with extents `dims` (first axis fastest)
pub fn flat_offset(position: &[usize], dims: &[usize]) -> usize {
    let mut offset = 0;
    let mut stride = 1;
    for (&p, &d) in position.iter().zip(dims.iter()) {
        offset += p * stride;
        stride *= d;
    }
    offset
}

/// Copy an n-dimensional block between two flat buffers
///
/// `size` elements per axis are copied from `src` (extents `src_dims`,
/// starting at `src_min`) into `dst` (extents `dst_dims`, starting at
/// `dst_min`). Rows along the first axis are copied contiguously.
pub fn copy_block(
    src: &PixelBuffer,
    src_dims: &[usize],
    src_min: &[usize],
    dst: &mut PixelBuffer,
    dst_dims: &[usize],
    dst_min: &[usize],
    size: &[usize],
) -> Result<()> {
    let n = size.len();
    let row = size[0];
    let mut outer = vec![0usize; n];

    loop {
        let src_pos: Vec<usize> = (0..n).map(|i| src_min[i] + outer[i]).collect();
        let dst_pos: Vec<usize> = (0..n).map(|i| dst_min[i] + outer[i]).collect();
        dst.copy_within_from(
            flat_offset(&dst_pos, dst_dims),
            src,
            flat_offset(&src_pos, src_dims),
            row,
        )?;

        // Advance over axes 1.. ; axis 0 is handled by the row copy
        let mut dim = 1;
        loop {
            if dim == n {
                return Ok(());
            }
            outer[dim] += 1;
            if outer[dim] < size[dim] {
                break;
            }
            outer[dim] = 0;
            dim += 1;
        }
    }
}
