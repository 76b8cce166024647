//! imaris-cache - lazy multi-resolution cell cache for remote image volumes
//!
//! Opens a multi-resolution dataset served by a remote process as a pyramid
//! of array views. Each level is split into fixed-shape cells that are
//! fetched on first access, shared by every concurrent reader, and kept until
//! the level is invalidated.
//!
//! # Features
//!
//! - Canonical XYZCT datasets reduced to their non-singleton axes
//! - Single-flight block fetch: concurrent accesses to a cell cause one read
//! - Blocking (`get`) and volatile non-blocking (`peek`) access paths
//! - Generation-based invalidation that discards stale in-flight results
//! - Write-back of modified full-resolution cells with per-cell failure report
//! - One bounded worker pool shared by all levels, or across pyramids
//!
//! # Backends
//!
//! The remote process is reached through the [`DataSource`] trait. An
//! in-memory [`MemoryDataSource`] is provided for local use and tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use imaris_cache::{ImagePyramid, MemoryDataSource, PixelType, PyramidOptions};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = MemoryDataSource::with_halving_levels(
//!     PixelType::U16, [512, 512, 64, 2, 1], [64, 64, 16, 1, 1], 3)?;
//! let pyramid = ImagePyramid::open(Arc::new(source), PyramidOptions::default()).await?;
//!
//! // Read a slab of full resolution, fetching only the cells it covers
//! let data = pyramid.image(0)?.get_region(&[0, 0, 10, 0], &[512, 512, 1, 1]).await?;
//! # Ok(())
//! # }
//! ```

pub mod axes;
pub mod block;
pub mod cache;
pub mod config;
pub mod error;
pub mod layout;
pub mod pool;
pub mod pyramid;
pub mod source;
pub mod types;
pub mod utils;
pub mod view;

// Re-exports
pub use axes::AxisMap;
pub use block::BlockSource;
pub use cache::{CacheMode, CacheStats, CellCache, CellStatus, VolatileCell};
pub use config::PyramidOptions;
pub use error::{CacheError, Result};
pub use layout::LevelLayout;
pub use pool::SharedWorkerPool;
pub use pyramid::{mipmap_scales, ChannelPyramid, ImagePyramid, PyramidStats};
pub use source::{DataSource, MemoryDataSource};
pub use types::{Axis, Pixel, PixelBuffer, PixelType};
pub use view::{ImageView, VolatileRegion};

/// Version of the crate
pub const IMARIS_CACHE_VERSION: &str = env!("CARGO_PKG_VERSION");
