//! Options for opening an image pyramid

use crate::error::{CacheError, Result};
use crate::pool::DEFAULT_WORKERS;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Options controlling how a pyramid is opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidOptions {
    /// Cell shape override for the full-resolution level
    ///
    /// Entry `d` applies to reduced dimension `d`; dimensions beyond the end
    /// of the list reuse the last entry.
    pub cell_dimensions: Option<Vec<usize>>,

    /// Number of worker slots when the pyramid creates its own pool
    pub num_workers: usize,

    /// Allow modifying and persisting full-resolution cells
    pub writable: bool,

    /// Treat the remote dataset as freshly created: cells start zeroed
    /// instead of being read
    pub empty_dataset: bool,
}

impl Default for PyramidOptions {
    fn default() -> Self {
        Self {
            cell_dimensions: None,
            num_workers: DEFAULT_WORKERS,
            writable: false,
            empty_dataset: false,
        }
    }
}

impl PyramidOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the full-resolution cell shape
    pub fn with_cell_dimensions(mut self, dims: Vec<usize>) -> Self {
        self.cell_dimensions = Some(dims);
        self
    }

    /// Set the number of worker slots
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Allow modifications of level 0
    pub fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Mark the dataset as empty
    pub fn with_empty_dataset(mut self, empty: bool) -> Self {
        self.empty_dataset = empty;
        self
    }

    /// Parse options from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check option values
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(CacheError::Configuration(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if let Some(dims) = &self.cell_dimensions {
            if dims.is_empty() || dims.iter().any(|&d| d == 0) {
                return Err(CacheError::Configuration(format!(
                    "Invalid cell dimensions override: {:?}",
                    dims
                )));
            }
        }
        Ok(())
    }

    /// Overridden full-resolution cell extent of reduced dimension `d`
    pub fn cell_dimension(&self, d: usize) -> Option<usize> {
        self.cell_dimensions
            .as_ref()
            .and_then(|dims| dims.get(d.min(dims.len().saturating_sub(1))).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let options = PyramidOptions::default();
        assert_eq!(options.num_workers, 16);
        assert!(!options.writable);
        assert_eq!(options.cell_dimension(0), None);
    }

    #[test]
    fn test_cell_dimension_reuses_last_entry() {
        let options = PyramidOptions::new().with_cell_dimensions(vec![32, 16]);
        assert_eq!(options.cell_dimension(0), Some(32));
        assert_eq!(options.cell_dimension(1), Some(16));
        assert_eq!(options.cell_dimension(4), Some(16));
    }

    #[test]
    fn test_from_json_partial() {
        let options = PyramidOptions::from_json_str(r#"{"writable": true, "num_workers": 4}"#)
            .unwrap();
        assert!(options.writable);
        assert_eq!(options.num_workers, 4);
        assert_eq!(options.cell_dimensions, None);
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(matches!(
            PyramidOptions::from_json_str(r#"{"num_workers": 0}"#),
            Err(CacheError::Configuration(_))
        ));
        assert!(matches!(
            PyramidOptions::from_json_str(r#"{"cell_dimensions": [64, 0]}"#),
            Err(CacheError::Configuration(_))
        ));
        assert!(matches!(
            PyramidOptions::from_json_str("{not json"),
            Err(CacheError::Serialization(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cell_dimensions": [128, 128, 8], "empty_dataset": true}}"#).unwrap();

        let options = PyramidOptions::from_file(file.path()).unwrap();
        assert_eq!(options.cell_dimensions, Some(vec![128, 128, 8]));
        assert!(options.empty_dataset);

        assert!(matches!(
            PyramidOptions::from_file("/nonexistent/options.json"),
            Err(CacheError::Io(_))
        ));
    }
}
