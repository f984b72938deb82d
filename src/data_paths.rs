use std::path::{Path, PathBuf};

/// Default data directory (relative to current working directory)
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Subdirectory paths relative to the data directory
pub const CACHE_DIR: &str = "cache";
pub const LOGS_DIR: &str = "logs";

/// Name of the persistent position cache file inside the cache directory
pub const POSITIONS_FILE: &str = "positions.json";

/// Helper struct to manage data paths
#[derive(Clone, Debug)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Create a new DataPaths instance with the given root directory
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the root data directory
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Get the cache directory
    pub fn cache(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    /// Get the logs directory
    pub fn logs(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// Path of the persistent position cache file
    pub fn positions_file(&self) -> PathBuf {
        self.cache().join(POSITIONS_FILE)
    }

    /// Ensure all directories exist
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.cache())?;
        std::fs::create_dir_all(self.logs())?;
        Ok(())
    }
}
