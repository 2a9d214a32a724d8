//! Saved database listing

use std::path::PathBuf;
use tracing::warn;

/// Extension of a saved graph database file
pub const DATABASE_EXTENSION: &str = "loki";

/// Source of saved database names shown on the management page
pub trait Catalog: Send + Sync {
    /// Names of saved databases, sorted
    fn list(&self) -> Vec<String>;
}

/// Lists `*.loki` files in a directory
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    dir: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Catalog for DirectoryCatalog {
    fn list(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %self.dir.display(), error = %e, "Failed to read database directory");
                }
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| path.extension().is_some_and(|ext| ext == DATABASE_EXTENSION))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        names
    }
}
