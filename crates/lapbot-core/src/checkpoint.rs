//! Resume support: keys already present in an output file.

use std::collections::HashSet;
use std::path::Path;

use crate::table::read_table;

/// Canonical form of a checkpoint key.
///
/// ```
/// use lapbot_core::checkpoint::normalize_key;
///
/// assert_eq!(normalize_key("  Laptop Gaming? "), "laptop gaming?");
/// ```
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Set of normalized keys that already have a result.
#[derive(Debug, Default, Clone)]
pub struct Checkpoint {
    keys: HashSet<String>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `key_column` from an existing output file.
    ///
    /// A missing file yields an empty checkpoint. An unreadable file or a
    /// file without `key_column` is logged and also treated as empty, so
    /// the run starts over instead of aborting.
    pub fn load(path: &Path, key_column: &str) -> Self {
        if !path.exists() {
            return Self::new();
        }

        let table = match read_table(path) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Could not read checkpoint file, starting from scratch"
                );
                return Self::new();
            }
        };

        let Some(idx) = table.column_index(key_column) else {
            tracing::warn!(
                path = %path.display(),
                column = key_column,
                "Checkpoint file has no key column, starting from scratch"
            );
            return Self::new();
        };

        let keys: HashSet<String> = table
            .rows
            .iter()
            .filter_map(|row| row.get(idx).and_then(|cell| cell.as_deref()))
            .map(normalize_key)
            .filter(|key| !key.is_empty())
            .collect();

        tracing::info!(
            path = %path.display(),
            count = keys.len(),
            "Loaded checkpoint"
        );
        Self { keys }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(&normalize_key(key))
    }

    /// Returns false if the key was already present.
    pub fn insert(&mut self, key: &str) -> bool {
        self.keys.insert(normalize_key(key))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for Checkpoint {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut checkpoint = Self::new();
        for key in iter {
            checkpoint.insert(key.as_ref());
        }
        checkpoint
    }
}
