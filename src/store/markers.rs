//! Durable markers for stores that need reconciliation.
//!
//! A store that falls back to its cache marks its (database, collection)
//! pair. The next store built for that pair clears the backend once before
//! serving anything, then unmarks it. Marker storage is best effort: I/O
//! failures are logged, never reported to callers.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

/// Persisted set of (database, collection) pairs awaiting reconciliation.
pub trait MarkerRegistry: Send + Sync {
    fn is_marked(&self, database: &str, collection: &str) -> bool;

    /// Marks the pair. Marking twice is a no-op.
    fn mark(&self, database: &str, collection: &str);

    /// Removes exactly this pair.
    fn unmark(&self, database: &str, collection: &str);
}

type Pair = (String, String);

fn pair(database: &str, collection: &str) -> Pair {
    (database.to_string(), collection.to_string())
}

static GLOBAL: LazyLock<Arc<MemoryMarkers>> = LazyLock::new(|| Arc::new(MemoryMarkers::new()));

/// In-process markers, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryMarkers {
    pairs: Mutex<BTreeSet<Pair>>,
}

impl MemoryMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide markers, used by stores built without a registry.
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    pub fn len(&self) -> usize {
        self.pairs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.lock().is_empty()
    }
}

impl MarkerRegistry for MemoryMarkers {
    fn is_marked(&self, database: &str, collection: &str) -> bool {
        self.pairs.lock().contains(&pair(database, collection))
    }

    fn mark(&self, database: &str, collection: &str) {
        self.pairs.lock().insert(pair(database, collection));
    }

    fn unmark(&self, database: &str, collection: &str) {
        self.pairs.lock().remove(&pair(database, collection));
    }
}

/// Markers stored as a JSON array of `[database, collection]` pairs.
///
/// A missing or malformed file reads as empty, and so do malformed items
/// inside an otherwise valid array.
#[derive(Debug)]
pub struct FileMarkers {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileMarkers {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Vec<Pair> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read markers");
                return Vec::new();
            },
        };

        let items: Vec<serde_json::Value> = match serde_json::from_str(&content) {
            Ok(items) => items,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Ignoring malformed markers file");
                return Vec::new();
            },
        };

        items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<(String, String)>(item).ok())
            .collect()
    }

    fn write(&self, pairs: &[Pair]) {
        let result = serde_json::to_string(pairs)
            .map_err(std::io::Error::other)
            .and_then(|json| {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&self.path, json)
            });

        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Failed to write markers");
        }
    }
}

impl MarkerRegistry for FileMarkers {
    fn is_marked(&self, database: &str, collection: &str) -> bool {
        let _guard = self.lock.lock();
        self.read()
            .iter()
            .any(|(db, coll)| db == database && coll == collection)
    }

    fn mark(&self, database: &str, collection: &str) {
        let _guard = self.lock.lock();
        let mut pairs = self.read();
        if pairs
            .iter()
            .any(|(db, coll)| db == database && coll == collection)
        {
            return;
        }
        pairs.push(pair(database, collection));
        self.write(&pairs);
        debug!(database, collection, "Store marked for reconciliation");
    }

    fn unmark(&self, database: &str, collection: &str) {
        let _guard = self.lock.lock();
        let mut pairs = self.read();
        let before = pairs.len();
        pairs.retain(|(db, coll)| !(db == database && coll == collection));
        if pairs.len() != before {
            self.write(&pairs);
            debug!(database, collection, "Store reconciliation marker removed");
        }
    }
}
