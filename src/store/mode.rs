//! Degraded-mode state machine.
//!
//! ## States
//!
//! - **Initializing**: the store is opening and reconciling
//! - **Live**: the backend is the system of record
//! - **Degraded**: the fallback cache is the system of record
//!
//! Degraded is terminal for the lifetime of a store; only a newly built
//! store tries the backend again.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use super::markers::MarkerRegistry;
use crate::metrics;

/// Which side of the store is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreMode {
    Initializing,
    Live,
    Degraded,
}

impl StoreMode {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Live => "live",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mode of one store plus the marker registry that persists degradation.
pub(crate) struct ModeState {
    mode: RwLock<StoreMode>,
    database: String,
    collection: String,
    markers: Arc<dyn MarkerRegistry>,
}

impl ModeState {
    pub(crate) fn new(
        database: &str,
        collection: &str,
        markers: Arc<dyn MarkerRegistry>,
    ) -> Self {
        Self {
            mode: RwLock::new(StoreMode::Initializing),
            database: database.to_string(),
            collection: collection.to_string(),
            markers,
        }
    }

    pub(crate) fn current(&self) -> StoreMode {
        *self.mode.read()
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.current() == StoreMode::Degraded
    }

    pub(crate) fn needs_reconciliation(&self) -> bool {
        self.markers.is_marked(&self.database, &self.collection)
    }

    /// Initializing -> Live. A degraded store stays degraded.
    ///
    /// Returns true if the store went live.
    pub(crate) fn go_live(&self) -> bool {
        let mut mode = self.mode.write();
        match *mode {
            StoreMode::Initializing => {
                *mode = StoreMode::Live;
                drop(mode);
                info!(
                    database = %self.database,
                    collection = %self.collection,
                    "Store is live"
                );
                metrics::record_transition(StoreMode::Live);
                true
            },
            StoreMode::Live => true,
            StoreMode::Degraded => false,
        }
    }

    /// Any state -> Degraded, persisting the reconciliation marker.
    ///
    /// Returns true if this call performed the transition.
    pub(crate) fn degrade(&self, reason: &str) -> bool {
        let previous = {
            let mut mode = self.mode.write();
            std::mem::replace(&mut *mode, StoreMode::Degraded)
        };

        // Marking is idempotent; repeat it so a marker removed behind our
        // back is restored while the cache is authoritative.
        self.markers.mark(&self.database, &self.collection);

        if previous == StoreMode::Degraded {
            return false;
        }

        warn!(
            database = %self.database,
            collection = %self.collection,
            from = %previous,
            reason = reason,
            "Store degraded to in-memory fallback"
        );
        metrics::record_transition(StoreMode::Degraded);
        true
    }

    /// Removes the reconciliation marker after a confirmed backend clear.
    pub(crate) fn reconciled(&self) {
        self.markers.unmark(&self.database, &self.collection);
        info!(
            database = %self.database,
            collection = %self.collection,
            "Store reconciled with backend"
        );
    }
}
