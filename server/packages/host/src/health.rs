use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use jarvis_contracts::{SidecarName, SidecarStatus};

/// Latest health report per sidecar, in arrival order across every session that shares it.
#[derive(Debug, Default)]
pub struct SidecarHealth {
    latest: Mutex<HashMap<SidecarName, SidecarStatus>>,
}

impl SidecarHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the report for `status.name`. The last report to arrive wins.
    pub fn record(&self, status: SidecarStatus) {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(status.name, status);
    }

    pub fn get(&self, name: SidecarName) -> Option<SidecarStatus> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned()
    }

    /// Sorted by sidecar name.
    pub fn statuses(&self) -> Vec<SidecarStatus> {
        let mut statuses: Vec<SidecarStatus> = self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        statuses.sort_by_key(|status| status.name.as_str());
        statuses
    }
}
