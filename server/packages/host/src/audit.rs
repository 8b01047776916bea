use std::sync::{Mutex, PoisonError};

use jarvis_contracts::AuditEntry;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Number of lines the desktop audit panel shows.
pub const RECENT_AUDIT_LINES: usize = 5;

/// Append-only audit log shared by every session of a host.
#[derive(Debug, Default)]
pub struct AuditRecorder {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends in arrival order and returns the entry's position in the log.
    pub fn append(&self, entry: AuditEntry) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(
            tool = %entry.tool_name,
            agent = %entry.agent,
            decision = entry.decision.as_str(),
            "audit entry appended"
        );
        entries.push(entry);
        entries.len() - 1
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most-recent-first view, truncated to `limit`.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn format_line(entry: &AuditEntry) -> String {
    format!(
        "{} | {} | {} | {}",
        entry.timestamp,
        entry.agent,
        entry.tool_name,
        entry.decision.as_str()
    )
}

pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
