//! Bounded audit trail of permission decisions.
//!
//! The ring keeps the most recent `capacity` entries; recording into a
//! full ring drops the oldest one.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Longest `details` text kept per entry, in bytes.
pub const MAX_DETAILS: usize = 128;

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    ElevateOk,
    ElevateDenied,
    OpenOk,
    OpenDenied,
    ControlOk,
    ControlDenied,
    Drop,
    DropDenied,
    Reap,
    Leak,
    NamespaceViolation,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::ElevateOk => "ELEVATE_OK",
            AuditAction::ElevateDenied => "ELEVATE_DENIED",
            AuditAction::OpenOk => "OPEN_OK",
            AuditAction::OpenDenied => "OPEN_DENIED",
            AuditAction::ControlOk => "CONTROL_OK",
            AuditAction::ControlDenied => "CONTROL_DENIED",
            AuditAction::Drop => "DROP",
            AuditAction::DropDenied => "DROP_DENIED",
            AuditAction::Reap => "REAP",
            AuditAction::Leak => "LEAK",
            AuditAction::NamespaceViolation => "NAMESPACE_VIOLATION",
        }
    }

    /// Whether this action records a refusal.
    pub fn is_denial(self) -> bool {
        matches!(
            self,
            AuditAction::ElevateDenied
                | AuditAction::OpenDenied
                | AuditAction::ControlDenied
                | AuditAction::DropDenied
                | AuditAction::NamespaceViolation
        )
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub pid: i32,
    pub details: String,
}

impl AuditEntry {
    pub fn new(action: AuditAction, pid: i32, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            pid,
            details: truncate_details(details.into()),
        }
    }
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.action,
            self.pid,
            self.details
        )
    }
}

fn truncate_details(mut details: String) -> String {
    if details.len() > MAX_DETAILS {
        let mut cut = MAX_DETAILS;
        while !details.is_char_boundary(cut) {
            cut -= 1;
        }
        details.truncate(cut);
    }
    details
}

/// Thread-safe bounded audit log.
#[derive(Debug)]
pub struct AuditRing {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl AuditRing {
    /// Create a ring holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest if at capacity.
    pub fn record(&self, action: AuditAction, pid: i32, details: impl Into<String>) {
        let entry = AuditEntry::new(action, pid, details);
        if action.is_denial() {
            warn!(target: "aim::audit", action = %entry.action, pid, "{}", entry.details);
        } else {
            info!(target: "aim::audit", action = %entry.action, pid, "{}", entry.details);
        }

        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Up to `count` most recent entries, newest first. Reading does not
    /// consume the ring.
    pub fn recent(&self, count: usize) -> Vec<AuditEntry> {
        let entries = self.entries.lock();
        entries.iter().rev().take(count).cloned().collect()
    }

    /// `recent(count)` rendered as `[ts] action pid details` lines.
    pub fn render(&self, count: usize) -> String {
        self.recent(count)
            .iter()
            .map(|entry| format!("{}\n", entry))
            .collect()
    }

    /// Like [`render`](Self::render), but stops before the text would take
    /// more than `max_bytes` once escaped for the wire. Returns the number
    /// of lines kept along with the text.
    pub fn render_within(&self, count: usize, max_bytes: usize) -> (usize, String) {
        let mut text = String::new();
        let mut used = 0;
        let mut lines = 0;
        for entry in self.recent(count) {
            let line = format!("{}\n", entry);
            // '\\' and '\n' are escaped to two bytes each
            let cost = line.len() + line.chars().filter(|c| matches!(c, '\\' | '\n')).count();
            if used + cost > max_bytes {
                break;
            }
            used += cost;
            lines += 1;
            text.push_str(&line);
        }
        (lines, text)
    }

    /// Entries with `action`, oldest first.
    pub fn by_action(&self, action: AuditAction) -> Vec<AuditEntry> {
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|entry| entry.action == action)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AuditRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_capacity() {
        let ring = AuditRing::new(2);
        ring.record(AuditAction::OpenOk, 1, "first");
        ring.record(AuditAction::OpenOk, 2, "second");
        ring.record(AuditAction::OpenOk, 3, "third");

        assert_eq!(ring.len(), 2);
        let recent = ring.recent(10);
        assert_eq!(recent[0].details, "third");
        assert_eq!(recent[1].details, "second");
    }

    #[test]
    fn test_recent_is_newest_first_and_not_consuming() {
        let ring = AuditRing::new(10);
        for pid in 0..5 {
            ring.record(AuditAction::Drop, pid, format!("drop {}", pid));
        }
        let pids: Vec<i32> = ring.recent(3).iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![4, 3, 2]);
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.recent(3).len(), 3);
    }

    #[test]
    fn test_render_format() {
        let ring = AuditRing::new(10);
        ring.record(AuditAction::ElevateDenied, 1000, "caller lacks authority");
        let text = ring.render(1);
        assert!(text.starts_with('['));
        assert!(text.ends_with(" ELEVATE_DENIED 1000 caller lacks authority\n"));
    }

    #[test]
    fn test_details_truncated_on_char_boundary() {
        let ring = AuditRing::new(10);
        let long = "é".repeat(100);
        ring.record(AuditAction::Leak, 1, long);
        let entry = &ring.recent(1)[0];
        assert!(entry.details.len() <= MAX_DETAILS);
        assert!(entry.details.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_by_action() {
        let ring = AuditRing::new(10);
        ring.record(AuditAction::Leak, 1, "a");
        ring.record(AuditAction::Reap, 1, "b");
        ring.record(AuditAction::Leak, 1, "c");
        assert_eq!(ring.by_action(AuditAction::Leak).len(), 2);
        assert_eq!(ring.by_action(AuditAction::OpenOk).len(), 0);
    }

    #[test]
    fn test_denial_actions() {
        for action in [
            AuditAction::ElevateDenied,
            AuditAction::OpenDenied,
            AuditAction::ControlDenied,
            AuditAction::DropDenied,
            AuditAction::NamespaceViolation,
        ] {
            assert!(action.is_denial(), "{}", action);
        }
        assert!(!AuditAction::Drop.is_denial());
        assert!(!AuditAction::Leak.is_denial());
        assert_eq!(AuditAction::DropDenied.to_string(), "DROP_DENIED");
    }

    #[test]
    fn test_render_within_keeps_whole_lines() {
        let ring = AuditRing::new(10);
        for pid in 0..4 {
            ring.record(AuditAction::Leak, pid, "x".repeat(40));
        }
        let line_len = ring.render(1).len();

        // each line costs its length plus one for the escaped newline
        let (lines, text) = ring.render_within(4, 2 * (line_len + 1) + 5);
        assert_eq!(lines, 2);
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().next().unwrap().contains(" LEAK 3 "));

        let (lines, text) = ring.render_within(4, usize::MAX);
        assert_eq!(lines, 4);
        assert_eq!(text, ring.render(4));

        assert_eq!(ring.render_within(4, 10), (0, String::new()));
    }

    #[test]
    fn test_render_within_counts_escaped_backslashes() {
        let ring = AuditRing::new(2);
        ring.record(AuditAction::Leak, 1, "\\".repeat(60));
        let raw = ring.render(1).len();
        // newline plus sixty backslashes each cost one extra byte
        assert_eq!(ring.render_within(1, raw + 60).0, 0);
        assert_eq!(ring.render_within(1, raw + 61).0, 1);
    }
}
