use std::time::Duration;

use super::index::NodeRecord;

pub const DEFAULT_GUARD_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Suppress(SuppressReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    OutOfScope,
    /// The symmetric transfer finished less than a window ago.
    RecentTransfer,
    /// The candidate timestamp is the one we produced ourselves.
    Echo,
}

/// Everything the guard needs about one candidate transfer.
#[derive(Debug, Clone, Copy)]
pub struct GuardInput<'a> {
    pub record: Option<&'a NodeRecord>,
    /// Local mtime for uploads, remote `modifiedAt` for downloads.
    pub candidate_mtime: Option<i64>,
    pub in_scope: bool,
    pub now: i64,
}

/// Suppresses transfers that would only echo the opposite direction.
///
/// The guard is pure: callers fetch the record and the clock and pass them in,
/// so every decision can be replayed in tests.
#[derive(Debug, Clone, Copy)]
pub struct LoopGuard {
    window: i64,
}

impl LoopGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.as_secs() as i64,
        }
    }

    pub fn window_secs(&self) -> i64 {
        self.window
    }

    pub fn decide(&self, direction: Direction, input: GuardInput<'_>) -> Verdict {
        if !input.in_scope {
            return Verdict::Suppress(SuppressReason::OutOfScope);
        }
        let Some(record) = input.record else {
            return Verdict::Allow;
        };

        let (opposite, own) = match direction {
            Direction::Upload => (record.last_downloaded_at, record.last_uploaded_at),
            Direction::Download => (record.last_uploaded_at, record.last_downloaded_at),
        };

        if opposite > 0 && input.now - opposite < self.window {
            return Verdict::Suppress(SuppressReason::RecentTransfer);
        }
        if own > 0
            && let Some(mtime) = input.candidate_mtime
            && mtime - own < self.window
        {
            return Verdict::Suppress(SuppressReason::Echo);
        }
        Verdict::Allow
    }

    pub fn allows(&self, direction: Direction, input: GuardInput<'_>) -> bool {
        matches!(self.decide(direction, input), Verdict::Allow)
    }
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::new(DEFAULT_GUARD_WINDOW)
    }
}
