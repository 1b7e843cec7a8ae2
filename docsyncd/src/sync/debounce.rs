use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1200);

/// Per-path TTL map: a path is released once it has been quiet for a full
/// window, so a burst of writes yields a single flush.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn touch(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path, now);
    }

    /// Removes and returns every path quiet for at least one window, sorted so
    /// parents flush before their children.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<PathBuf> {
        let window = self.window;
        let mut ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ready {
            self.pending.remove(path);
        }
        ready.sort();
        ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_collapses_into_one_flush() {
        let mut debouncer = Debouncer::new(Duration::from_millis(1000));
        let start = Instant::now();
        let path = PathBuf::from("/sync/docs/a.txt");

        debouncer.touch(path.clone(), start);
        debouncer.touch(path.clone(), start + Duration::from_millis(300));
        debouncer.touch(path.clone(), start + Duration::from_millis(600));

        assert!(debouncer.drain_ready(start + Duration::from_millis(1200)).is_empty());
        assert_eq!(
            debouncer.drain_ready(start + Duration::from_millis(1600)),
            vec![path]
        );
        assert!(debouncer.is_empty());
    }

    #[test]
    fn paths_flush_independently_in_parent_first_order() {
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        let start = Instant::now();
        debouncer.touch(PathBuf::from("/sync/docs/a.txt"), start);
        debouncer.touch(PathBuf::from("/sync/docs"), start);
        debouncer.touch(PathBuf::from("/sync/late.txt"), start + Duration::from_millis(400));

        let ready = debouncer.drain_ready(start + Duration::from_millis(600));
        assert_eq!(
            ready,
            vec![PathBuf::from("/sync/docs"), PathBuf::from("/sync/docs/a.txt")]
        );
        assert_eq!(debouncer.len(), 1);
    }
}
