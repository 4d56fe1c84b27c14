use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Per-key coalescing timer.
///
/// Every [`record`](Self::record) pushes the key's deadline to
/// `now + window`; a key becomes due once its deadline has passed without
/// another event. N events for one key inside the window therefore yield a
/// single due key.
#[derive(Debug)]
pub struct Debouncer<K> {
    window: Duration,
    deadlines: BTreeMap<K, Instant>,
}

impl<K: Ord + Clone> Debouncer<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadlines: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, key: K, now: Instant) {
        self.deadlines.insert(key, now + self.window);
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every key whose deadline is at or before `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<K> {
        let due: Vec<K> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            self.deadlines.remove(key);
        }
        due
    }

    /// Remove and return every pending key regardless of deadline.
    pub fn drain(&mut self) -> Vec<K> {
        std::mem::take(&mut self.deadlines).into_keys().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn burst_coalesces_into_one_key() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        for i in 0..5 {
            debouncer.record("styles", start + Duration::from_millis(i * 20));
        }
        assert!(debouncer.take_due(start + Duration::from_millis(150)).is_empty());
        assert_eq!(
            debouncer.take_due(start + Duration::from_millis(180)),
            vec!["styles"]
        );
        assert!(debouncer.is_empty());
    }

    #[test]
    fn later_events_extend_the_deadline() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.record("markup", start);
        assert_eq!(debouncer.next_deadline(), Some(start + WINDOW));
        debouncer.record("markup", start + Duration::from_millis(60));
        assert_eq!(
            debouncer.next_deadline(),
            Some(start + Duration::from_millis(160))
        );
    }

    #[test]
    fn keys_fire_independently() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.record("markup", start);
        debouncer.record("scripts", start + Duration::from_millis(80));
        assert_eq!(debouncer.take_due(start + WINDOW), vec!["markup"]);
        assert_eq!(debouncer.next_deadline(), Some(start + Duration::from_millis(180)));
        assert_eq!(debouncer.drain(), vec!["scripts"]);
        assert_eq!(debouncer.next_deadline(), None);
    }
}
