use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::slots::SlotAddress;

/// Rate limit for compensating commands: at most one per slot per window.
#[derive(Debug)]
pub struct ConflictCooldown {
    window: Duration,
    last_sent: HashMap<SlotAddress, Instant>,
}

impl ConflictCooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: HashMap::new(),
        }
    }

    /// True (and the window restarts) when no command went out for this
    /// slot within the window.
    pub fn try_acquire(&mut self, slot: SlotAddress, now: Instant) -> bool {
        if let Some(last) = self.last_sent.get(&slot) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }
        self.last_sent.insert(slot, now);
        self.prune(now);
        true
    }

    /// Forget slots of a printer, e.g. when its driver stops.
    pub fn forget_printer(&mut self, printer_id: i64) {
        self.last_sent.retain(|slot, _| slot.printer_id != printer_id);
    }

    fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.last_sent
            .retain(|_, last| now.saturating_duration_since(*last) < window);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.last_sent.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.last_sent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_command_per_window() {
        let mut cooldown = ConflictCooldown::new(Duration::from_secs(60));
        let slot = SlotAddress::new(1, Some(0), 2);
        let t0 = Instant::now();

        assert!(cooldown.try_acquire(slot, t0));
        assert!(!cooldown.try_acquire(slot, t0 + Duration::from_secs(1)));
        assert!(!cooldown.try_acquire(slot, t0 + Duration::from_secs(59)));
        assert!(cooldown.try_acquire(slot, t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_slots_are_independent() {
        let mut cooldown = ConflictCooldown::new(Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(cooldown.try_acquire(SlotAddress::new(1, Some(0), 1), t0));
        assert!(cooldown.try_acquire(SlotAddress::new(1, Some(0), 2), t0));
        assert!(cooldown.try_acquire(SlotAddress::new(2, Some(0), 1), t0));
        assert_eq!(cooldown.len(), 3);

        cooldown.forget_printer(1);
        assert_eq!(cooldown.len(), 1);
        assert!(cooldown.try_acquire(SlotAddress::new(1, Some(0), 1), t0));
    }

    #[test]
    fn test_expired_entries_are_pruned() {
        let mut cooldown = ConflictCooldown::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(cooldown.is_empty());
        cooldown.try_acquire(SlotAddress::new(1, None, 1), t0);
        cooldown.try_acquire(SlotAddress::new(1, None, 2), t0 + Duration::from_secs(30));
        assert_eq!(cooldown.len(), 1);
    }
}
