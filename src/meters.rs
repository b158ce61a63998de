//! Per-IP and global connection meters. Plain counters behind a `Mutex<HashMap<..>>`, the same
//! shared-state shape the teacher uses for `RateLimiter::limits` and `PresenceTracker::inner`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

pub struct IpMeter {
    max_per_ip: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl IpMeter {
    pub fn new(max_per_ip: u32) -> Self {
        Self {
            max_per_ip,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Increments the counter for `ip` iff it is below `max_per_ip`. Returns whether the
    /// increment happened; on rejection the meter is left untouched.
    pub fn try_inc(&self, ip: &str) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(ip.to_string()).or_insert(0);
        if *count >= self.max_per_ip {
            return false;
        }
        *count += 1;
        true
    }

    /// Decrements the counter for `ip`, removing the key once it reaches zero so the map
    /// doesn't grow unbounded with long-departed IPs.
    pub fn dec(&self, ip: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(ip);
            }
        }
    }

    #[cfg(test)]
    pub fn count(&self, ip: &str) -> u32 {
        let counts = self.counts.lock().unwrap();
        counts.get(ip).copied().unwrap_or(0)
    }
}

pub struct GlobalMeter {
    max_total: u32,
    count: AtomicU32,
}

impl GlobalMeter {
    pub fn new(max_total: u32) -> Self {
        Self {
            max_total,
            count: AtomicU32::new(0),
        }
    }

    /// Atomic compare-and-swap loop: increments iff still under the ceiling.
    pub fn try_inc(&self) -> bool {
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current >= self.max_total {
                return false;
            }
            if self
                .count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn dec(&self) {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(1))
            })
            .ok();
    }

    pub fn current(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_meter_rejects_over_cap_and_frees_key_on_zero() {
        let meter = IpMeter::new(2);
        assert!(meter.try_inc("1.2.3.4"));
        assert!(meter.try_inc("1.2.3.4"));
        assert!(!meter.try_inc("1.2.3.4"));
        meter.dec("1.2.3.4");
        meter.dec("1.2.3.4");
        assert_eq!(meter.count("1.2.3.4"), 0);
        assert!(meter.try_inc("1.2.3.4"));
    }

    #[test]
    fn reject_does_not_consume_slot() {
        let meter = IpMeter::new(1);
        assert!(meter.try_inc("a"));
        assert!(!meter.try_inc("a"));
        assert_eq!(meter.count("a"), 1);
    }

    #[test]
    fn global_meter_enforces_ceiling() {
        let meter = GlobalMeter::new(2);
        assert!(meter.try_inc());
        assert!(meter.try_inc());
        assert!(!meter.try_inc());
        meter.dec();
        assert!(meter.try_inc());
    }
}
