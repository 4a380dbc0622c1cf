//! Active and inactivity timeout tracking.
//!
//! The two timeouts are independent: the active timeout bounds the total
//! lifetime of an operation from the moment it is set; the inactivity
//! timeout bounds the gap since the last observed progress and is refreshed
//! by [`ActivityTimeout::update_inactivity`]. Expiry is detected by polling
//! — the owner of the target decides when to check and what to dispatch.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ActivityTimeout {
    active_in: Option<Duration>,
    active_since: Instant,
    inactive_in: Option<Duration>,
    last_activity: Instant,
}

impl ActivityTimeout {
    pub fn new(now: Instant) -> Self {
        ActivityTimeout {
            active_in: None,
            active_since: now,
            inactive_in: None,
            last_activity: now,
        }
    }

    /// Arm (or re-arm) the active timeout, measured from `now`.
    pub fn set_active_timeout(&mut self, timeout: Duration, now: Instant) {
        self.active_in = Some(timeout);
        self.active_since = now;
    }

    pub fn cancel_active_timeout(&mut self) {
        self.active_in = None;
    }

    /// Arm (or re-arm) the inactivity timeout, measured from the last
    /// observed activity.
    pub fn set_inactivity_timeout(&mut self, timeout: Duration, now: Instant) {
        self.inactive_in = Some(timeout);
        self.last_activity = now;
    }

    pub fn cancel_inactivity_timeout(&mut self) {
        self.inactive_in = None;
    }

    /// Record read/write progress, pushing the inactivity deadline out.
    pub fn update_inactivity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_active_timeout_expired(&self, now: Instant) -> bool {
        match self.active_in {
            Some(timeout) => now.duration_since(self.active_since) >= timeout,
            None => false,
        }
    }

    pub fn is_inactivity_timeout_expired(&self, now: Instant) -> bool {
        match self.inactive_in {
            Some(timeout) => now.duration_since(self.last_activity) >= timeout,
            None => false,
        }
    }

    /// Clear both timeouts.
    pub fn cancel_all(&mut self) {
        self.active_in = None;
        self.inactive_in = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_timeout_expires_from_set_point() {
        let t0 = Instant::now();
        let mut timeout = ActivityTimeout::new(t0);
        timeout.set_active_timeout(Duration::from_secs(10), t0);

        assert!(!timeout.is_active_timeout_expired(t0 + Duration::from_secs(9)));
        assert!(timeout.is_active_timeout_expired(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn inactivity_refreshed_by_progress() {
        let t0 = Instant::now();
        let mut timeout = ActivityTimeout::new(t0);
        timeout.set_inactivity_timeout(Duration::from_secs(5), t0);

        let t1 = t0 + Duration::from_secs(4);
        timeout.update_inactivity(t1);
        assert!(!timeout.is_inactivity_timeout_expired(t0 + Duration::from_secs(6)));
        assert!(timeout.is_inactivity_timeout_expired(t1 + Duration::from_secs(5)));
    }

    #[test]
    fn timeouts_are_independent() {
        let t0 = Instant::now();
        let mut timeout = ActivityTimeout::new(t0);
        timeout.set_active_timeout(Duration::from_secs(2), t0);
        timeout.set_inactivity_timeout(Duration::from_secs(10), t0);

        let t1 = t0 + Duration::from_secs(3);
        timeout.update_inactivity(t1);
        assert!(timeout.is_active_timeout_expired(t1));
        assert!(!timeout.is_inactivity_timeout_expired(t1));

        timeout.cancel_active_timeout();
        assert!(!timeout.is_active_timeout_expired(t1));
    }

    #[test]
    fn unarmed_never_expires() {
        let t0 = Instant::now();
        let timeout = ActivityTimeout::new(t0);
        assert!(!timeout.is_active_timeout_expired(t0 + Duration::from_secs(3600)));
        assert!(!timeout.is_inactivity_timeout_expired(t0 + Duration::from_secs(3600)));
    }
}
