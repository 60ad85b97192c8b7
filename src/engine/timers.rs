//! Protocol timers t1..t3
//!
//! t0 bounds the TCP connect syscall and lives in the transport; the three
//! remaining timers are deadline slots the engine's event loop sleeps
//! against:
//!
//! - t1: an APDU (I-frame or U activation) awaits acknowledgment. Fatal.
//! - t2: received I-frames await an acknowledgment from us; on expiry an
//!   S-frame goes out. Must be shorter than t1.
//! - t3: line idle; on expiry a TESTFR activation probes the peer.

use std::time::Duration;
use tokio::time::Instant;

/// Which timer fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    T1,
    T2,
    T3,
}

/// Deadline slots for the three protocol timers
#[derive(Debug)]
pub struct ProtocolTimers {
    t1: Duration,
    t2: Duration,
    t3: Duration,
    t1_deadline: Option<Instant>,
    t2_deadline: Option<Instant>,
    t3_deadline: Option<Instant>,
}

impl ProtocolTimers {
    pub fn new(t1: Duration, t2: Duration, t3: Duration) -> Self {
        Self {
            t1,
            t2,
            t3,
            t1_deadline: None,
            t2_deadline: None,
            t3_deadline: None,
        }
    }

    /// (Re)arm t1 from now. Called on every I-frame and U-activation emission.
    pub fn arm_t1(&mut self, now: Instant) {
        self.t1_deadline = Some(now + self.t1);
    }

    pub fn cancel_t1(&mut self) {
        self.t1_deadline = None;
    }

    pub fn t1_armed(&self) -> bool {
        self.t1_deadline.is_some()
    }

    /// Arm t2 unless it is already running; the acknowledgment deadline
    /// counts from the first unacknowledged received frame.
    pub fn arm_t2(&mut self, now: Instant) {
        if self.t2_deadline.is_none() {
            self.t2_deadline = Some(now + self.t2);
        }
    }

    pub fn cancel_t2(&mut self) {
        self.t2_deadline = None;
    }

    /// Restart the idle probe; called on every received APDU.
    pub fn rearm_t3(&mut self, now: Instant) {
        self.t3_deadline = Some(now + self.t3);
    }

    pub fn cancel_t3(&mut self) {
        self.t3_deadline = None;
    }

    pub fn disarm_all(&mut self) {
        self.t1_deadline = None;
        self.t2_deadline = None;
        self.t3_deadline = None;
    }

    /// The earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.t1_deadline, self.t2_deadline, self.t3_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    /// Earliest timer whose deadline has passed, disarming it.
    /// t1 wins ties since its expiry is fatal.
    pub fn take_expired(&mut self, now: Instant) -> Option<TimerKind> {
        if self.t1_deadline.is_some_and(|d| d <= now) {
            self.t1_deadline = None;
            return Some(TimerKind::T1);
        }
        if self.t2_deadline.is_some_and(|d| d <= now) {
            self.t2_deadline = None;
            return Some(TimerKind::T2);
        }
        if self.t3_deadline.is_some_and(|d| d <= now) {
            self.t3_deadline = None;
            return Some(TimerKind::T3);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timers() -> ProtocolTimers {
        ProtocolTimers::new(
            Duration::from_secs(15),
            Duration::from_secs(10),
            Duration::from_secs(20),
        )
    }

    #[tokio::test]
    async fn next_deadline_picks_earliest() {
        let mut t = timers();
        let now = Instant::now();
        assert_eq!(t.next_deadline(), None);

        t.rearm_t3(now);
        t.arm_t1(now);
        t.arm_t2(now);
        // t2 (10 s) < t1 (15 s) < t3 (20 s)
        assert_eq!(t.next_deadline(), Some(now + Duration::from_secs(10)));
        t.cancel_t2();
        assert_eq!(t.next_deadline(), Some(now + Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn t2_does_not_restart_while_armed() {
        let mut t = timers();
        let now = Instant::now();
        t.arm_t2(now);
        t.arm_t2(now + Duration::from_secs(5));
        assert_eq!(t.next_deadline(), Some(now + Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn expiry_order_prefers_t1() {
        let mut t = timers();
        let now = Instant::now();
        t.arm_t1(now);
        t.arm_t2(now);
        t.rearm_t3(now);

        let later = now + Duration::from_secs(30);
        assert_eq!(t.take_expired(later), Some(TimerKind::T1));
        assert_eq!(t.take_expired(later), Some(TimerKind::T2));
        assert_eq!(t.take_expired(later), Some(TimerKind::T3));
        assert_eq!(t.take_expired(later), None);
    }

    #[tokio::test]
    async fn unexpired_timers_do_not_fire() {
        let mut t = timers();
        let now = Instant::now();
        t.arm_t2(now);
        assert_eq!(t.take_expired(now + Duration::from_secs(9)), None);
        assert_eq!(
            t.take_expired(now + Duration::from_secs(10)),
            Some(TimerKind::T2)
        );
    }
}
