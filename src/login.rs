//! Login/keep-alive scheduling.
//!
//! A Flatpack2 honors commands only while login frames keep arriving. The
//! protocol has no login acknowledgment distinct from normal telemetry, so
//! the session is a soft, best-effort liveness mechanism: [`LoginScheduler`]
//! turns `LoggedIn` optimistically after every successful send and
//! re-affirms it each interval. The engine's heartbeat task drives the
//! scheduler; this type holds only the timing and state logic so it stays
//! testable without a transport.

use crate::protocol::{login_frame, Frame, UnitAddress};
use std::time::Duration;
use tokio::time::Instant;

/// Heartbeat period. Letting this lapse makes the device stop honoring
/// commands.
pub const LOGIN_INTERVAL: Duration = Duration::from_secs(10);

/// Session state as inferred from heartbeat sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    /// No heartbeat sent yet, or the last send failed.
    LoggedOut,
    /// A heartbeat send is in flight.
    LoggingIn,
    /// The last heartbeat went out; the device is assumed receptive.
    LoggedIn,
}

/// Timing state machine behind the periodic login heartbeat.
#[derive(Debug)]
pub struct LoginScheduler {
    address: UnitAddress,
    status: LoginStatus,
    last_attempt: Option<Instant>,
}

impl LoginScheduler {
    pub fn new(address: UnitAddress) -> Self {
        Self {
            address,
            status: LoginStatus::LoggedOut,
            last_attempt: None,
        }
    }

    pub fn status(&self) -> LoginStatus {
        self.status
    }

    /// When the next heartbeat is due.
    ///
    /// Before the first send this is `now`; afterwards one interval past
    /// the last attempt. An overdue deadline stays in the past, so a missed
    /// cycle fires immediately instead of waiting a full extra interval.
    pub fn next_deadline(&self, now: Instant) -> Instant {
        match self.last_attempt {
            None => now,
            Some(at) => at + LOGIN_INTERVAL,
        }
    }

    /// Starts a login attempt and yields the frame to put on the wire.
    pub fn begin_login(&mut self) -> Frame {
        self.status = LoginStatus::LoggingIn;
        login_frame(&self.address)
    }

    /// Records a successful heartbeat send.
    pub fn mark_sent(&mut self, now: Instant) {
        self.status = LoginStatus::LoggedIn;
        self.last_attempt = Some(now);
    }

    /// Records a failed heartbeat send. The scheduler keeps running and
    /// retries at the next deadline.
    pub fn mark_failed(&mut self, now: Instant) {
        self.status = LoginStatus::LoggedOut;
        self.last_attempt = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SerialNumber, UnitId};

    fn scheduler() -> LoginScheduler {
        let address = UnitAddress::new(
            UnitId::try_from(1).unwrap(),
            SerialNumber::try_from("134372105069").unwrap(),
        );
        LoginScheduler::new(address)
    }

    #[test]
    fn first_heartbeat_is_due_immediately() {
        let s = scheduler();
        assert_eq!(s.status(), LoginStatus::LoggedOut);
        let now = Instant::now();
        assert_eq!(s.next_deadline(now), now);
    }

    #[test]
    fn successful_send_schedules_next_interval() {
        let mut s = scheduler();
        let now = Instant::now();

        let frame = s.begin_login();
        assert_eq!(s.status(), LoginStatus::LoggingIn);
        assert_eq!(frame.raw_id(), 0x0500_4804);

        s.mark_sent(now);
        assert_eq!(s.status(), LoginStatus::LoggedIn);
        assert_eq!(s.next_deadline(now), now + LOGIN_INTERVAL);
    }

    #[test]
    fn failed_send_logs_out_but_keeps_retrying() {
        let mut s = scheduler();
        let now = Instant::now();

        s.begin_login();
        s.mark_failed(now);
        assert_eq!(s.status(), LoginStatus::LoggedOut);
        // Retry on the next tick, not immediately and not never.
        assert_eq!(s.next_deadline(now), now + LOGIN_INTERVAL);
    }

    #[test]
    fn overdue_deadline_stays_in_the_past() {
        let mut s = scheduler();
        let start = Instant::now();
        s.begin_login();
        s.mark_sent(start);

        let late = start + LOGIN_INTERVAL * 3;
        assert_eq!(s.next_deadline(late), start + LOGIN_INTERVAL);
    }
}
