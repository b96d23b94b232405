//! Monotonic and wall-clock time helpers for spawn bookkeeping.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Journey timestamps are coarsened to this granularity.
pub const GRANULARITY_USEC: u64 = 10_000;

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Microseconds since the first call in this process.
pub fn monotonic_usec() -> u64 {
    process_epoch().elapsed().as_micros() as u64
}

/// Monotonic microseconds rounded down to 10 ms granularity.
pub fn monotonic_usec_coarse() -> u64 {
    monotonic_usec() / GRANULARITY_USEC * GRANULARITY_USEC
}

/// Wall-clock microseconds since the Unix epoch.
pub fn wall_clock_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Remaining time budget for one handshake session.
///
/// Every blocking call in the session charges its elapsed time here, so
/// the budget spans the whole spawn attempt rather than resetting per
/// operation.
#[derive(Debug, Clone)]
pub struct Deadline {
    remaining_usec: u64,
}

impl Deadline {
    pub fn new(usec: u64) -> Self {
        Deadline {
            remaining_usec: usec,
        }
    }

    pub fn remaining_usec(&self) -> u64 {
        self.remaining_usec
    }

    pub fn remaining(&self) -> Duration {
        Duration::from_micros(self.remaining_usec)
    }

    pub fn expired(&self) -> bool {
        self.remaining_usec == 0
    }

    /// Charge the time elapsed since `start_usec` (a `monotonic_usec`
    /// reading taken before the blocking call) against the budget.
    pub fn consume_since(&mut self, start_usec: u64) {
        let now = monotonic_usec();
        let diff = now.saturating_sub(start_usec);
        self.remaining_usec = self.remaining_usec.saturating_sub(diff);
    }

    pub fn exhaust(&mut self) {
        self.remaining_usec = 0;
    }
}
