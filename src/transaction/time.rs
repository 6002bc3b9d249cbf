//! Transaction time and the clocks that produce it.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The single logical "now" of a transaction, in microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionTime(u64);

impl TransactionTime {
    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    pub fn to_system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_micros(self.0)
    }
}

impl From<SystemTime> for TransactionTime {
    fn from(time: SystemTime) -> Self {
        // Clocks set before the epoch collapse to zero
        let micros = time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        Self(micros as u64)
    }
}

impl std::fmt::Display for TransactionTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

/// Source of wall-clock readings for transaction stamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> TransactionTime;
}

/// Reads the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TransactionTime {
        TransactionTime::from(SystemTime::now())
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub TransactionTime);

impl Clock for FixedClock {
    fn now(&self) -> TransactionTime {
        self.0
    }
}
