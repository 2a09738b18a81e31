// src/clock.rs
//
// =============================================================================
// RAGKEEPER: TIME SOURCE
// =============================================================================
//
// All time-dependent logic (triggers, backups, timestamps) flows through a
// single injected clock so tests can advance time deterministically instead
// of racing against `Utc::now()`.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only advances when told to. Used by scheduler and pipeline
/// tests that need deterministic fire-time arithmetic.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut t = self.inner.lock().unwrap();
        *t += delta;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.inner.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock().unwrap()
    }
}

pub type SharedClock = Arc<dyn Clock>;
