//! Timer utilities
//!
//! Measures service calls and logs how long they took.

use std::time::{Duration, Instant};
use tracing::debug;

/// Simple timer for measuring elapsed time
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    /// Create and start a new timer
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    /// Stop timer, log and return elapsed time
    pub fn stop(self) -> Duration {
        debug!("{} took {}ms", self.label, self.elapsed_ms());
        self.elapsed()
    }
}
