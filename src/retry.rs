use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::StudyError;

/// Bounded, fixed-delay retry for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: Duration::ZERO,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent. `op` receives the zero-based attempt number.
    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T, StudyError>
    where
        F: FnMut(u32) -> Result<T, StudyError>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        target_item = label,
                        attempt,
                        max = self.max_retries,
                        error = %err,
                        "transient failure, retrying in {:?}",
                        self.delay
                    );
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
