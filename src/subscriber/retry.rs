//! Reconnect backoff for the broker selection loop
//!
//! [`RetryIntervalSequence`] yields the wait applied after a complete pass over
//! the broker list failed. Values come from a fixed, non-decreasing list; once
//! the last element is reached it is returned forever (ceiling, no wrap).
//!
//! ```rust
//! use mb_subscriber::subscriber::RetryIntervalSequence;
//! use std::time::Duration;
//!
//! let mut retry = RetryIntervalSequence::from_secs(&[2, 5, 10]).unwrap();
//! assert_eq!(retry.next_interval(), Duration::from_secs(2));
//! assert_eq!(retry.next_interval(), Duration::from_secs(5));
//! assert_eq!(retry.next_interval(), Duration::from_secs(10));
//! assert_eq!(retry.next_interval(), Duration::from_secs(10));
//! ```

use crate::config::ConfigError;
use std::time::Duration;

const DEFAULT_INTERVALS_SECS: [u64; 15] = [2, 2, 5, 5, 10, 10, 20, 20, 30, 30, 40, 40, 50, 50, 60];

/// Cyclic-with-ceiling backoff interval generator
#[derive(Debug, Clone, PartialEq)]
pub struct RetryIntervalSequence {
    intervals: Vec<Duration>,
    cursor: usize,
}

impl Default for RetryIntervalSequence {
    /// 2, 2, 5, 5, 10, 10, 20, 20, 30, 30, 40, 40, 50, 50, 60 seconds
    fn default() -> Self {
        Self {
            intervals: DEFAULT_INTERVALS_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            cursor: 0,
        }
    }
}

impl RetryIntervalSequence {
    /// Build a sequence from explicit intervals.
    ///
    /// The list must be non-empty and must never decrease.
    pub fn new(intervals: Vec<Duration>) -> Result<Self, ConfigError> {
        if intervals.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "retry interval list must not be empty".to_string(),
            ));
        }
        if intervals.windows(2).any(|w| w[1] < w[0]) {
            return Err(ConfigError::InvalidConfig(format!(
                "retry intervals must be non-decreasing, got {intervals:?}"
            )));
        }
        Ok(Self {
            intervals,
            cursor: 0,
        })
    }

    pub fn from_secs(secs: &[u64]) -> Result<Self, ConfigError> {
        Self::new(secs.iter().map(|s| Duration::from_secs(*s)).collect())
    }

    /// Return the current interval and advance, stopping at the last element
    pub fn next_interval(&mut self) -> Duration {
        let interval = self.intervals[self.cursor];
        if self.cursor + 1 < self.intervals.len() {
            self.cursor += 1;
        }
        interval
    }

    /// Rewind to the first interval
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn max_interval(&self) -> Duration {
        // Non-decreasing, so the last element is the maximum
        self.intervals[self.intervals.len() - 1]
    }

    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }

    /// True once every further call returns the ceiling value
    pub fn at_ceiling(&self) -> bool {
        self.cursor + 1 == self.intervals.len()
    }
}
