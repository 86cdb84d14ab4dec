//! Exponential backoff with jitter for flush retries.

use rand::Rng;
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 8;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);
const DEFAULT_JITTER_FACTOR: f64 = 0.3;

/// When to retry a failed flush while connectivity holds.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  /// Retries scheduled after one connectivity signal before waiting for the next
  pub max_retries: u32,
  pub initial_delay: Duration,
  pub max_delay: Duration,
  /// Delay is randomized by +/- (factor * delay)
  pub jitter_factor: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: DEFAULT_MAX_RETRIES,
      initial_delay: DEFAULT_INITIAL_DELAY,
      max_delay: DEFAULT_MAX_DELAY,
      jitter_factor: DEFAULT_JITTER_FACTOR,
    }
  }
}

impl RetryPolicy {
  /// Never retry on a timer; only connectivity signals trigger flushes.
  pub fn no_retry() -> Self {
    Self {
      max_retries: 0,
      ..Self::default()
    }
  }

  /// Delay before retry number `retry` (1-based), or `None` once exhausted.
  ///
  /// delay = initial_delay * 2^(retry - 1), capped at max_delay, then jittered.
  pub fn delay_for_retry(&self, retry: u32) -> Option<Duration> {
    if retry == 0 || retry > self.max_retries {
      return None;
    }

    let base = self
      .initial_delay
      .saturating_mul(1u32 << (retry - 1).min(16))
      .min(self.max_delay);

    if self.jitter_factor <= 0.0 {
      return Some(base);
    }

    let spread = self.jitter_factor.min(1.0);
    let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
    Some(base.mul_f64(factor))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exact() -> RetryPolicy {
    RetryPolicy {
      max_retries: 5,
      initial_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(10),
      jitter_factor: 0.0,
    }
  }

  #[test]
  fn test_exponential_growth_with_cap() {
    let policy = exact();
    assert_eq!(policy.delay_for_retry(1), Some(Duration::from_secs(1)));
    assert_eq!(policy.delay_for_retry(2), Some(Duration::from_secs(2)));
    assert_eq!(policy.delay_for_retry(3), Some(Duration::from_secs(4)));
    assert_eq!(policy.delay_for_retry(5), Some(Duration::from_secs(10)));
  }

  #[test]
  fn test_exhausted() {
    let policy = exact();
    assert_eq!(policy.delay_for_retry(0), None);
    assert_eq!(policy.delay_for_retry(6), None);
    assert_eq!(RetryPolicy::no_retry().delay_for_retry(1), None);
  }

  #[test]
  fn test_jitter_stays_in_range() {
    let policy = RetryPolicy {
      jitter_factor: 0.5,
      ..exact()
    };
    for _ in 0..100 {
      let delay = policy.delay_for_retry(3).unwrap();
      assert!(delay >= Duration::from_secs(2));
      assert!(delay <= Duration::from_secs(6));
    }
  }
}
