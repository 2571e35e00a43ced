//! Bounded reconnection policy.

use std::time::Duration;

use crate::config::Config;

/// Decides whether another automatic reconnection attempt is allowed.
///
/// Attempts are counted from the last successful connection; once
/// `max_attempts` consecutive attempts were spent the policy refuses until
/// [`ReconnectPolicy::reset`] is called.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
   max_attempts: u32,
   delay: Duration,
   attempts: u32,
}

impl ReconnectPolicy {
   pub const fn new(max_attempts: u32, delay: Duration) -> Self {
      Self {
         max_attempts,
         delay,
         attempts: 0,
      }
   }

   pub fn from_config(config: &Config) -> Self {
      Self::new(config.reconnect_attempts, config.reconnect_delay())
   }

   /// Reserves the next attempt, returning the delay to wait before it.
   pub fn next_attempt(&mut self) -> Option<Duration> {
      if self.attempts >= self.max_attempts {
         return None;
      }
      self.attempts += 1;
      Some(self.delay)
   }

   pub const fn attempts(&self) -> u32 {
      self.attempts
   }

   pub const fn max_attempts(&self) -> u32 {
      self.max_attempts
   }

   pub fn reset(&mut self) {
      self.attempts = 0;
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_bounded_attempts() {
      let mut policy = ReconnectPolicy::new(3, Duration::from_millis(1000));

      for n in 1..=3 {
         assert_eq!(policy.next_attempt(), Some(Duration::from_millis(1000)));
         assert_eq!(policy.attempts(), n);
      }
      assert_eq!(policy.next_attempt(), None);
      assert_eq!(policy.next_attempt(), None);
      assert_eq!(policy.attempts(), 3);
   }

   #[test]
   fn test_reset_restores_budget() {
      let mut policy = ReconnectPolicy::from_config(&Config::default());
      while policy.next_attempt().is_some() {}
      assert_eq!(policy.attempts(), policy.max_attempts());

      policy.reset();
      assert_eq!(policy.attempts(), 0);
      assert!(policy.next_attempt().is_some());
   }

   #[test]
   fn test_zero_attempts_never_retries() {
      let mut policy = ReconnectPolicy::new(0, Duration::ZERO);
      assert_eq!(policy.next_attempt(), None);
   }
}
