// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Retry and exhaustion decision.
//!
//! `attempts` counts failed processing attempts and starts at 0 on publish.
//! A message is exhausted once it carries a recorded exception or once its
//! attempts exceed `max_tries`.

/// Outcome of `RetryPolicy::decide`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Process,
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn decide(attempts: u32, max_tries: u32, has_exception: bool) -> Decision {
        if has_exception || attempts > max_tries {
            return Decision::Exhausted;
        }

        Decision::Process
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_message_is_processed() {
        assert_eq!(RetryPolicy::decide(0, 3, false), Decision::Process);
        assert_eq!(RetryPolicy::decide(0, 0, false), Decision::Process);
        assert_eq!(RetryPolicy::decide(3, 3, false), Decision::Process);
    }

    #[test]
    fn attempts_above_max_tries_exhaust() {
        for max_tries in 0..8 {
            for attempts in (max_tries + 1)..(max_tries + 8) {
                assert_eq!(
                    RetryPolicy::decide(attempts, max_tries, false),
                    Decision::Exhausted
                );
                assert_eq!(
                    RetryPolicy::decide(attempts, max_tries, true),
                    Decision::Exhausted
                );
            }
        }
    }

    #[test]
    fn recorded_exception_exhausts_whatever_the_attempts() {
        for attempts in 0..8 {
            assert_eq!(RetryPolicy::decide(attempts, 10, true), Decision::Exhausted);
        }
    }
}
