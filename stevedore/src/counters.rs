//! Per-key integer counters with waiters on exact values.
//!
//! A [`Counters`] store maps endpoint names to counters. Callers can wait
//! for a counter to reach an exact value, or for its lifetime total of
//! increments to reach a milestone. Waiters on the same value share one
//! slot and are all released together the instant the value is hit; the
//! slot is then discarded so the next waiter for the same value installs a
//! fresh one. Counter mutations never suspend.

use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::signals::Event;

/// Errors produced by counter mutations. A failed operation leaves the
/// counter unchanged.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CounterError {
    /// The counter hit `max` or `max_increments`.
    #[error("counter {key:?} cannot go above its limit of {limit}")]
    Bounds { key: String, limit: u64 },
    /// The counter would go negative.
    #[error("counter {key:?} decremented below zero")]
    Underflow { key: String },
}

#[derive(Debug, Default)]
struct Counter {
    num: u64,
    total_increments: u64,
    max: Option<u64>,
    max_increments: Option<u64>,
    num_waiters: FxHashMap<u64, Event>,
    total_waiters: FxHashMap<u64, Event>,
}

impl Counter {
    fn increment(&mut self, key: &str) -> Result<u64, CounterError> {
        if let Some(max) = self.max {
            if self.num == max {
                return Err(CounterError::Bounds {
                    key: key.to_owned(),
                    limit: max,
                });
            }
        }
        if let Some(max) = self.max_increments {
            if self.total_increments == max {
                return Err(CounterError::Bounds {
                    key: key.to_owned(),
                    limit: max,
                });
            }
        }
        self.num += 1;
        self.total_increments += 1;
        Self::wake(&mut self.num_waiters, self.num);
        Self::wake(&mut self.total_waiters, self.total_increments);
        Ok(self.num)
    }

    fn decrement(&mut self, key: &str) -> Result<u64, CounterError> {
        if self.num == 0 {
            return Err(CounterError::Underflow {
                key: key.to_owned(),
            });
        }
        self.num -= 1;
        Self::wake(&mut self.num_waiters, self.num);
        Ok(self.num)
    }

    fn wake(waiters: &mut FxHashMap<u64, Event>, value: u64) {
        if let Some(event) = waiters.remove(&value) {
            event.set();
        }
    }
}

/// Lazily-created counters keyed by name. Removal is explicit: a removed
/// counter abandons any waiters still parked on unreached values.
#[derive(Debug, Default)]
pub struct Counters {
    inner: Mutex<FxHashMap<String, Counter>>,
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, key: &str) -> Result<u64, CounterError> {
        let mut inner = self.inner.lock().expect("counters lock poisoned");
        inner.entry(key.to_owned()).or_default().increment(key)
    }

    pub fn decrement(&self, key: &str) -> Result<u64, CounterError> {
        let mut inner = self.inner.lock().expect("counters lock poisoned");
        inner.entry(key.to_owned()).or_default().decrement(key)
    }

    /// Bound a counter. `max` caps the live value, `max_increments` caps the
    /// lifetime total.
    pub fn set_limits(&self, key: &str, max: Option<u64>, max_increments: Option<u64>) {
        let mut inner = self.inner.lock().expect("counters lock poisoned");
        let counter = inner.entry(key.to_owned()).or_default();
        counter.max = max;
        counter.max_increments = max_increments;
    }

    #[must_use]
    pub fn get_num(&self, key: &str) -> u64 {
        let mut inner = self.inner.lock().expect("counters lock poisoned");
        inner.entry(key.to_owned()).or_default().num
    }

    #[must_use]
    pub fn total_increments(&self, key: &str) -> u64 {
        let mut inner = self.inner.lock().expect("counters lock poisoned");
        inner.entry(key.to_owned()).or_default().total_increments
    }

    /// Wait until the counter equals `num`. Returns immediately if it
    /// already does.
    pub async fn wait_for(&self, key: &str, num: u64) {
        let event = {
            let mut inner = self.inner.lock().expect("counters lock poisoned");
            let counter = inner.entry(key.to_owned()).or_default();
            if counter.num == num {
                return;
            }
            counter
                .num_waiters
                .entry(num)
                .or_insert_with(Event::new)
                .clone()
        };
        event.wait().await;
    }

    /// Wait until the counter's lifetime total of increments equals `num`.
    pub async fn wait_for_total_increments(&self, key: &str, num: u64) {
        let event = {
            let mut inner = self.inner.lock().expect("counters lock poisoned");
            let counter = inner.entry(key.to_owned()).or_default();
            if counter.total_increments >= num {
                return;
            }
            counter
                .total_waiters
                .entry(num)
                .or_insert_with(Event::new)
                .clone()
        };
        event.wait().await;
    }

    /// Drop the counter for `key`. This is the cleanup point for waiters on
    /// values that were never reached.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().expect("counters lock poisoned");
        inner.remove(key);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("counters lock poisoned");
        inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    #[tokio::test]
    async fn waiter_released_exactly_at_value() {
        let counters = std::sync::Arc::new(Counters::new());
        let observed = {
            let counters = counters.clone();
            tokio::spawn(async move {
                counters.wait_for("endpoint", 3).await;
                counters.get_num("endpoint")
            })
        };
        tokio::task::yield_now().await;
        assert!(!observed.is_finished());
        counters.increment("endpoint").unwrap();
        counters.increment("endpoint").unwrap();
        tokio::task::yield_now().await;
        assert!(!observed.is_finished());
        counters.increment("endpoint").unwrap();
        let num = tokio::time::timeout(Duration::from_secs(1), observed)
            .await
            .expect("waiter timed out")
            .expect("waiter panicked");
        assert_eq!(num, 3);
    }

    #[tokio::test]
    async fn wait_for_current_value_returns_immediately() {
        let counters = Counters::new();
        counters.wait_for("nothing", 0).await;
        counters.increment("nothing").unwrap();
        counters.wait_for("nothing", 1).await;
    }

    #[tokio::test]
    async fn slot_is_discarded_after_release() {
        let counters = std::sync::Arc::new(Counters::new());
        counters.increment("e").unwrap();
        let first = {
            let counters = counters.clone();
            tokio::spawn(async move { counters.wait_for("e", 0).await })
        };
        tokio::task::yield_now().await;
        counters.decrement("e").unwrap();
        tokio::time::timeout(Duration::from_secs(1), first)
            .await
            .expect("first waiter timed out")
            .unwrap();

        // The 0 slot was consumed; a new waiter installs a fresh one and is
        // not woken by the stale event.
        counters.increment("e").unwrap();
        let second = {
            let counters = counters.clone();
            tokio::spawn(async move { counters.wait_for("e", 0).await })
        };
        tokio::task::yield_now().await;
        assert!(!second.is_finished());
        counters.decrement("e").unwrap();
        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .expect("second waiter timed out")
            .unwrap();
    }

    #[tokio::test]
    async fn total_increment_milestones_survive_decrements() {
        let counters = Counters::new();
        counters.increment("e").unwrap();
        counters.decrement("e").unwrap();
        counters.increment("e").unwrap();
        assert_eq!(counters.get_num("e"), 1);
        assert_eq!(counters.total_increments("e"), 2);
        // Milestone already passed: resolves immediately.
        counters.wait_for_total_increments("e", 2).await;
    }

    #[test]
    fn bounds_and_underflow() {
        let counters = Counters::new();
        counters.set_limits("e", Some(2), None);
        counters.increment("e").unwrap();
        counters.increment("e").unwrap();
        let err = counters.increment("e").unwrap_err();
        assert_eq!(
            err,
            CounterError::Bounds {
                key: "e".to_owned(),
                limit: 2
            }
        );
        // State unchanged by the failed increment.
        assert_eq!(counters.get_num("e"), 2);
        assert_eq!(counters.total_increments("e"), 2);

        counters.decrement("e").unwrap();
        counters.decrement("e").unwrap();
        let err = counters.decrement("e").unwrap_err();
        assert_eq!(
            err,
            CounterError::Underflow {
                key: "e".to_owned()
            }
        );
        assert_eq!(counters.get_num("e"), 0);
    }

    proptest! {
        // Any interleaving of increments and decrements keeps num equal to
        // increments minus decrements and never trips the limits when none
        // are set.
        #[test]
        fn num_tracks_operations(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let counters = Counters::new();
            let mut expected: i64 = 0;
            let mut total: u64 = 0;
            for up in ops {
                if up {
                    counters.increment("p").unwrap();
                    expected += 1;
                    total += 1;
                } else if expected > 0 {
                    counters.decrement("p").unwrap();
                    expected -= 1;
                } else {
                    prop_assert!(counters.decrement("p").is_err());
                }
                prop_assert_eq!(counters.get_num("p"), expected as u64);
                prop_assert_eq!(counters.total_increments("p"), total);
            }
        }
    }
}
