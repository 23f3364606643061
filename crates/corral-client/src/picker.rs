//! Load balancing across a channel's ready subchannels.
//!
//! A [`Balancer`] turns the current ready set into a [`Picker`]; the channel
//! asks the picker for a subchannel on every call. The only balancer shipped
//! is [`RoundRobinBalancer`].

use std::sync::Arc;

use corral_common::{CorralError, Result};
use parking_lot::Mutex;
use rand::Rng;

use crate::subchannel::Subchannel;

/// Chooses the subchannel for the next call.
///
/// A picker is immutable apart from its own cursor; a channel replaces it
/// wholesale whenever its ready set changes.
///
/// # Thread Safety
///
/// `pick` is called concurrently from every task calling through the
/// channel, so implementations must not block.
pub trait Picker: Send + Sync {
    /// Returns the subchannel to send the next call on.
    ///
    /// # Errors
    ///
    /// [`CorralError::Unavailable`] when there is nothing to pick from. This
    /// must return at once rather than wait for a subchannel to appear.
    fn pick(&self) -> Result<Arc<Subchannel>>;
}

/// Builds pickers from the current ready set.
///
/// Registered per scheme in a [`SchemeRegistry`](crate::SchemeRegistry) and
/// shared by every channel dialed through it.
pub trait Balancer: Send + Sync {
    /// Name used in logs and to look the balancer up.
    fn name(&self) -> &str;

    /// Builds a picker over `ready`.
    ///
    /// Called on every resolution and every connectivity change, possibly
    /// with an empty set. The returned picker must fail fast in that case.
    fn build_picker(&self, ready: Vec<Arc<Subchannel>>) -> Arc<dyn Picker>;
}

/// Round-robin over a fixed list.
///
/// The cursor starts at a random offset so clients that rebuild at the same
/// moment do not all hit the first entry.
///
/// # Fields
///
/// - `entries`: The list to rotate over, fixed at construction
/// - `next`: Index of the entry the next call returns
///
/// # Distribution
///
/// Over `n` picks across `k` entries every entry is returned either
/// `n / k` or `n / k + 1` times, including under concurrent callers: the
/// cursor read and advance happen under one lock.
///
/// # Example
///
/// ```rust
/// use corral_client::RoundRobin;
///
/// let rr = RoundRobin::with_offset(vec!["a", "b", "c"], 1);
/// assert_eq!(rr.next(), Some("b"));
/// assert_eq!(rr.next(), Some("c"));
/// assert_eq!(rr.next(), Some("a"));
/// ```
pub struct RoundRobin<T> {
    entries: Vec<T>,
    next: Mutex<usize>,
}

impl<T: Clone> RoundRobin<T> {
    /// Creates a rotation over `entries` starting at a random position.
    pub fn new(entries: Vec<T>) -> Self {
        let offset = if entries.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..entries.len())
        };
        Self::with_offset(entries, offset)
    }

    /// Creates a rotation starting at `offset`, taken modulo the length.
    pub fn with_offset(entries: Vec<T>, offset: usize) -> Self {
        let offset = if entries.is_empty() { 0 } else { offset % entries.len() };
        Self {
            entries,
            next: Mutex::new(offset),
        }
    }

    /// Returns the entry at the cursor and advances it. `None` when empty.
    pub fn next(&self) -> Option<T> {
        if self.entries.is_empty() {
            return None;
        }
        let mut next = self.next.lock();
        let entry = self.entries[*next].clone();
        *next = (*next + 1) % self.entries.len();
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Picker for RoundRobin<Arc<Subchannel>> {
    fn pick(&self) -> Result<Arc<Subchannel>> {
        self.next()
            .ok_or_else(|| CorralError::Unavailable("no ready subchannel".into()))
    }
}

/// The default balancer: round-robin across ready subchannels.
///
/// Stateless; every picker it builds starts its own rotation at a random
/// offset.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinBalancer;

impl RoundRobinBalancer {
    pub const NAME: &'static str = "corral_round_robin";
}

impl Balancer for RoundRobinBalancer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn build_picker(&self, ready: Vec<Arc<Subchannel>>) -> Arc<dyn Picker> {
        tracing::trace!(ready = ready.len(), "building round-robin picker");
        Arc::new(RoundRobin::new(ready))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    fn subchannels(n: usize) -> Vec<Arc<Subchannel>> {
        (0..n)
            .map(|i| Arc::new(Subchannel::new(format!("10.0.0.{}:9001", i + 1), Duration::from_millis(100))))
            .collect()
    }

    #[test]
    fn test_round_robin_order() {
        let rr = RoundRobin::with_offset(vec!["a", "b", "c"], 1);
        let picked: Vec<&str> = (0..6).filter_map(|_| rr.next()).collect();
        assert_eq!(picked, vec!["b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn test_offset_wraps() {
        let rr = RoundRobin::with_offset(vec![1, 2], 5);
        assert_eq!(rr.next(), Some(2));
    }

    #[test]
    fn test_random_offset_in_range() {
        for _ in 0..50 {
            let rr = RoundRobin::new(vec![1, 2, 3, 4]);
            assert!(rr.next().is_some());
        }
    }

    #[test]
    fn test_even_distribution() {
        for (k, n) in [(1usize, 7usize), (3, 10), (4, 4), (5, 23), (7, 100)] {
            let picker = RoundRobinBalancer.build_picker(subchannels(k));
            let mut counts: HashMap<String, usize> = HashMap::new();
            for _ in 0..n {
                let sub = picker.pick().unwrap();
                *counts.entry(sub.addr().to_string()).or_default() += 1;
            }

            let floor = n / k;
            let ceil = n.div_ceil(k);
            assert_eq!(counts.values().sum::<usize>(), n);
            for count in counts.values() {
                assert!(*count == floor || *count == ceil, "k={} n={} count={}", k, n, count);
            }
            if n >= k {
                assert_eq!(counts.len(), k);
            }
        }
    }

    #[test]
    fn test_empty_picker_fails_fast() {
        let picker = RoundRobinBalancer.build_picker(Vec::new());
        let started = Instant::now();
        assert!(matches!(picker.pick(), Err(CorralError::Unavailable(_))));
        assert!(started.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn test_concurrent_picks_stay_balanced() {
        let picker = RoundRobinBalancer.build_picker(subchannels(4));
        let counts = Arc::new(Mutex::new(HashMap::<String, usize>::new()));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let picker = picker.clone();
                let counts = counts.clone();
                scope.spawn(move || {
                    for _ in 0..250 {
                        let addr = picker.pick().unwrap().addr().to_string();
                        *counts.lock().entry(addr).or_default() += 1;
                    }
                });
            }
        });

        let counts = counts.lock();
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|c| *c == 250));
    }
}
