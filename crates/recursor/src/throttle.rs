//! Server gating maps: the query throttle, per-server EDNS capability, and
//! saturating failure counters.
//!
//! All three need two orderings — by business key for lookups and by
//! timestamp for bulk pruning. The primary store is a `HashMap`; the time
//! ordering is a min-heap that is only reconciled against the map when
//! pruning, so merges and overwrites never have to find and fix old heap
//! entries.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Lazily consistent secondary index ordering keys by a timestamp.
#[derive(Clone, Debug)]
struct ExpiryIndex<K> {
    heap: BinaryHeap<Reverse<(Instant, K)>>,
}

impl<K: Ord> Default for ExpiryIndex<K> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }
}

impl<K: Ord> ExpiryIndex<K> {
    fn push(&mut self, when: Instant, key: K) {
        self.heap.push(Reverse((when, key)));
    }

    /// Pop the next entry whose timestamp is at or before `cutoff`.
    /// Entries may be stale; callers must re-check against the primary map.
    fn pop_expired(&mut self, cutoff: Instant) -> Option<(Instant, K)> {
        if !matches!(self.heap.peek(), Some(Reverse((when, _))) if *when <= cutoff) {
            return None;
        }
        let Reverse(entry) = self.heap.pop().expect("peeked entry");
        Some(entry)
    }

    fn clear(&mut self) {
        self.heap.clear();
    }
}

#[derive(Clone, Copy, Debug)]
struct ThrottleEntry {
    ttd: Instant,
    count: u32,
}

/// Tracks which things may currently not be queried.
///
/// An entry gates at most `count` lookups until `ttd`; each positive
/// [`Throttle::should_throttle`] consumes one. For the resolver the key is
/// `(server, name, qtype)`, with `(server, root, 0)` as the whole-server
/// sentinel.
#[derive(Clone, Debug)]
pub struct Throttle<K: Hash + Eq + Ord + Clone> {
    entries: HashMap<K, ThrottleEntry>,
    by_ttd: ExpiryIndex<K>,
}

impl<K: Hash + Eq + Ord + Clone> Default for Throttle<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            by_ttd: ExpiryIndex::default(),
        }
    }
}

impl<K: Hash + Eq + Ord + Clone> Throttle<K> {
    /// Create an empty throttle map.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while the key is still listed and has tries left; consumes one
    /// try. Exhausted or expired entries are erased on the spot.
    pub fn should_throttle(&mut self, now: Instant, key: &K) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if now > entry.ttd || entry.count == 0 {
            self.entries.remove(key);
            return false;
        }
        entry.count -= 1;
        true // still listed, still blocked
    }

    /// Insert or extend an entry. An existing entry keeps the larger of the
    /// two expiries and the larger of the two counts.
    pub fn throttle(&mut self, now: Instant, key: K, ttl: Duration, count: u32) {
        let ttd = now + ttl;
        match self.entries.get_mut(&key) {
            None => {
                self.entries.insert(key.clone(), ThrottleEntry { ttd, count });
                self.by_ttd.push(ttd, key);
            }
            Some(entry) if ttd > entry.ttd || count > entry.count => {
                entry.ttd = entry.ttd.max(ttd);
                entry.count = entry.count.max(count);
                self.by_ttd.push(entry.ttd, key);
            }
            Some(_) => {}
        }
    }

    /// Erase every entry whose expiry is at or before `now`, walking the
    /// time-ordered index.
    pub fn prune(&mut self, now: Instant) {
        while let Some((_, key)) = self.by_ttd.pop_expired(now) {
            if self.entries.get(&key).is_some_and(|entry| entry.ttd <= now) {
                self.entries.remove(&key);
            }
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is throttled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_ttd.clear();
    }

    /// Copy of the current entries, for operator dumps.
    pub fn snapshot(&self) -> Vec<(K, Instant, u32)> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.ttd, entry.count))
            .collect()
    }
}

/// What we learned about a server's EDNS behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EdnsMode {
    /// Never probed.
    #[default]
    Unknown,
    /// Answers properly with an OPT record.
    EdnsOk,
    /// Answers, but ignores the OPT record we send.
    EdnsIgnorant,
    /// Chokes on EDNS; talk plain DNS to it.
    NoEdns,
}

#[derive(Clone, Copy, Debug)]
struct EdnsStatus {
    mode: EdnsMode,
    mode_set_at: Instant,
}

/// Per-server EDNS capability, prunable by age.
#[derive(Clone, Debug, Default)]
pub struct EdnsStatusMap {
    entries: HashMap<IpAddr, EdnsStatus>,
    by_ts: ExpiryIndex<IpAddr>,
}

impl EdnsStatusMap {
    /// Create an empty status map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The known mode for `server`, `Unknown` if never seen.
    pub fn mode(&self, server: IpAddr) -> EdnsMode {
        self.entries.get(&server).map_or(EdnsMode::Unknown, |status| status.mode)
    }

    /// Record the observed mode, refreshing the entry's timestamp.
    pub fn set_mode(&mut self, server: IpAddr, mode: EdnsMode, now: Instant) {
        self.entries.insert(
            server,
            EdnsStatus {
                mode,
                mode_set_at: now,
            },
        );
        self.by_ts.push(now, server);
    }

    /// Erase entries whose mode was set at or before `cutoff`.
    pub fn prune(&mut self, cutoff: Instant) {
        while let Some((_, server)) = self.by_ts.pop_expired(cutoff) {
            if self
                .entries
                .get(&server)
                .is_some_and(|status| status.mode_set_at <= cutoff)
            {
                self.entries.remove(&server);
            }
        }
    }

    /// Number of servers tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no servers are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_ts.clear();
    }

    /// Copy of the current entries, for operator dumps.
    pub fn snapshot(&self) -> Vec<(IpAddr, EdnsMode, Instant)> {
        self.entries
            .iter()
            .map(|(server, status)| (*server, status.mode, status.mode_set_at))
            .collect()
    }
}

#[derive(Clone, Copy, Debug)]
struct FailEntry {
    count: u64,
    last: Instant,
}

/// Saturating failure counters with a last-updated timestamp, prunable by
/// age. Shared across workers for failed servers and non-resolving NS names.
#[derive(Clone, Debug)]
pub struct FailCounters<K: Hash + Eq + Ord + Clone> {
    entries: HashMap<K, FailEntry>,
    by_ts: ExpiryIndex<K>,
}

impl<K: Hash + Eq + Ord + Clone> Default for FailCounters<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            by_ts: ExpiryIndex::default(),
        }
    }
}

impl<K: Hash + Eq + Ord + Clone> FailCounters<K> {
    /// Create an empty counter map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for `key`; zero if never incremented.
    pub fn value(&self, key: &K) -> u64 {
        self.entries.get(key).map_or(0, |entry| entry.count)
    }

    /// Increment (saturating) and refresh the timestamp; returns the new count.
    pub fn incr(&mut self, key: K, now: Instant) -> u64 {
        let entry = self.entries.entry(key.clone()).or_insert(FailEntry {
            count: 0,
            last: now,
        });
        entry.count = entry.count.saturating_add(1);
        entry.last = now;
        self.by_ts.push(now, key);
        entry.count
    }

    /// Drop the counter for one key.
    pub fn clear_key(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop all counters.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_ts.clear();
    }

    /// Erase entries last updated at or before `cutoff`.
    pub fn prune(&mut self, cutoff: Instant) {
        while let Some((_, key)) = self.by_ts.pop_expired(cutoff) {
            if self.entries.get(&key).is_some_and(|entry| entry.last <= cutoff) {
                self.entries.remove(&key);
            }
        }
    }

    /// Number of keys tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the current counters, for operator dumps.
    pub fn snapshot(&self) -> Vec<(K, u64, Instant)> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.count, entry.last))
            .collect()
    }
}
