//! Latency bookkeeping for name servers.
//!
//! Every (name server, address) pair carries an exponentially weighted moving
//! average of observed round-trip microseconds. Averages decay on read only,
//! so no background sweeper is needed; a collection that has not been read
//! for long enough is simply pruned wholesale.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use crate::proto::rr::Name;

/// An exponentially weighted moving average which, additionally, decays over
/// time. The decaying is only done on get.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecayingEwma {
    last: Option<Instant>,
    val: f32,
}

impl DecayingEwma {
    /// Fold a new sample into the average.
    ///
    /// The first sample initializes the average outright. Later samples are
    /// blended with weight `exp(Δt)/2` on the old value, Δt being the
    /// (negative) seconds since the previous sample; a sample arriving long
    /// after the last one almost fully replaces it.
    pub fn submit(&mut self, usecs: u32, now: Instant) {
        match self.last {
            None => {
                self.last = Some(now);
                self.val = usecs as f32;
            }
            Some(last) => {
                let diff = -now.saturating_duration_since(last).as_secs_f32();
                self.last = Some(now);
                let factor = diff.exp() / 2.0; // might be '0.5', or 0.0001
                self.val = (1.0 - factor) * usecs as f32 + factor * self.val;
            }
        }
    }

    /// Apply a decay factor and return the decayed value.
    pub fn get(&mut self, factor: f32) -> f32 {
        self.val *= factor;
        self.val
    }

    /// The stored value, without decay side effects.
    pub fn peek(&self) -> f32 {
        self.val
    }
}

/// The averages for all known addresses of one name server, sharing a
/// collection-wide decay applied whenever the collection is read.
#[derive(Clone, Debug, Default)]
pub struct DecayingEwmaCollection {
    collection: HashMap<IpAddr, DecayingEwma>,
    last_get: Option<Instant>,
}

impl DecayingEwmaCollection {
    /// Record a sample for one address of this server.
    pub fn submit(&mut self, remote: IpAddr, usecs: u32, now: Instant) {
        self.collection.entry(remote).or_default().submit(usecs, now);
    }

    fn factor(&self, now: Instant) -> f32 {
        match self.last_get {
            None => 1.0,
            Some(last) => (-now.saturating_duration_since(last).as_secs_f32() / 60.0).exp(),
        }
    }

    /// The fastest decayed average across this server's addresses.
    ///
    /// Reading refreshes `last_get`, which is what keeps an actively used
    /// collection alive across [`NsSpeeds::prune`].
    pub fn get(&mut self, now: Instant) -> f32 {
        if self.collection.is_empty() {
            return 0.0;
        }
        if self.last_get.is_none() {
            self.last_get = Some(now);
        }
        let factor = self.factor(now);
        let mut ret = f32::MAX;
        for entry in self.collection.values_mut() {
            let val = entry.get(factor);
            if val < ret {
                ret = val;
            }
        }
        self.last_get = Some(now);
        ret
    }

    /// The stored value for one address, without decay.
    pub fn peek(&self, remote: IpAddr) -> f32 {
        self.collection.get(&remote).map_or(0.0, DecayingEwma::peek)
    }

    /// True if this collection has not been read since `cutoff`.
    pub fn stale(&self, cutoff: Instant) -> bool {
        self.last_get.is_none_or(|last| last < cutoff)
    }

    /// Drop every address not present in `keep`.
    pub fn purge(&mut self, keep: &HashMap<IpAddr, f32>) {
        self.collection.retain(|addr, _| keep.contains_key(addr));
    }

    /// Number of addresses tracked.
    pub fn len(&self) -> usize {
        self.collection.len()
    }

    /// True when no addresses are tracked.
    pub fn is_empty(&self) -> bool {
        self.collection.is_empty()
    }
}

/// Per-worker map of name-server name to its address speed collection.
#[derive(Clone, Debug, Default)]
pub struct NsSpeeds {
    speeds: HashMap<Name, DecayingEwmaCollection>,
}

impl NsSpeeds {
    /// Create an empty speed map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation for `(server, remote)`.
    pub fn submit(&mut self, server: &Name, remote: IpAddr, usecs: u32, now: Instant) {
        self.speeds
            .entry(server.clone())
            .or_default()
            .submit(remote, usecs, now);
    }

    /// The server's best decayed average; 0.0 for a server never measured.
    pub fn get(&mut self, server: &Name, now: Instant) -> f32 {
        self.speeds.entry(server.clone()).or_default().get(now)
    }

    /// The stored value for one address of `server`, without decay.
    pub fn peek(&self, server: &Name, remote: IpAddr) -> f32 {
        self.speeds
            .get(server)
            .map_or(0.0, |collection| collection.peek(remote))
    }

    /// Drop addresses of `server` absent from the latest keep set.
    pub fn purge(&mut self, server: &Name, keep: &HashMap<IpAddr, f32>) {
        if let Some(collection) = self.speeds.get_mut(server) {
            collection.purge(keep);
        }
    }

    /// Drop every collection that has not been read since `cutoff`.
    pub fn prune(&mut self, cutoff: Instant) {
        self.speeds.retain(|_, collection| !collection.stale(cutoff));
    }

    /// Number of servers tracked.
    pub fn len(&self) -> usize {
        self.speeds.len()
    }

    /// True when no servers are tracked.
    pub fn is_empty(&self) -> bool {
        self.speeds.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.speeds.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn first_sample_initializes() {
        let now = Instant::now();
        let mut ewma = DecayingEwma::default();
        ewma.submit(5_000, now);
        assert_eq!(ewma.peek(), 5_000.0);
    }

    #[test]
    fn later_samples_blend_towards_recent() {
        let now = Instant::now();
        let mut ewma = DecayingEwma::default();
        ewma.submit(1_000, now);
        // A sample long after the first: old value weight exp(-3600)/2 ~ 0.
        ewma.submit(9_000, now + Duration::from_secs(3600));
        assert!((ewma.peek() - 9_000.0).abs() < 1.0);

        // Back-to-back samples split the difference.
        let mut ewma = DecayingEwma::default();
        ewma.submit(1_000, now);
        ewma.submit(9_000, now);
        assert!((ewma.peek() - 5_000.0).abs() < 1.0);
    }

    #[test]
    fn collection_returns_minimum_across_addresses() {
        let now = Instant::now();
        let mut collection = DecayingEwmaCollection::default();
        collection.submit(addr("192.0.2.1"), 9_000, now);
        collection.submit(addr("192.0.2.2"), 2_000, now);
        let fastest = collection.get(now);
        assert!((fastest - 2_000.0).abs() < 1.0);
    }

    #[test]
    fn get_is_monotone_non_increasing_without_submissions() {
        let now = Instant::now();
        let mut speeds = NsSpeeds::new();
        let ns = Name::from_ascii("ns1.example.com.").unwrap();
        speeds.submit(&ns, addr("192.0.2.1"), 10_000, now);

        let mut prev = speeds.get(&ns, now);
        for i in 1..6u64 {
            let val = speeds.get(&ns, now + Duration::from_secs(i * 30));
            assert!(val <= prev, "EWMA grew without submissions: {val} > {prev}");
            prev = val;
        }
    }

    #[test]
    fn purge_keeps_only_listed_addresses() {
        let now = Instant::now();
        let mut speeds = NsSpeeds::new();
        let ns = Name::from_ascii("ns1.example.com.").unwrap();
        speeds.submit(&ns, addr("192.0.2.1"), 1_000, now);
        speeds.submit(&ns, addr("192.0.2.2"), 2_000, now);

        let mut keep = HashMap::new();
        keep.insert(addr("192.0.2.2"), 2_000.0);
        speeds.purge(&ns, &keep);

        assert_eq!(speeds.peek(&ns, addr("192.0.2.1")), 0.0);
        assert!(speeds.peek(&ns, addr("192.0.2.2")) > 0.0);
    }

    #[test]
    fn prune_removes_stale_collections() {
        let now = Instant::now();
        let mut speeds = NsSpeeds::new();
        let fresh = Name::from_ascii("fresh.example.com.").unwrap();
        let stale = Name::from_ascii("stale.example.com.").unwrap();
        speeds.submit(&stale, addr("192.0.2.1"), 1_000, now);
        speeds.submit(&fresh, addr("192.0.2.2"), 1_000, now);

        // Only the fresh server gets read past the cutoff.
        let later = now + Duration::from_secs(600);
        speeds.get(&fresh, later);
        speeds.prune(later);

        assert_eq!(speeds.len(), 1);
        assert!(speeds.peek(&fresh, addr("192.0.2.2")) > 0.0);
    }
}
