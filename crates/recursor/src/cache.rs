//! The record, negative, and packet caches.
//!
//! Entries carry an explicit `valid_until` checked against the caller's
//! `now`, so reads are deterministic under test; capacity eviction is left
//! to the backing store. TTLs are clamped on insert and rewritten to the
//! remaining lifetime on read.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::IpNet;
use lru_cache::LruCache;
use moka::sync::Cache;
use parking_lot::Mutex;

use crate::normalized_rtype;
use crate::proto::op::ResponseCode;
use crate::proto::rr::{DNSClass, LowerName, Name, Record, RecordType, RrKey};
use crate::validate::ValidationState;

#[derive(Clone, Debug)]
struct RecordEntry {
    records: Vec<Record>,
    signatures: Vec<Record>,
    orig_ttl: u32,
    valid_until: Instant,
    auth: bool,
    state: ValidationState,
}

/// A positive cache hit with TTLs rewritten to the remaining lifetime.
#[derive(Clone, Debug)]
pub struct CacheHit {
    /// The RRset.
    pub records: Vec<Record>,
    /// RRSIG records stored alongside the set.
    pub signatures: Vec<Record>,
    /// Validation state recorded when the set was cached.
    pub state: ValidationState,
    /// Whether the set came from an authoritative answer.
    pub auth: bool,
    /// Seconds of life left at the time of the read.
    pub remaining_ttl: u32,
    /// The clamped TTL the set went in with.
    pub orig_ttl: u32,
}

impl CacheHit {
    /// True when less than `percent` percent of the original TTL remains —
    /// the signal to queue a background refresh.
    pub fn almost_expired(&self, percent: u32) -> bool {
        percent > 0 && u64::from(self.remaining_ttl) * 100 < u64::from(self.orig_ttl) * u64::from(percent)
    }
}

/// The positive record cache, keyed by (name, type).
pub struct RecordCache {
    cache: Cache<RrKey, Arc<RecordEntry>>,
    min_ttl: u32,
    max_ttl: u32,
}

impl RecordCache {
    /// Create a cache evicting past `capacity` RRsets, clamping stored TTLs
    /// into `[min_ttl, max_ttl]`.
    pub fn new(capacity: u64, min_ttl: u32, max_ttl: u32) -> Self {
        Self {
            cache: Cache::builder().max_capacity(capacity).build(),
            min_ttl,
            max_ttl,
        }
    }

    fn key(name: &Name, qtype: RecordType) -> RrKey {
        RrKey::new(LowerName::new(name), normalized_rtype(qtype))
    }

    /// Store one RRset. The TTL is the minimum across the set, clamped by the
    /// cache bounds and additionally by `ttl_cap` (used to keep Bogus data
    /// short-lived).
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        name: &Name,
        qtype: RecordType,
        records: Vec<Record>,
        signatures: Vec<Record>,
        auth: bool,
        state: ValidationState,
        ttl_cap: Option<u32>,
        now: Instant,
    ) {
        if records.is_empty() {
            return;
        }
        let mut ttl = records
            .iter()
            .map(Record::ttl)
            .min()
            .unwrap_or(self.min_ttl)
            .clamp(self.min_ttl, self.max_ttl);
        if let Some(cap) = ttl_cap {
            ttl = ttl.min(cap);
        }
        let entry = RecordEntry {
            records,
            signatures,
            orig_ttl: ttl,
            valid_until: now + Duration::from_secs(u64::from(ttl)),
            auth,
            state,
        };
        self.cache.insert(Self::key(name, qtype), Arc::new(entry));
    }

    /// Fetch a live RRset; TTLs on the returned records are the remaining
    /// lifetime.
    pub fn get(&self, name: &Name, qtype: RecordType, now: Instant) -> Option<CacheHit> {
        let entry = self.cache.get(&Self::key(name, qtype))?;
        if now > entry.valid_until {
            return None;
        }
        let remaining = entry
            .valid_until
            .saturating_duration_since(now)
            .as_secs()
            .min(u64::from(u32::MAX)) as u32;
        let rewrite = |records: &[Record]| {
            records
                .iter()
                .map(|record| {
                    let mut record = record.clone();
                    record.set_ttl(remaining);
                    record
                })
                .collect()
        };
        Some(CacheHit {
            records: rewrite(&entry.records),
            signatures: rewrite(&entry.signatures),
            state: entry.state,
            auth: entry.auth,
            remaining_ttl: remaining,
            orig_ttl: entry.orig_ttl,
        })
    }

    /// Replace the validation state of a cached set, if present.
    pub fn update_validation_state(&self, name: &Name, qtype: RecordType, state: ValidationState) {
        let key = Self::key(name, qtype);
        if let Some(entry) = self.cache.get(&key) {
            let mut updated = (*entry).clone();
            updated.state = state;
            self.cache.insert(key, Arc::new(updated));
        }
    }

    /// Drop one RRset.
    pub fn remove(&self, name: &Name, qtype: RecordType) {
        self.cache.invalidate(&Self::key(name, qtype));
    }

    /// Approximate number of cached RRsets.
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    /// True when nothing is cached (approximate, like `len`).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

/// One negative answer: NXDOMAIN for the whole name, or NODATA for a type.
#[derive(Clone, Debug)]
pub struct NegativeEntry {
    /// The denied name.
    pub name: Name,
    /// The denied type; `None` means the whole name does not exist.
    pub qtype: Option<RecordType>,
    /// The zone whose SOA vouches for the denial.
    pub auth_zone: Name,
    /// SOA records backing the denial.
    pub soa_records: Vec<Record>,
    /// RRSIGs over the SOA set.
    pub soa_signatures: Vec<Record>,
    /// NSEC/NSEC3 proof material, with signatures.
    pub denial_records: Vec<Record>,
    /// Validation state of the denial.
    pub state: ValidationState,
}

#[derive(Clone, Debug)]
struct NegativeStored {
    entry: NegativeEntry,
    valid_until: Instant,
}

/// The negative cache.
pub struct NegativeCache {
    cache: Cache<RrKey, Arc<NegativeStored>>,
    max_ttl: u32,
}

impl NegativeCache {
    /// Create a negative cache; entry TTLs are capped at `max_ttl`.
    pub fn new(capacity: u64, max_ttl: u32) -> Self {
        Self {
            cache: Cache::builder().max_capacity(capacity).build(),
            max_ttl,
        }
    }

    fn key(name: &Name, qtype: Option<RecordType>) -> RrKey {
        // NXDOMAIN entries live under type 0, below any real type.
        let qtype = qtype.map_or(RecordType::ZERO, normalized_rtype);
        RrKey::new(LowerName::new(name), qtype)
    }

    /// Store a denial with the given TTL (already derived from the SOA).
    pub fn insert(&self, entry: NegativeEntry, ttl: u32, now: Instant) {
        let ttl = ttl.min(self.max_ttl);
        let key = Self::key(&entry.name, entry.qtype);
        self.cache.insert(
            key,
            Arc::new(NegativeStored {
                entry,
                valid_until: now + Duration::from_secs(u64::from(ttl)),
            }),
        );
    }

    /// Look up a live denial for `(name, qtype)`: a NODATA entry for the
    /// exact type, or an NXDOMAIN entry covering every type.
    pub fn get(&self, name: &Name, qtype: RecordType, now: Instant) -> Option<NegativeEntry> {
        for key in [Self::key(name, Some(qtype)), Self::key(name, None)] {
            if let Some(stored) = self.cache.get(&key) {
                if now <= stored.valid_until {
                    return Some(stored.entry.clone());
                }
            }
        }
        None
    }

    /// Approximate number of cached denials.
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    /// True when nothing is cached (approximate, like `len`).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

/// A complete answer as served to a client, cached by question fingerprint.
#[derive(Clone, Debug)]
pub struct PacketEntry {
    /// Response code served.
    pub rcode: ResponseCode,
    /// Records served.
    pub records: Vec<Record>,
    /// Validation state served.
    pub state: ValidationState,
    /// When this answer stops being servable.
    pub valid_until: Instant,
}

/// Whole-answer cache consulted by the public resolve entry before the
/// engine runs.
pub struct PacketCache {
    cache: Mutex<LruCache<u64, PacketEntry>>,
}

impl PacketCache {
    /// Create a packet cache holding up to `capacity` answers.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Hash of everything that makes an answer reusable for another client.
    pub fn fingerprint(
        qname: &Name,
        qtype: RecordType,
        qclass: DNSClass,
        dnssec_ok: bool,
        ecs: Option<&IpNet>,
    ) -> u64 {
        let mut hasher = DefaultHasher::new();
        qname.hash(&mut hasher);
        u16::from(normalized_rtype(qtype)).hash(&mut hasher);
        u16::from(qclass).hash(&mut hasher);
        dnssec_ok.hash(&mut hasher);
        ecs.hash(&mut hasher);
        hasher.finish()
    }

    /// Fetch a live cached answer.
    pub fn get(&self, fingerprint: u64, now: Instant) -> Option<PacketEntry> {
        let mut cache = self.cache.lock();
        let entry = cache.get_mut(&fingerprint)?;
        if now > entry.valid_until {
            return None;
        }
        Some(entry.clone())
    }

    /// Store an answer.
    pub fn insert(&self, fingerprint: u64, entry: PacketEntry) {
        self.cache.lock().insert(fingerprint, entry);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::rr::rdata::A;
    use crate::proto::rr::RData;

    fn name(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    fn a_record(owner: &str, ttl: u32) -> Record {
        Record::from_rdata(name(owner), ttl, RData::A(A::new(192, 0, 2, 1)))
    }

    #[test]
    fn hit_rewrites_ttl_to_remaining() {
        let now = Instant::now();
        let cache = RecordCache::new(100, 0, 86_400);
        cache.insert(
            &name("www.example.com."),
            RecordType::A,
            vec![a_record("www.example.com.", 300)],
            Vec::new(),
            true,
            ValidationState::Insecure,
            None,
            now,
        );

        let hit = cache
            .get(&name("www.example.com."), RecordType::A, now + Duration::from_secs(100))
            .unwrap();
        assert_eq!(hit.remaining_ttl, 200);
        assert_eq!(hit.records[0].ttl(), 200);
        assert_eq!(hit.orig_ttl, 300);

        assert!(cache
            .get(&name("www.example.com."), RecordType::A, now + Duration::from_secs(301))
            .is_none());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let now = Instant::now();
        let cache = RecordCache::new(100, 0, 86_400);
        cache.insert(
            &name("WWW.Example.COM."),
            RecordType::A,
            vec![a_record("WWW.Example.COM.", 300)],
            Vec::new(),
            true,
            ValidationState::Insecure,
            None,
            now,
        );
        assert!(cache.get(&name("www.example.com."), RecordType::A, now).is_some());
    }

    #[test]
    fn ttl_cap_applies() {
        let now = Instant::now();
        let cache = RecordCache::new(100, 0, 86_400);
        cache.insert(
            &name("bogus.example.com."),
            RecordType::A,
            vec![a_record("bogus.example.com.", 86_400)],
            Vec::new(),
            true,
            ValidationState::BogusNoValidRrsig,
            Some(60),
            now,
        );
        assert!(cache
            .get(&name("bogus.example.com."), RecordType::A, now + Duration::from_secs(61))
            .is_none());
    }

    #[test]
    fn almost_expired_threshold() {
        let hit = CacheHit {
            records: Vec::new(),
            signatures: Vec::new(),
            state: ValidationState::Insecure,
            auth: true,
            remaining_ttl: 20,
            orig_ttl: 300,
        };
        assert!(hit.almost_expired(10)); // 20 < 30
        assert!(!hit.almost_expired(5)); // 20 >= 15
        assert!(!hit.almost_expired(0)); // disabled
    }

    #[test]
    fn nxdomain_entry_covers_all_types() {
        let now = Instant::now();
        let cache = NegativeCache::new(100, 3600);
        cache.insert(
            NegativeEntry {
                name: name("missing.example.com."),
                qtype: None,
                auth_zone: name("example.com."),
                soa_records: Vec::new(),
                soa_signatures: Vec::new(),
                denial_records: Vec::new(),
                state: ValidationState::Insecure,
            },
            300,
            now,
        );

        assert!(cache
            .get(&name("missing.example.com."), RecordType::A, now)
            .is_some());
        assert!(cache
            .get(&name("missing.example.com."), RecordType::AAAA, now)
            .is_some());
        assert!(cache
            .get(&name("missing.example.com."), RecordType::A, now + Duration::from_secs(301))
            .is_none());
    }

    #[test]
    fn nodata_entry_is_type_specific() {
        let now = Instant::now();
        let cache = NegativeCache::new(100, 3600);
        cache.insert(
            NegativeEntry {
                name: name("www.example.com."),
                qtype: Some(RecordType::AAAA),
                auth_zone: name("example.com."),
                soa_records: Vec::new(),
                soa_signatures: Vec::new(),
                denial_records: Vec::new(),
                state: ValidationState::Insecure,
            },
            300,
            now,
        );

        assert!(cache
            .get(&name("www.example.com."), RecordType::AAAA, now)
            .is_some());
        assert!(cache.get(&name("www.example.com."), RecordType::A, now).is_none());
    }

    #[test]
    fn packet_cache_roundtrip() {
        let now = Instant::now();
        let cache = PacketCache::new(10);
        let fp = PacketCache::fingerprint(
            &name("example.com."),
            RecordType::A,
            DNSClass::IN,
            false,
            None,
        );
        cache.insert(
            fp,
            PacketEntry {
                rcode: ResponseCode::NoError,
                records: vec![a_record("example.com.", 300)],
                state: ValidationState::Insecure,
                valid_until: now + Duration::from_secs(60),
            },
        );

        assert!(cache.get(fp, now).is_some());
        assert!(cache.get(fp, now + Duration::from_secs(61)).is_none());

        let other = PacketCache::fingerprint(
            &name("example.com."),
            RecordType::A,
            DNSClass::IN,
            true,
            None,
        );
        assert_ne!(fp, other);
        assert!(cache.get(other, now).is_none());
    }
}
