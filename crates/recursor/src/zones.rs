//! Locally served and statically forwarded zones.
//!
//! A zone is either authoritative (records loaded into an ordered index,
//! answered out-of-band without touching the network) or a forward zone (a
//! list of servers that all queries under the zone go to directly). Zone
//! maps are immutable snapshots; a reload installs a whole new map.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use crate::normalized_rtype;
use crate::proto::op::ResponseCode;
use crate::proto::rr::{LowerName, Name, Record, RecordType, RrKey};

/// One locally configured zone.
#[derive(Clone, Debug)]
pub struct AuthZone {
    name: Name,
    records: BTreeMap<RrKey, Vec<Record>>,
    servers: Vec<IpAddr>,
    rd_forward: bool,
}

impl AuthZone {
    /// An authoritative zone with no records yet.
    pub fn new(name: Name) -> Self {
        Self {
            name,
            records: BTreeMap::new(),
            servers: Vec::new(),
            rd_forward: false,
        }
    }

    /// A forward zone: queries below `name` go straight to `servers`.
    /// `rd_forward` controls whether the upstream is asked to recurse.
    pub fn forward(name: Name, servers: Vec<IpAddr>, rd_forward: bool) -> Self {
        Self {
            name,
            records: BTreeMap::new(),
            servers,
            rd_forward,
        }
    }

    /// Add one record to an authoritative zone.
    pub fn add_record(&mut self, record: Record) {
        let key = RrKey::new(
            LowerName::new(record.name()),
            normalized_rtype(record.record_type()),
        );
        self.records.entry(key).or_default().push(record);
    }

    /// Zone apex.
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// True when this zone is served from local records.
    pub fn is_auth(&self) -> bool {
        self.servers.is_empty()
    }

    /// True when this zone forwards to configured servers.
    pub fn is_forward(&self) -> bool {
        !self.is_auth()
    }

    /// Whether forwarded queries carry the RD bit.
    pub fn should_recurse(&self) -> bool {
        self.rd_forward
    }

    /// Forward servers for this zone.
    pub fn servers(&self) -> &[IpAddr] {
        &self.servers
    }

    fn add_soa(&self, records: &mut Vec<Record>) {
        let key = RrKey::new(LowerName::new(&self.name), RecordType::SOA);
        if let Some(soa) = self.records.get(&key) {
            records.extend(soa.iter().cloned());
        }
    }

    /// Look up `(qname, qtype)` in the zone.
    ///
    /// Returns the rcode together with the matching records: exact matches,
    /// every type at the owner for `ANY`, a CNAME at the owner as fallback,
    /// and otherwise the zone SOA with NOERROR (NODATA) when the name exists
    /// or has records below it, NXDOMAIN when it does not.
    pub fn get_records(&self, qname: &Name, qtype: RecordType) -> (ResponseCode, Vec<Record>) {
        let owner = LowerName::new(qname);
        let qtype = normalized_rtype(qtype);
        let mut out = Vec::new();

        if qtype == RecordType::ANY {
            for (key, records) in &self.records {
                if key.name == owner {
                    out.extend(records.iter().cloned());
                }
            }
        } else if let Some(records) = self.records.get(&RrKey::new(owner.clone(), qtype)) {
            out.extend(records.iter().cloned());
        }

        if out.is_empty() && qtype != RecordType::CNAME && qtype != RecordType::ANY {
            if let Some(records) = self.records.get(&RrKey::new(owner.clone(), RecordType::CNAME)) {
                out.extend(records.iter().cloned());
            }
        }

        if !out.is_empty() {
            return (ResponseCode::NoError, out);
        }

        // Nothing at the owner. The name still "exists" if it is the apex or
        // anything lives at or below it; then the answer is NODATA.
        let exists = owner == LowerName::new(&self.name)
            || self
                .records
                .keys()
                .any(|key| key.name == owner || owner.zone_of(&key.name));
        let rcode = if exists {
            ResponseCode::NoError
        } else {
            ResponseCode::NXDomain
        };
        self.add_soa(&mut out);
        (rcode, out)
    }
}

/// Immutable snapshot of all locally configured zones, apex name to zone.
pub type DomainMap = HashMap<Name, AuthZone>;

/// Longest-suffix zone lookup: walk from `qname` towards the root and return
/// the deepest configured zone covering it.
pub fn best_auth_zone<'a>(map: &'a Arc<DomainMap>, qname: &Name) -> Option<&'a AuthZone> {
    let mut name = qname.clone();
    loop {
        if let Some(zone) = map.get(&name) {
            return Some(zone);
        }
        if name.is_root() {
            return None;
        }
        name = name.base_name();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::rr::rdata::{A, CNAME, SOA};
    use crate::proto::rr::RData;

    fn name(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    fn test_zone() -> AuthZone {
        let apex = name("example.com.");
        let mut zone = AuthZone::new(apex.clone());
        zone.add_record(Record::from_rdata(
            apex.clone(),
            3600,
            RData::SOA(SOA::new(
                name("ns1.example.com."),
                name("hostmaster.example.com."),
                2024010101,
                7200,
                3600,
                1209600,
                300,
            )),
        ));
        zone.add_record(Record::from_rdata(
            name("www.example.com."),
            300,
            RData::A(A::new(192, 0, 2, 10)),
        ));
        zone.add_record(Record::from_rdata(
            name("alias.example.com."),
            300,
            RData::CNAME(CNAME(name("www.example.com."))),
        ));
        zone
    }

    #[test]
    fn exact_match() {
        let zone = test_zone();
        let (rcode, records) = zone.get_records(&name("www.example.com."), RecordType::A);
        assert_eq!(rcode, ResponseCode::NoError);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type(), RecordType::A);
    }

    #[test]
    fn any_returns_all_types_at_owner() {
        let zone = test_zone();
        let (rcode, records) = zone.get_records(&name("example.com."), RecordType::ANY);
        assert_eq!(rcode, ResponseCode::NoError);
        assert_eq!(records.len(), 1); // just the SOA at the apex
    }

    #[test]
    fn cname_fallback_at_owner() {
        let zone = test_zone();
        let (rcode, records) = zone.get_records(&name("alias.example.com."), RecordType::A);
        assert_eq!(rcode, ResponseCode::NoError);
        assert_eq!(records[0].record_type(), RecordType::CNAME);
    }

    #[test]
    fn nodata_for_existing_name_missing_type() {
        let zone = test_zone();
        let (rcode, records) = zone.get_records(&name("www.example.com."), RecordType::AAAA);
        assert_eq!(rcode, ResponseCode::NoError);
        // SOA synthesized for the negative answer
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type(), RecordType::SOA);
    }

    #[test]
    fn nxdomain_for_unknown_name() {
        let zone = test_zone();
        let (rcode, records) = zone.get_records(&name("missing.example.com."), RecordType::A);
        assert_eq!(rcode, ResponseCode::NXDomain);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type(), RecordType::SOA);
    }

    #[test]
    fn empty_non_terminal_is_nodata() {
        let mut zone = test_zone();
        zone.add_record(Record::from_rdata(
            name("host.sub.example.com."),
            300,
            RData::A(A::new(192, 0, 2, 20)),
        ));
        let (rcode, _) = zone.get_records(&name("sub.example.com."), RecordType::A);
        assert_eq!(rcode, ResponseCode::NoError);
    }

    #[test]
    fn forward_zone_flags() {
        let servers = vec!["192.0.2.1".parse().unwrap()];
        let zone = AuthZone::forward(name("corp.example."), servers, true);
        assert!(zone.is_forward());
        assert!(!zone.is_auth());
        assert!(zone.should_recurse());
        assert_eq!(zone.servers().len(), 1);

        let auth = AuthZone::new(name("static.example."));
        assert!(auth.is_auth());
        assert!(!auth.should_recurse());
    }

    #[test]
    fn best_zone_is_longest_suffix() {
        let mut map = DomainMap::new();
        map.insert(name("example.com."), AuthZone::new(name("example.com.")));
        map.insert(
            name("sub.example.com."),
            AuthZone::new(name("sub.example.com.")),
        );
        let map = Arc::new(map);

        let zone = best_auth_zone(&map, &name("deep.sub.example.com.")).unwrap();
        assert_eq!(zone.name(), &name("sub.example.com."));

        let zone = best_auth_zone(&map, &name("www.example.com.")).unwrap();
        assert_eq!(zone.name(), &name("example.com."));

        assert!(best_auth_zone(&map, &name("example.org.")).is_none());
    }
}
