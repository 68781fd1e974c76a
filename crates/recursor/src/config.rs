//! Configuration surface consumed by the resolver core.
//!
//! Everything here is read once at startup and shared as an immutable
//! `Arc<RecursorConfig>`; the core never reconfigures itself at runtime.

use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;

use crate::proto::rr::Name;

/// How much DNSSEC work the resolver performs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DnssecMode {
    /// No DNSSEC processing at all; every answer is `Indeterminate`.
    Off,
    /// Fetch and track DNSSEC state, but Bogus answers are still returned.
    #[default]
    Process,
    /// Like `Process`, and log validation failures, but do not fail them.
    LogFail,
    /// Bogus answers become SERVFAIL.
    Validate,
}

/// What to do with an NXDOMAIN seen at a QName-minimization step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HardenNxd {
    /// Never conclude from an intermediate NXDOMAIN; always retry the full name.
    No,
    /// Conclude only when the NXDOMAIN was DNSSEC validated.
    #[default]
    Dnssec,
    /// Always conclude NXDOMAIN for the whole query.
    Yes,
}

/// All numeric limits and toggles of the resolver core.
///
/// Defaults follow long-standing recursive resolver practice; every field can
/// be overridden from deserialized configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RecursorConfig {
    /// Identity reported for `id.server.`/`version.bind.` CHAOS queries.
    pub server_id: String,

    /// Floor applied to upstream TTLs before caching.
    pub minimum_ttl: u32,
    /// Cap applied to upstream TTLs before caching.
    pub max_cache_ttl: u32,
    /// Cap for negative (NXDOMAIN/NODATA) entries.
    pub max_negative_ttl: u32,
    /// Cap for records that failed validation; Bogus data must age out fast.
    pub max_bogus_ttl: u32,
    /// Cap for entries in the whole-answer packet cache.
    pub packet_cache_ttl: u32,
    /// Packet-cache lifetime for SERVFAIL outcomes.
    pub packet_cache_servfail_ttl: u32,

    /// Outgoing queries allowed for a single client question.
    pub max_queries_per_query: u32,
    /// Sub-queries allowed for resolving name-server addresses per question.
    pub max_ns_address_queries_per_query: u32,
    /// Total microseconds of upstream time allowed per question.
    pub max_total_micros: u64,
    /// Recursion depth ceiling.
    pub max_depth: u32,
    /// CNAME indirections followed before giving up.
    pub max_cname_chain: u32,
    /// QName-minimization steps attempted before asking the full name.
    pub max_qmin_iterations: u32,

    /// Consecutive failures before a server is throttled wholesale.
    pub server_down_max_fails: u64,
    /// How long a failed-out server stays throttled.
    pub server_down_throttle_time: Duration,
    /// Address-resolution failures before an NS name is considered non-resolving.
    pub non_resolving_ns_max_fails: u64,
    /// How long the non-resolving verdict lasts.
    pub non_resolving_ns_throttle_time: Duration,

    /// Push a background refresh when a cache hit has less than this percent
    /// of its original TTL left. Zero disables refreshing.
    pub refresh_ttl_percent: u32,

    /// Ask for one label at a time while walking unknown delegations.
    pub qname_minimization: bool,
    /// NXDOMAIN handling at minimized labels.
    pub harden_nxdomain: HardenNxd,
    /// DNSSEC processing mode.
    pub dnssec_mode: DnssecMode,

    /// Talk to IPv4 name servers.
    pub do_ipv4: bool,
    /// Talk to IPv6 name servers.
    pub do_ipv6: bool,
    /// Networks never to send queries to.
    pub dont_query: Vec<IpNet>,
    /// Name servers (by name) exempt from throttling.
    pub dont_throttle_names: Vec<Name>,
    /// Networks exempt from throttling.
    pub dont_throttle_netmasks: Vec<IpNet>,

    /// Zones for which an EDNS Client Subnet option may be sent upstream.
    pub edns_subnet_allowlist: Vec<Name>,
    /// Source prefix advertised in outgoing ECS options.
    pub ecs_source: Option<IpNet>,

    /// Entries kept before the positive record cache starts evicting.
    pub record_cache_capacity: u64,
    /// Entries kept before the negative cache starts evicting.
    pub negative_cache_capacity: u64,
    /// Entries kept in the whole-answer packet cache.
    pub packet_cache_capacity: usize,

    /// Root name servers used to seed the cache; (server name, address) pairs.
    pub root_hints: Vec<(Name, IpAddr)>,
}

impl Default for RecursorConfig {
    fn default() -> Self {
        Self {
            server_id: String::from("tamarack"),
            minimum_ttl: 0,
            max_cache_ttl: 86_400,
            max_negative_ttl: 3_600,
            max_bogus_ttl: 3_600,
            packet_cache_ttl: 3_600,
            packet_cache_servfail_ttl: 60,
            max_queries_per_query: 60,
            max_ns_address_queries_per_query: 10,
            max_total_micros: 7_000_000,
            max_depth: 40,
            max_cname_chain: 10,
            max_qmin_iterations: 10,
            server_down_max_fails: 64,
            server_down_throttle_time: Duration::from_secs(60),
            non_resolving_ns_max_fails: 5,
            non_resolving_ns_throttle_time: Duration::from_secs(60),
            refresh_ttl_percent: 0,
            qname_minimization: true,
            harden_nxdomain: HardenNxd::default(),
            dnssec_mode: DnssecMode::default(),
            do_ipv4: true,
            do_ipv6: true,
            dont_query: default_dont_query(),
            dont_throttle_names: Vec::new(),
            dont_throttle_netmasks: Vec::new(),
            edns_subnet_allowlist: Vec::new(),
            ecs_source: None,
            record_cache_capacity: 1_000_000,
            negative_cache_capacity: 250_000,
            packet_cache_capacity: 100_000,
            root_hints: default_root_hints(),
        }
    }
}

impl RecursorConfig {
    /// True if `addr` falls inside the don't-query list.
    pub fn dont_query_matches(&self, addr: IpAddr) -> bool {
        self.dont_query.iter().any(|net| net.contains(&addr))
    }

    /// True if throttling must never be applied to this server.
    pub fn dont_throttle_matches(&self, addr: IpAddr, ns_name: &Name) -> bool {
        self.dont_throttle_netmasks
            .iter()
            .any(|net| net.contains(&addr))
            || self
                .dont_throttle_names
                .iter()
                .any(|name| name.zone_of(ns_name))
    }

    /// True if an ECS option may be attached to queries for `qname`.
    pub fn ecs_allowed_for(&self, qname: &Name) -> bool {
        self.ecs_source.is_some()
            && self
                .edns_subnet_allowlist
                .iter()
                .any(|zone| zone.zone_of(qname))
    }
}

/// Addresses a resolver must never query: loopback, RFC 1918, link-local,
/// and the documentation and benchmark nets.
fn default_dont_query() -> Vec<IpNet> {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "100.64.0.0/10",
        "169.254.0.0/16",
        "192.168.0.0/16",
        "172.16.0.0/12",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
        "0.0.0.0/8",
        "192.0.0.0/24",
        "192.0.2.0/24",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "240.0.0.0/4",
        "::/96",
        "::ffff:0:0/96",
        "100::/64",
        "2001:db8::/32",
    ]
    .iter()
    .map(|mask| mask.parse().expect("hardcoded netmask"))
    .collect()
}

fn default_root_hints() -> Vec<(Name, IpAddr)> {
    [
        ("a.root-servers.net.", "198.41.0.4"),
        ("b.root-servers.net.", "170.247.170.2"),
        ("c.root-servers.net.", "192.33.4.12"),
        ("d.root-servers.net.", "199.7.91.13"),
        ("e.root-servers.net.", "192.203.230.10"),
        ("f.root-servers.net.", "192.5.5.241"),
        ("g.root-servers.net.", "192.112.36.4"),
        ("h.root-servers.net.", "198.97.190.53"),
        ("i.root-servers.net.", "192.36.148.17"),
        ("j.root-servers.net.", "192.58.128.30"),
        ("k.root-servers.net.", "193.0.14.129"),
        ("l.root-servers.net.", "199.7.83.42"),
        ("m.root-servers.net.", "202.12.27.33"),
    ]
    .iter()
    .map(|(name, addr)| {
        (
            Name::from_ascii(name).expect("hardcoded root server name"),
            addr.parse().expect("hardcoded root server address"),
        )
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RecursorConfig::default();
        assert!(config.qname_minimization);
        assert_eq!(config.dnssec_mode, DnssecMode::Process);
        assert_eq!(config.root_hints.len(), 13);
        assert!(config.dont_query_matches("127.0.0.1".parse().unwrap()));
        assert!(config.dont_query_matches("192.0.2.53".parse().unwrap()));
        assert!(!config.dont_query_matches("198.41.0.4".parse().unwrap()));
    }

    #[test]
    fn dont_throttle_matches_names_and_masks() {
        let config = RecursorConfig {
            dont_throttle_names: vec![Name::from_ascii("example.com.").unwrap()],
            dont_throttle_netmasks: vec!["192.0.2.0/24".parse().unwrap()],
            ..RecursorConfig::default()
        };
        let ns = Name::from_ascii("ns1.example.com.").unwrap();
        assert!(config.dont_throttle_matches("203.0.113.1".parse().unwrap(), &ns));
        assert!(config.dont_throttle_matches(
            "192.0.2.9".parse().unwrap(),
            &Name::from_ascii("ns.example.org.").unwrap()
        ));
        assert!(!config.dont_throttle_matches(
            "203.0.113.1".parse().unwrap(),
            &Name::from_ascii("ns.example.org.").unwrap()
        ));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: RecursorConfig =
            serde_json::from_str(r#"{"max-depth": 12, "qname-minimization": false}"#).unwrap();
        assert_eq!(config.max_depth, 12);
        assert!(!config.qname_minimization);
        assert_eq!(config.max_queries_per_query, 60);
    }
}
