//! The iterative resolution engine.
//!
//! One [`Resolver`] instance answers one question. It consults the caches,
//! computes the best known delegation, asks candidate servers in decaying
//! speed order through the injected transport, processes referrals, chases
//! CNAMEs, tracks DNSSEC state across zone cuts, and gives up cleanly when a
//! budget runs out. It suspends only inside the transport call.

mod answer;
mod dnssec;
mod ns;

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_recursion::async_recursion;
use tracing::{debug, trace, warn};

use crate::cache::{CacheHit, NegativeCache, RecordCache};
use crate::config::{DnssecMode, HardenNxd, RecursorConfig};
use crate::error::{Error, ErrorKind};
use crate::is_unsupported_qtype;
use crate::normalized_rtype;
use crate::proto::op::ResponseCode;
use crate::proto::rr::rdata::{A, AAAA, NS, PTR, SOA, TXT};
use crate::proto::rr::{DNSClass, Name, RData, Record, RecordType};
use crate::state::{ProcessCounters, SharedState, WorkerState};
use crate::transport::AskTransport;
use crate::validate::{update_validation_state, DnssecVerifier, ValidationState};
use crate::zones::{best_auth_zone, AuthZone};

pub(crate) use answer::ProcessedAnswer;

/// Candidate servers for one delegation level: NS name to what we know about
/// reaching it. Forward zones put their configured addresses here directly;
/// referral entries start empty and resolve through the cache.
pub type NsSet = HashMap<Name, NsSetEntry>;

/// What is known about one candidate name server.
#[derive(Clone, Debug, Default)]
pub struct NsSetEntry {
    /// Addresses configured or gleaned for this server; empty means resolve
    /// the name.
    pub addresses: Vec<IpAddr>,
    /// Ask this server to recurse (forward zones only).
    pub recursion_desired: bool,
}

/// One visited step of the delegation walk; revisiting the same triple means
/// the delegations form a loop.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct BeenThere {
    pub(crate) qname: Name,
    pub(crate) best_ns: BTreeSet<Name>,
    pub(crate) qtype: u16,
}

pub(crate) type BeenThereSet = BTreeSet<BeenThere>;

/// Whether an iteration should stop as soon as it reaches a delegation
/// point, used by QName-minimization probes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopAtDelegation {
    Stop,
    Stopped,
}

/// What one question cost in upstream attempts.
#[derive(Clone, Copy, Debug, Default)]
pub struct AttemptStats {
    /// Outgoing queries sent.
    pub outqueries: u32,
    /// Outgoing queries sent over TCP.
    pub tcpoutqueries: u32,
    /// Candidates skipped because they were throttled.
    pub throttled_queries: u32,
    /// Candidates skipped by the don't-query list.
    pub dont_queries: u32,
    /// Attempts that timed out.
    pub timeouts: u32,
    /// Attempts that failed at the network layer.
    pub unreachables: u32,
    /// Lookups served from locally loaded zones.
    pub auth_zone_queries: u32,
    /// Sub-queries spent resolving name-server addresses.
    pub ns_address_queries: u32,
    /// Total microseconds spent waiting on upstreams.
    pub total_micros: u64,
}

/// A single-question resolver instance.
///
/// Borrows the worker's per-thread maps for the duration of the question and
/// carries the per-question budgets and validation state.
pub struct Resolver<'w> {
    pub(crate) config: Arc<RecursorConfig>,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) worker: &'w mut WorkerState,
    pub(crate) record_cache: Arc<RecordCache>,
    pub(crate) negative_cache: Arc<NegativeCache>,
    pub(crate) transport: Arc<dyn AskTransport>,
    pub(crate) verifier: Arc<dyn DnssecVerifier>,
    pub(crate) counters: Arc<ProcessCounters>,
    pub(crate) now: Instant,
    pub(crate) wall_now: SystemTime,

    refresh_mode: bool,
    cache_only: bool,
    qname_minimization: bool,
    pub(crate) require_auth_data: bool,

    // per-question accounting
    pub(crate) outqueries: u32,
    pub(crate) tcpoutqueries: u32,
    pub(crate) throttled_queries: u32,
    pub(crate) dont_queries: u32,
    pub(crate) timeouts: u32,
    pub(crate) unreachables: u32,
    pub(crate) auth_zone_queries: u32,
    pub(crate) ns_address_queries: u32,
    pub(crate) tot_usec: u64,
    cname_follows: u32,

    pub(crate) cut_states: HashMap<Name, ValidationState>,
    validation_state: ValidationState,
    was_out_of_band: bool,
}

impl<'w> Resolver<'w> {
    /// Build a resolver instance for one question.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RecursorConfig>,
        shared: Arc<SharedState>,
        worker: &'w mut WorkerState,
        record_cache: Arc<RecordCache>,
        negative_cache: Arc<NegativeCache>,
        transport: Arc<dyn AskTransport>,
        verifier: Arc<dyn DnssecVerifier>,
        counters: Arc<ProcessCounters>,
        now: Instant,
    ) -> Self {
        let qname_minimization = config.qname_minimization;
        Self {
            config,
            shared,
            worker,
            record_cache,
            negative_cache,
            transport,
            verifier,
            counters,
            now,
            wall_now: SystemTime::now(),
            refresh_mode: false,
            cache_only: false,
            qname_minimization,
            require_auth_data: true,
            outqueries: 0,
            tcpoutqueries: 0,
            throttled_queries: 0,
            dont_queries: 0,
            timeouts: 0,
            unreachables: 0,
            auth_zone_queries: 0,
            ns_address_queries: 0,
            tot_usec: 0,
            cname_follows: 0,
            cut_states: HashMap::new(),
            validation_state: ValidationState::Indeterminate,
            was_out_of_band: false,
        }
    }

    /// Mark this instance as a background refresh run; refresh runs never
    /// queue further refreshes.
    pub fn set_refresh_mode(&mut self, refresh: bool) {
        self.refresh_mode = refresh;
    }

    /// Only consult the caches; never contact a server.
    pub fn set_cache_only(&mut self, cache_only: bool) {
        self.cache_only = cache_only;
    }

    /// Override the configured QName-minimization toggle for this question.
    pub fn set_qname_minimization(&mut self, minimize: bool) {
        self.qname_minimization = minimize;
    }

    /// Validation state after `begin_resolve` returned.
    pub fn validation_state(&self) -> ValidationState {
        self.validation_state
    }

    /// True when the answer came from a locally loaded zone.
    pub fn was_out_of_band(&self) -> bool {
        self.was_out_of_band
    }

    /// Outgoing queries spent on the last question.
    pub fn outgoing_queries(&self) -> u32 {
        self.outqueries
    }

    /// Upstream microseconds spent on the last question.
    pub fn total_micros(&self) -> u64 {
        self.tot_usec
    }

    /// Everything this question cost, for the host's statistics.
    pub fn attempt_stats(&self) -> AttemptStats {
        AttemptStats {
            outqueries: self.outqueries,
            tcpoutqueries: self.tcpoutqueries,
            throttled_queries: self.throttled_queries,
            dont_queries: self.dont_queries,
            timeouts: self.timeouts,
            unreachables: self.unreachables,
            auth_zone_queries: self.auth_zone_queries,
            ns_address_queries: self.ns_address_queries,
            total_micros: self.tot_usec,
        }
    }

    /// Resolve `(qname, qtype, qclass)`, appending the answer records to
    /// `ret` and returning the rcode. The post-call validation state is
    /// available from [`Resolver::validation_state`].
    pub async fn begin_resolve(
        &mut self,
        qname: &Name,
        qtype: RecordType,
        qclass: DNSClass,
        ret: &mut Vec<Record>,
        depth: u32,
    ) -> Result<ResponseCode, Error> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        if is_unsupported_qtype(qtype) {
            return Err(ErrorKind::UnsupportedQtype(qtype).into());
        }

        if let Some(rcode) = self.special_names_resolve(qname, qtype, qclass, ret)? {
            return Ok(rcode);
        }
        if qclass != DNSClass::IN {
            return Ok(ResponseCode::ServFail);
        }

        let mut beenthere = BeenThereSet::new();
        let mut state = ValidationState::Indeterminate;
        let mut rcode = self
            .do_resolve(qname, qtype, ret, depth, &mut beenthere, &mut state)
            .await?;

        if self.should_validate() && state.is_bogus() {
            match self.config.dnssec_mode {
                DnssecMode::Validate => {
                    warn!(%qname, %qtype, %state, "validation failed, answering SERVFAIL");
                    ret.clear();
                    rcode = ResponseCode::ServFail;
                }
                DnssecMode::LogFail => {
                    warn!(%qname, %qtype, %state, "validation failed");
                }
                _ => {}
            }
        }
        self.validation_state = state;
        Ok(rcode)
    }

    /// QName-minimization wrapper around the iteration: walk the unknown part
    /// of the delegation chain one label at a time with NS probes, then ask
    /// the full question.
    #[async_recursion]
    pub(crate) async fn do_resolve(
        &mut self,
        qname: &Name,
        qtype: RecordType,
        ret: &mut Vec<Record>,
        depth: u32,
        beenthere: &mut BeenThereSet,
        state: &mut ValidationState,
    ) -> Result<ResponseCode, Error> {
        if !self.qname_minimization || self.is_forward_or_auth(qname) {
            return self
                .do_resolve_no_qname_minimization(qname, qtype, ret, depth, beenthere, state, true, None)
                .await;
        }

        let mut child = self.deepest_cached_cut(qname);
        let mut iterations = 0;
        let mut fall_back = false;
        while child != *qname {
            iterations += 1;
            if iterations > self.config.max_qmin_iterations {
                debug!(%qname, "giving up on minimization, asking the full name");
                break;
            }
            child = qname.trim_to(child.num_labels() as usize + 1);
            if child == *qname {
                break; // the full name gets asked below, with the real type
            }

            trace!(%child, %qname, "minimized NS probe");
            let mut scratch = Vec::new();
            let mut stop = StopAtDelegation::Stop;
            let mut child_state = ValidationState::Indeterminate;
            let res = self
                .do_resolve_no_qname_minimization(
                    &child,
                    RecordType::NS,
                    &mut scratch,
                    depth + 1,
                    beenthere,
                    &mut child_state,
                    false,
                    Some(&mut stop),
                )
                .await;
            match res {
                Ok(ResponseCode::NoError) => {}
                Ok(ResponseCode::NXDomain) => {
                    let conclude = match self.config.harden_nxdomain {
                        HardenNxd::Yes => true,
                        HardenNxd::Dnssec => child_state == ValidationState::Secure,
                        HardenNxd::No => false,
                    };
                    if conclude {
                        update_validation_state(state, child_state);
                        return Ok(ResponseCode::NXDomain);
                    }
                    fall_back = true;
                    break;
                }
                Ok(_) => {
                    fall_back = true;
                    break;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(%child, error = %e, "minimized probe failed, retrying with the full name");
                    fall_back = true;
                    break;
                }
            }
        }

        let rcode = self
            .do_resolve_no_qname_minimization(qname, qtype, ret, depth, beenthere, state, true, None)
            .await?;
        if fall_back && rcode == ResponseCode::NoError {
            self.counters
                .qname_min_fallback_success
                .fetch_add(1, Ordering::Relaxed);
        }
        Ok(rcode)
    }

    /// One full iteration for a question: local zones, caches, then the
    /// delegation walk.
    #[async_recursion]
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn do_resolve_no_qname_minimization(
        &mut self,
        qname: &Name,
        qtype: RecordType,
        ret: &mut Vec<Record>,
        depth: u32,
        beenthere: &mut BeenThereSet,
        state: &mut ValidationState,
        consider_forwards: bool,
        stop_at_delegation: Option<&mut StopAtDelegation>,
    ) -> Result<ResponseCode, Error> {
        Error::recursion_exceeded(self.config.max_depth, depth, qname)?;
        trace!(%qname, %qtype, depth, "resolving");

        let mut nameservers = NsSet::new();
        let mut auth = Name::root();
        let mut was_forwarded = false;
        let mut send_rd = false;

        if consider_forwards {
            if let Some(map) = self.worker.domain_map.clone() {
                if let Some(zone) = best_auth_zone(&map, qname) {
                    if zone.is_auth() {
                        return self.oob_resolve(zone, qname, qtype, ret);
                    }
                    was_forwarded = true;
                    send_rd = zone.should_recurse();
                    auth = zone.name().clone();
                    nameservers.insert(
                        zone.name().clone(),
                        NsSetEntry {
                            addresses: zone.servers().to_vec(),
                            recursion_desired: send_rd,
                        },
                    );
                }
            }
        }

        if let Some(rcode) = self
            .cname_cache_check(qname, qtype, ret, depth, state)
            .await?
        {
            return Ok(rcode);
        }
        if let Some(rcode) = self.cache_check(qname, qtype, ret, state) {
            return Ok(rcode);
        }
        if self.cache_only {
            return Ok(ResponseCode::ServFail);
        }

        if !was_forwarded {
            auth = self.get_best_ns_names_from_cache(qname, qtype, &mut nameservers, beenthere)?;
        }

        self.do_resolve_at(
            nameservers,
            auth,
            qname,
            qtype,
            ret,
            depth,
            beenthere,
            state,
            was_forwarded,
            send_rd,
            stop_at_delegation,
        )
        .await
    }

    /// Serve a cached CNAME for `qname` and chase it.
    async fn cname_cache_check(
        &mut self,
        qname: &Name,
        qtype: RecordType,
        ret: &mut Vec<Record>,
        depth: u32,
        state: &mut ValidationState,
    ) -> Result<Option<ResponseCode>, Error> {
        if qtype == RecordType::ANY {
            return Ok(None);
        }
        let Some(hit) = self.record_cache.get(qname, RecordType::CNAME, self.now) else {
            return Ok(None);
        };
        if !hit.auth && self.require_auth_data {
            return Ok(None);
        }
        trace!(%qname, "cached CNAME");
        update_validation_state(state, hit.state);
        self.maybe_push_refresh(qname, RecordType::CNAME, &hit);

        let target = hit.records.iter().find_map(|record| {
            record
                .data()
                .as_cname()
                .map(|cname| cname.0.clone())
        });
        ret.extend(hit.records);
        if qtype == RecordType::CNAME {
            return Ok(Some(ResponseCode::NoError));
        }
        let Some(target) = target else {
            return Ok(Some(ResponseCode::NoError));
        };
        let rcode = self
            .handle_new_target(qname, &target, qtype, ret, depth, state)
            .await?;
        Ok(Some(rcode))
    }

    /// Serve `(qname, qtype)` from the negative or positive cache.
    fn cache_check(
        &mut self,
        qname: &Name,
        qtype: RecordType,
        ret: &mut Vec<Record>,
        state: &mut ValidationState,
    ) -> Option<ResponseCode> {
        if let Some(neg) = self.negative_cache.get(qname, qtype, self.now) {
            debug!(%qname, %qtype, state = %neg.state, "negative cache hit");
            update_validation_state(state, neg.state);
            let rcode = if neg.qtype.is_none() {
                ResponseCode::NXDomain
            } else {
                ResponseCode::NoError
            };
            return Some(rcode);
        }

        let hit = self.record_cache.get(qname, qtype, self.now)?;
        if !hit.auth && self.require_auth_data {
            return None;
        }
        trace!(%qname, %qtype, "positive cache hit");
        update_validation_state(state, hit.state);
        self.maybe_push_refresh(qname, qtype, &hit);
        ret.extend(hit.records);
        Some(ResponseCode::NoError)
    }

    /// Queue a background refresh when a hit is close to expiry.
    fn maybe_push_refresh(&self, qname: &Name, qtype: RecordType, hit: &CacheHit) {
        if self.refresh_mode || !hit.almost_expired(self.config.refresh_ttl_percent) {
            return;
        }
        let Some(runner) = self.shared.background_runner() else {
            return;
        };
        let deadline = self.wall_now + Duration::from_secs(60);
        self.shared
            .task_queue
            .push_almost_expired_task(qname.clone(), qtype, deadline, runner);
    }

    /// Serve a question from a locally loaded authoritative zone.
    fn oob_resolve(
        &mut self,
        zone: &AuthZone,
        qname: &Name,
        qtype: RecordType,
        ret: &mut Vec<Record>,
    ) -> Result<ResponseCode, Error> {
        debug!(%qname, %qtype, zone = %zone.name(), "serving from auth zone");
        self.auth_zone_queries += 1;
        self.counters.auth_zone_queries.fetch_add(1, Ordering::Relaxed);
        self.was_out_of_band = true;
        let (rcode, records) = zone.get_records(qname, qtype);
        ret.extend(records);
        Ok(rcode)
    }

    /// The delegation walk: rank candidates, transmit, process, descend.
    #[async_recursion]
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn do_resolve_at(
        &mut self,
        mut nameservers: NsSet,
        mut auth: Name,
        qname: &Name,
        qtype: RecordType,
        ret: &mut Vec<Record>,
        depth: u32,
        beenthere: &mut BeenThereSet,
        state: &mut ValidationState,
        was_forwarded: bool,
        send_rd: bool,
        mut stop_at_delegation: Option<&mut StopAtDelegation>,
    ) -> Result<ResponseCode, Error> {
        'level: loop {
            let ranked = self.shuffle_in_speed_order(&nameservers);
            if ranked.is_empty() {
                warn!(%qname, %auth, "no usable name servers");
                return Ok(ResponseCode::ServFail);
            }

            for (ns_name, _speed) in &ranked {
                let entry = nameservers.get(ns_name).cloned().unwrap_or_default();

                let (addresses, pierce_dont_query) = if !entry.addresses.is_empty() {
                    (
                        self.sort_addresses_by_speed(ns_name, entry.addresses),
                        true,
                    )
                } else {
                    if self.shared.non_resolving.lock().value(ns_name)
                        >= self.config.non_resolving_ns_max_fails
                    {
                        debug!(%ns_name, "skipping non-resolving name server");
                        continue;
                    }
                    let addrs = self.get_addrs(ns_name, depth + 2, beenthere).await?;
                    if addrs.is_empty() {
                        let count = self
                            .shared
                            .non_resolving
                            .lock()
                            .incr(ns_name.clone(), self.now);
                        debug!(%ns_name, count, "no address for name server");
                        continue;
                    }
                    self.shared.non_resolving.lock().clear_key(ns_name);
                    (self.sort_addresses_by_speed(ns_name, addrs), false)
                };

                for remote in addresses {
                    if self.throttled_or_blocked(remote, qname, qtype, pierce_dont_query) {
                        continue;
                    }

                    let reply = self
                        .do_resolve_at_this_ip(ns_name, remote, qname, qtype, send_rd, false)
                        .await?;
                    let Some(mut message) = reply else {
                        continue; // failed attempt, next candidate
                    };

                    self.sanitize_records(&mut message, qname, &auth);
                    self.fixup_answer(&mut message, qname, qtype, was_forwarded, send_rd);
                    self.update_cache_from_records(&message, qname, &auth, state, depth)
                        .await?;

                    let mut processed = ProcessedAnswer::new();
                    let done = self
                        .process_records(&message, qname, qtype, &auth, ret, &mut processed, state, depth)
                        .await?;
                    if done {
                        return Ok(processed.rcode);
                    }
                    if let Some(target) = processed.new_target.take() {
                        return self
                            .handle_new_target(qname, &target, qtype, ret, depth, state)
                            .await;
                    }
                    if processed.real_referral {
                        if let Some(stop) = stop_at_delegation.as_mut() {
                            if **stop == StopAtDelegation::Stop {
                                **stop = StopAtDelegation::Stopped;
                                return Ok(ResponseCode::NoError);
                            }
                        }
                        let new_auth = processed.new_auth.take().unwrap_or_else(Name::root);
                        let key = BeenThere {
                            qname: qname.clone(),
                            best_ns: processed.nameservers.keys().cloned().collect(),
                            qtype: u16::from(qtype),
                        };
                        if !beenthere.insert(key) {
                            warn!(%qname, %new_auth, "delegation loop detected");
                            return Err(ErrorKind::Loop(qname.clone()).into());
                        }
                        debug!(%qname, %new_auth, "following referral");
                        auth = new_auth;
                        nameservers = std::mem::take(&mut processed.nameservers);
                        continue 'level;
                    }
                    // Lame answer; the next candidate may do better.
                    trace!(%qname, %remote, "useless response, trying next server");
                }
            }

            debug!(%qname, %auth, "all candidates failed");
            return Ok(ResponseCode::ServFail);
        }
    }

    /// Restart the resolution at a CNAME target, bounding chain length and
    /// refusing cycles.
    #[async_recursion]
    pub(crate) async fn handle_new_target(
        &mut self,
        qname: &Name,
        new_target: &Name,
        qtype: RecordType,
        ret: &mut Vec<Record>,
        depth: u32,
        state: &mut ValidationState,
    ) -> Result<ResponseCode, Error> {
        if new_target == qname {
            return Err(ErrorKind::ImmediateServFail {
                reason: format!("CNAME for {qname} points to itself"),
            }
            .into());
        }
        self.cname_follows += 1;
        if self.cname_follows > self.config.max_cname_chain {
            return Err(ErrorKind::TooManyCnames(qname.clone()).into());
        }
        if ret
            .iter()
            .any(|record| {
                normalized_rtype(record.record_type()) == RecordType::CNAME
                    && record.name() == new_target
            })
        {
            return Err(ErrorKind::ImmediateServFail {
                reason: format!("CNAME loop via {new_target}"),
            }
            .into());
        }
        Error::recursion_exceeded(self.config.max_depth, depth + 1, new_target)?;

        debug!(%qname, %new_target, "following CNAME");
        let mut beenthere = BeenThereSet::new();
        self.do_resolve(new_target, qtype, ret, depth + 1, &mut beenthere, state)
            .await
    }

    /// An isolated sub-resolution with its own records, loop set, and
    /// validation state (used for NS addresses, DS and DNSKEY fetches).
    pub(crate) async fn sub_resolve(
        &mut self,
        qname: &Name,
        qtype: RecordType,
        depth: u32,
    ) -> Result<(ResponseCode, Vec<Record>, ValidationState), Error> {
        let mut ret = Vec::new();
        let mut beenthere = BeenThereSet::new();
        let mut state = ValidationState::Indeterminate;
        let rcode = self
            .do_resolve(qname, qtype, &mut ret, depth, &mut beenthere, &mut state)
            .await?;
        Ok((rcode, ret, state))
    }

    fn is_forward_or_auth(&self, qname: &Name) -> bool {
        self.worker
            .domain_map
            .as_ref()
            .is_some_and(|map| best_auth_zone(map, qname).is_some())
    }

    /// The deepest suffix of `qname` with live NS records in the cache; the
    /// starting point for QName minimization.
    fn deepest_cached_cut(&self, qname: &Name) -> Name {
        let mut name = qname.clone();
        loop {
            if self
                .record_cache
                .get(&name, RecordType::NS, self.now)
                .is_some()
            {
                return name;
            }
            if name.is_root() {
                return Name::root();
            }
            name = name.base_name();
        }
    }

    /// Locally answered names: localhost and its reverse mappings, plus the
    /// server identity in the CHAOS class.
    fn special_names_resolve(
        &mut self,
        qname: &Name,
        qtype: RecordType,
        qclass: DNSClass,
        ret: &mut Vec<Record>,
    ) -> Result<Option<ResponseCode>, Error> {
        let localhost = Name::from_ascii("localhost.")?;

        if qclass == DNSClass::IN && *qname == localhost {
            let want = |t| qtype == t || qtype == RecordType::ANY;
            if want(RecordType::A) {
                ret.push(Record::from_rdata(
                    qname.clone(),
                    86_400,
                    RData::A(A::new(127, 0, 0, 1)),
                ));
            }
            if want(RecordType::AAAA) {
                ret.push(Record::from_rdata(
                    qname.clone(),
                    86_400,
                    RData::AAAA(AAAA::new(0, 0, 0, 0, 0, 0, 0, 1)),
                ));
            }
            if want(RecordType::NS) {
                ret.push(Record::from_rdata(
                    qname.clone(),
                    86_400,
                    RData::NS(NS(localhost.clone())),
                ));
            }
            if want(RecordType::SOA) {
                ret.push(Record::from_rdata(
                    qname.clone(),
                    86_400,
                    RData::SOA(SOA::new(
                        localhost.clone(),
                        Name::from_ascii("root.localhost.")?,
                        1,
                        7200,
                        3600,
                        1_209_600,
                        86_400,
                    )),
                ));
            }
            return Ok(Some(ResponseCode::NoError));
        }

        if qclass == DNSClass::IN {
            let v4_loopback = Name::from_ascii("1.0.0.127.in-addr.arpa.")?;
            let v6_loopback = Name::from_ascii(&format!("1.{}ip6.arpa.", "0.".repeat(31)))?;
            if *qname == v4_loopback || *qname == v6_loopback {
                if qtype == RecordType::PTR || qtype == RecordType::ANY {
                    ret.push(Record::from_rdata(
                        qname.clone(),
                        86_400,
                        RData::PTR(PTR(localhost)),
                    ));
                }
                return Ok(Some(ResponseCode::NoError));
            }
        }

        if qclass == DNSClass::CH && (qtype == RecordType::TXT || qtype == RecordType::ANY) {
            for special in ["version.bind.", "version.server.", "id.server."] {
                if *qname == Name::from_ascii(special)? {
                    let mut record = Record::from_rdata(
                        qname.clone(),
                        86_400,
                        RData::TXT(TXT::new(vec![self.config.server_id.clone()])),
                    );
                    record.set_dns_class(DNSClass::CH);
                    ret.push(record);
                    return Ok(Some(ResponseCode::NoError));
                }
            }
        }

        Ok(None)
    }
}
