//! Name-server selection: the best-delegation walk over the cache, speed
//! ordering, address resolution for NS names, throttle and don't-query
//! gating, and the transmit path with its EDNS and failure handling.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use async_recursion::async_recursion;
use ipnet::IpNet;
use rand::seq::SliceRandom;
use tracing::{debug, trace, warn};

use crate::error::{Error, ErrorKind};
use crate::proto::op::{Message, ResponseCode};
use crate::proto::rr::{Name, Record, RecordType};
use crate::throttle::EdnsMode;
use crate::transport::{AskOptions, AskReply, AskStatus};
use crate::{is_subzone, normalized_rtype};

use super::{BeenThere, BeenThereSet, NsSet, NsSetEntry, Resolver};

impl Resolver<'_> {
    /// Walk from `qname` towards the root and return the deepest zone with a
    /// usable cached NS set, appending those NS records to `bestns`.
    ///
    /// An NS name inside the zone it serves only counts when we also hold an
    /// address for it; a delegation we already tried (per `beenthere`) is
    /// skipped by walking one label further up.
    pub(crate) fn get_best_ns_from_cache(
        &mut self,
        qname: &Name,
        qtype: RecordType,
        bestns: &mut Vec<Record>,
        beenthere: &mut BeenThereSet,
    ) -> Result<Name, Error> {
        // A DS record lives in the parent zone; start the walk there.
        let mut subdomain = if normalized_rtype(qtype) == RecordType::DS && !qname.is_root() {
            qname.base_name()
        } else {
            qname.clone()
        };

        loop {
            if let Some(hit) = self.record_cache.get(&subdomain, RecordType::NS, self.now) {
                let mut candidates = Vec::new();
                for record in &hit.records {
                    let Some(ns) = record.data().as_ns() else {
                        continue;
                    };
                    let in_bailiwick = is_subzone(&subdomain, &ns.0);
                    let have_address = !in_bailiwick
                        || self
                            .record_cache
                            .get(&ns.0, RecordType::A, self.now)
                            .is_some()
                        || self
                            .record_cache
                            .get(&ns.0, RecordType::AAAA, self.now)
                            .is_some();
                    if have_address {
                        candidates.push(record.clone());
                    } else {
                        trace!(ns = %ns.0, zone = %subdomain, "in-zone NS without glue");
                    }
                }

                if !candidates.is_empty() {
                    let key = BeenThere {
                        qname: qname.clone(),
                        best_ns: candidates
                            .iter()
                            .filter_map(|record| record.data().as_ns().map(|ns| ns.0.clone()))
                            .collect(),
                        qtype: u16::from(qtype),
                    };
                    if beenthere.insert(key) {
                        bestns.extend(candidates);
                        trace!(%qname, zone = %subdomain, "best delegation from cache");
                        return Ok(subdomain);
                    }
                    // Already tried this exact delegation; step past it.
                    trace!(zone = %subdomain, "skipping already-tried delegation");
                }
            }

            if subdomain.is_root() {
                return Err(ErrorKind::ImmediateServFail {
                    reason: String::from("no NS records known for the root, cache was never primed"),
                }
                .into());
            }
            subdomain = subdomain.base_name();
        }
    }

    /// Like [`Self::get_best_ns_from_cache`] but produces the [`NsSet`] the
    /// delegation walk iterates over.
    pub(crate) fn get_best_ns_names_from_cache(
        &mut self,
        qname: &Name,
        qtype: RecordType,
        nameservers: &mut NsSet,
        beenthere: &mut BeenThereSet,
    ) -> Result<Name, Error> {
        let mut bestns = Vec::new();
        let auth = self.get_best_ns_from_cache(qname, qtype, &mut bestns, beenthere)?;
        for record in bestns {
            if let Some(ns) = record.data().as_ns() {
                nameservers
                    .entry(ns.0.clone())
                    .or_insert_with(NsSetEntry::default);
            }
        }
        Ok(auth)
    }

    /// Candidate NS names ordered by decaying speed, fastest first. The
    /// shuffle before the stable sort spreads load across equal candidates.
    pub(crate) fn shuffle_in_speed_order(&mut self, nameservers: &NsSet) -> Vec<(Name, f32)> {
        let mut ranked: Vec<(Name, f32)> =
            nameservers.keys().cloned().map(|name| (name, 0.0)).collect();
        ranked.shuffle(&mut rand::thread_rng());
        for (name, speed) in &mut ranked {
            *speed = self.worker.ns_speeds.get(name, self.now);
        }
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        ranked
    }

    /// Order one server's addresses by their stored averages, and purge
    /// addresses we no longer consider from its speed collection.
    pub(crate) fn sort_addresses_by_speed(
        &mut self,
        ns_name: &Name,
        mut addresses: Vec<IpAddr>,
    ) -> Vec<IpAddr> {
        let keep: HashMap<IpAddr, f32> = addresses
            .iter()
            .map(|addr| (*addr, self.worker.ns_speeds.peek(ns_name, *addr)))
            .collect();
        self.worker.ns_speeds.purge(ns_name, &keep);

        addresses.shuffle(&mut rand::thread_rng());
        addresses.sort_by(|a, b| keep[a].total_cmp(&keep[b]));
        addresses
    }

    /// Addresses for one NS name: cached glue first, then sub-resolutions
    /// for each enabled address family, bounded by the per-question NS
    /// address budget.
    #[async_recursion]
    pub(crate) async fn get_addrs(
        &mut self,
        ns_name: &Name,
        depth: u32,
        _beenthere: &mut BeenThereSet,
    ) -> Result<Vec<IpAddr>, Error> {
        let mut result = Vec::new();

        for (enabled, rtype) in [
            (self.config.do_ipv4, RecordType::A),
            (self.config.do_ipv6, RecordType::AAAA),
        ] {
            if !enabled {
                continue;
            }
            if let Some(hit) = self.record_cache.get(ns_name, rtype, self.now) {
                result.extend(hit.records.iter().filter_map(|record| record.data().ip_addr()));
                continue;
            }
            if self.ns_address_queries >= self.config.max_ns_address_queries_per_query {
                debug!(%ns_name, "NS address budget spent");
                continue;
            }
            self.ns_address_queries += 1;

            // Glue and other unauthenticated cache content is good enough to
            // find a server to talk to.
            let saved = self.require_auth_data;
            self.require_auth_data = false;
            let sub = self.sub_resolve(ns_name, rtype, depth).await;
            self.require_auth_data = saved;

            match sub {
                Ok((ResponseCode::NoError, records, _state)) => {
                    result.extend(records.iter().filter_map(|record| record.data().ip_addr()));
                }
                Ok((rcode, _, _)) => {
                    trace!(%ns_name, %rtype, %rcode, "NS address lookup came up empty");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(%ns_name, %rtype, error = %e, "NS address lookup failed");
                }
            }
        }

        Ok(result)
    }

    /// Server-level gating before a transmit: throttles, the don't-query
    /// list, and disabled address families. Forwarder addresses pierce the
    /// don't-query list.
    pub(crate) fn throttled_or_blocked(
        &mut self,
        remote: IpAddr,
        qname: &Name,
        qtype: RecordType,
        pierce_dont_query: bool,
    ) -> bool {
        let qtype_code = u16::from(normalized_rtype(qtype));
        if self
            .worker
            .throttle
            .should_throttle(self.now, &(remote, Name::root(), 0))
        {
            debug!(%remote, "server is throttled");
            self.throttled_queries += 1;
            self.counters.throttled_queries.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if self
            .worker
            .throttle
            .should_throttle(self.now, &(remote, qname.clone(), qtype_code))
        {
            debug!(%remote, %qname, %qtype, "query is throttled");
            self.throttled_queries += 1;
            self.counters.throttled_queries.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if !pierce_dont_query && self.config.dont_query_matches(remote) {
            debug!(%remote, "not sending query to masked address");
            self.dont_queries += 1;
            self.counters.dont_queries.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        match remote {
            IpAddr::V4(_) if !self.config.do_ipv4 => true,
            IpAddr::V6(_) if !self.config.do_ipv6 => true,
            _ => false,
        }
    }

    /// One transmit attempt against one address, including the TCP retry on
    /// truncation. `Ok(None)` means the attempt failed in a way the caller
    /// absorbs by moving to the next candidate.
    #[async_recursion]
    pub(crate) async fn do_resolve_at_this_ip(
        &mut self,
        ns_name: &Name,
        remote: IpAddr,
        qname: &Name,
        qtype: RecordType,
        send_rd: bool,
        do_tcp: bool,
    ) -> Result<Option<Message>, Error> {
        self.outqueries += 1;
        self.counters.outqueries.fetch_add(1, Ordering::Relaxed);
        if self.outqueries > self.config.max_queries_per_query {
            self.counters.resource_limits.fetch_add(1, Ordering::Relaxed);
            return Err(ErrorKind::ResourceLimit("max outgoing queries per query").into());
        }
        if do_tcp {
            self.tcpoutqueries += 1;
            self.counters.tcpoutqueries.fetch_add(1, Ordering::Relaxed);
        }

        let ecs = self.edns_subnet_mask_for(qname);
        trace!(%qname, %qtype, %remote, tcp = do_tcp, "asking");
        let (reply, usec) = self
            .ask_with_edns(remote, qname, qtype, do_tcp, send_rd, ecs)
            .await;
        if reply.chained {
            self.counters.chained_queries.fetch_add(1, Ordering::Relaxed);
        }
        self.tot_usec += usec;
        if self.tot_usec > self.config.max_total_micros {
            self.counters.resource_limits.fetch_add(1, Ordering::Relaxed);
            return Err(ErrorKind::ResourceLimit("max total time per query").into());
        }

        match reply.status {
            AskStatus::Success => {
                let Some(message) = reply.message else {
                    trace!(%remote, "success without a message, dropping attempt");
                    return Ok(None);
                };
                self.worker.ns_speeds.submit(
                    ns_name,
                    remote,
                    usec.min(u64::from(u32::MAX)) as u32,
                    self.now,
                );
                self.shared.fails.lock().clear_key(&remote);

                if message.truncated() && !do_tcp {
                    debug!(%qname, %remote, "truncated over UDP, retrying over TCP");
                    return self
                        .do_resolve_at_this_ip(ns_name, remote, qname, qtype, send_rd, true)
                        .await;
                }
                Ok(Some(message))
            }
            AskStatus::Timeout => {
                debug!(%qname, %remote, "timeout waiting for answer");
                self.timeouts += 1;
                self.counters.outgoing_timeouts.fetch_add(1, Ordering::Relaxed);
                match remote {
                    IpAddr::V4(_) => self
                        .counters
                        .outgoing4_timeouts
                        .fetch_add(1, Ordering::Relaxed),
                    IpAddr::V6(_) => self
                        .counters
                        .outgoing6_timeouts
                        .fetch_add(1, Ordering::Relaxed),
                };
                // A timeout is charged as a full second against the average.
                self.worker.ns_speeds.submit(ns_name, remote, 1_000_000, self.now);
                self.note_server_failure(ns_name, remote, qname, qtype, false);
                Ok(None)
            }
            AskStatus::NetworkError | AskStatus::OsLimit => {
                debug!(%qname, %remote, "server unreachable");
                self.unreachables += 1;
                self.counters.unreachables.fetch_add(1, Ordering::Relaxed);
                self.note_server_failure(ns_name, remote, qname, qtype, true);
                Ok(None)
            }
            AskStatus::Spoofed => {
                warn!(%qname, %remote, "spoofed answer, backing off");
                if !self.config.dont_throttle_matches(remote, ns_name) {
                    self.worker.throttle.throttle(
                        self.now,
                        (remote, qname.clone(), u16::from(normalized_rtype(qtype))),
                        Duration::from_secs(60),
                        100,
                    );
                }
                Ok(None)
            }
        }
    }

    /// Record one failed attempt: bump the shared failure counter, and
    /// either throttle the triple briefly or, past the server-down limit,
    /// throttle the whole server for the configured long period.
    fn note_server_failure(
        &mut self,
        ns_name: &Name,
        remote: IpAddr,
        qname: &Name,
        qtype: RecordType,
        unreachable: bool,
    ) {
        if self.config.dont_throttle_matches(remote, ns_name) {
            return;
        }
        let fails = self.shared.fails.lock().incr(remote, self.now);
        if fails >= self.config.server_down_max_fails {
            debug!(%remote, fails, "server considered down");
            self.worker.throttle.throttle(
                self.now,
                (remote, Name::root(), 0),
                self.config.server_down_throttle_time,
                10_000,
            );
        } else {
            let ttl = if unreachable {
                Duration::from_secs(20)
            } else {
                Duration::from_secs(10)
            };
            self.worker.throttle.throttle(
                self.now,
                (remote, qname.clone(), u16::from(normalized_rtype(qtype))),
                ttl,
                5,
            );
        }
    }

    /// The EDNS-aware ask: pick the EDNS level from what we know about the
    /// server, learn from the reply, and retry once without EDNS against
    /// servers that choke on it.
    async fn ask_with_edns(
        &mut self,
        remote: IpAddr,
        qname: &Name,
        qtype: RecordType,
        tcp: bool,
        send_rd: bool,
        ecs: Option<IpNet>,
    ) -> (AskReply, u64) {
        let mut usec_total: u64 = 0;
        let mut use_edns = self.worker.edns_status.mode(remote) != EdnsMode::NoEdns;

        loop {
            let options = AskOptions {
                tcp,
                send_rd,
                edns: use_edns,
                ecs,
            };
            let started = Instant::now();
            let reply = self.transport.ask(remote, qname, qtype, &options).await;
            usec_total += started.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;

            if reply.status == AskStatus::Success {
                if let Some(message) = reply.message.as_ref() {
                    if use_edns
                        && matches!(
                            message.response_code(),
                            ResponseCode::FormErr | ResponseCode::NotImp
                        )
                        && message.answers().is_empty()
                    {
                        debug!(%remote, "server refuses EDNS, retrying without");
                        self.worker
                            .edns_status
                            .set_mode(remote, EdnsMode::NoEdns, self.now);
                        use_edns = false;
                        continue;
                    }
                    if use_edns {
                        let mode = if message.extensions().is_some() {
                            EdnsMode::EdnsOk
                        } else {
                            EdnsMode::EdnsIgnorant
                        };
                        self.worker.edns_status.set_mode(remote, mode, self.now);
                    }
                }
            }
            return (reply, usec_total);
        }
    }

    /// The ECS source mask for `qname`, when configured and allowlisted.
    fn edns_subnet_mask_for(&self, qname: &Name) -> Option<IpNet> {
        if self.config.ecs_allowed_for(qname) {
            self.config.ecs_source
        } else {
            None
        }
    }
}
