//! The public face of the resolver core: a long-lived, cheaply clonable
//! handle owning the caches, the shared maps, and the injected seams. Each
//! question is answered by a fresh per-query engine instance borrowing the
//! calling worker's state.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cache::{NegativeCache, PacketCache, PacketEntry, RecordCache};
use crate::config::{DnssecMode, RecursorConfig};
use crate::engine::Resolver;
use crate::error::Error;
use crate::proto::op::ResponseCode;
use crate::proto::rr::rdata::{A, AAAA, NS};
use crate::proto::rr::{DNSClass, Name, RData, Record, RecordType};
use crate::state::{ProcessCounters, SharedState, WorkerState};
use crate::task_queue::{ResolveTask, TaskQueue, TaskRunner};
use crate::transport::AskTransport;
use crate::validate::{DnssecVerifier, NoVerifier, ValidationState};
use crate::zones::DomainMap;

/// What one outer resolution produced: exactly one of a valid answer, a
/// negative answer, or SERVFAIL — never a partial answer.
#[derive(Clone, Debug)]
pub struct ResolveOutcome {
    /// Response code for the client.
    pub rcode: ResponseCode,
    /// All records gathered along the answer chain.
    pub records: Vec<Record>,
    /// Post-resolution validation state.
    pub validation_state: ValidationState,
    /// True when the answer came from a locally loaded zone.
    pub was_out_of_band: bool,
}

/// A recursive resolver handle.
///
/// Construct with [`Recursor::builder`]; clone freely — clones share the
/// caches, counters, task queue, and injected seams. Workers each own a
/// [`WorkerState`] (from [`Recursor::worker_state`]) and pass it into
/// [`Recursor::resolve`].
#[derive(Clone)]
pub struct Recursor {
    config: Arc<RecursorConfig>,
    shared: Arc<SharedState>,
    record_cache: Arc<RecordCache>,
    negative_cache: Arc<NegativeCache>,
    packet_cache: Arc<PacketCache>,
    transport: Arc<dyn AskTransport>,
    verifier: Arc<dyn DnssecVerifier>,
    counters: Arc<ProcessCounters>,
    domain_map: Option<Arc<DomainMap>>,
}

impl Recursor {
    /// Start building a recursor.
    pub fn builder() -> RecursorBuilder {
        RecursorBuilder::default()
    }

    /// Fresh per-worker state, carrying the current zone snapshot.
    pub fn worker_state(&self) -> WorkerState {
        let mut worker = WorkerState::new();
        if let Some(map) = &self.domain_map {
            worker.set_domain_map(map.clone());
        }
        worker
    }

    /// A per-question engine instance borrowing `worker`.
    pub fn resolver<'w>(&self, worker: &'w mut WorkerState, now: Instant) -> Resolver<'w> {
        Resolver::new(
            self.config.clone(),
            self.shared.clone(),
            worker,
            self.record_cache.clone(),
            self.negative_cache.clone(),
            self.transport.clone(),
            self.verifier.clone(),
            self.counters.clone(),
            now,
        )
    }

    /// Answer one question, going through the packet cache first. Errors are
    /// folded into a SERVFAIL outcome; the caller always gets exactly one
    /// answer.
    pub async fn resolve(
        &self,
        worker: &mut WorkerState,
        qname: &Name,
        qtype: RecordType,
        qclass: DNSClass,
        now: Instant,
    ) -> ResolveOutcome {
        let dnssec_ok = self.config.dnssec_mode != DnssecMode::Off;
        let fingerprint = PacketCache::fingerprint(qname, qtype, qclass, dnssec_ok, None);
        if let Some(hit) = self.packet_cache.get(fingerprint, now) {
            self.counters.packet_cache_hits.fetch_add(1, Ordering::Relaxed);
            return ResolveOutcome {
                rcode: hit.rcode,
                records: hit.records,
                validation_state: hit.state,
                was_out_of_band: false,
            };
        }

        let mut resolver = self.resolver(worker, now);
        let mut records = Vec::new();
        let outcome = match resolver
            .begin_resolve(qname, qtype, qclass, &mut records, 0)
            .await
        {
            Ok(rcode) => ResolveOutcome {
                rcode,
                records,
                validation_state: resolver.validation_state(),
                was_out_of_band: resolver.was_out_of_band(),
            },
            Err(e) => {
                warn!(%qname, %qtype, error = %e, "resolution failed");
                ResolveOutcome {
                    rcode: ResponseCode::ServFail,
                    records: Vec::new(),
                    validation_state: resolver.validation_state(),
                    was_out_of_band: false,
                }
            }
        };

        let counter = match outcome.rcode {
            ResponseCode::NoError => &self.counters.noerrors,
            ResponseCode::NXDomain => &self.counters.nxdomains,
            _ => &self.counters.servfails,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        // Whole answers are reusable across clients; local-zone answers are
        // served fresh every time.
        if !outcome.was_out_of_band {
            let ttl = match outcome.rcode {
                ResponseCode::ServFail => self.config.packet_cache_servfail_ttl,
                _ => outcome
                    .records
                    .iter()
                    .map(Record::ttl)
                    .min()
                    .unwrap_or(self.config.packet_cache_ttl)
                    .min(self.config.packet_cache_ttl),
            };
            if ttl > 0 {
                self.packet_cache.insert(
                    fingerprint,
                    PacketEntry {
                        rcode: outcome.rcode,
                        records: outcome.records.clone(),
                        state: outcome.validation_state,
                        valid_until: now + Duration::from_secs(u64::from(ttl)),
                    },
                );
            }
        }
        outcome
    }

    /// Submit a background resolve task, rate-limited per (name, type).
    pub fn push_resolve_task(
        &self,
        qname: Name,
        qtype: RecordType,
        now: Instant,
        deadline: SystemTime,
    ) -> bool {
        let runner = self
            .shared
            .background_runner()
            .unwrap_or_else(|| Arc::new(BackgroundRunner::new(self.clone())));
        self.shared
            .task_queue
            .push_resolve_task(qname, qtype, now, deadline, runner)
    }

    /// Drain one background task, if any is due.
    pub async fn run_task_once(&self, log_errors: bool) {
        self.shared.task_queue.run_once(log_errors).await;
    }

    /// Seed the record cache with the configured root servers so the
    /// delegation walk always has somewhere to start.
    pub fn prime_root_hints(&self, now: Instant) {
        const HINT_TTL: u32 = 518_400;
        let root = Name::root();

        let mut ns_records = Vec::new();
        let mut v4: HashMap<Name, Vec<Record>> = HashMap::new();
        let mut v6: HashMap<Name, Vec<Record>> = HashMap::new();
        for (name, addr) in &self.config.root_hints {
            ns_records.push(Record::from_rdata(
                root.clone(),
                HINT_TTL,
                RData::NS(NS(name.clone())),
            ));
            match addr {
                IpAddr::V4(ip) => v4.entry(name.clone()).or_default().push(
                    Record::from_rdata(name.clone(), HINT_TTL, RData::A(A(*ip))),
                ),
                IpAddr::V6(ip) => v6.entry(name.clone()).or_default().push(
                    Record::from_rdata(name.clone(), HINT_TTL, RData::AAAA(AAAA(*ip))),
                ),
            }
        }
        if ns_records.is_empty() {
            warn!("no root hints configured, resolution will fail");
            return;
        }

        self.record_cache.insert(
            &root,
            RecordType::NS,
            ns_records,
            Vec::new(),
            true,
            ValidationState::Indeterminate,
            None,
            now,
        );
        for (name, records) in v4 {
            self.record_cache.insert(
                &name,
                RecordType::A,
                records,
                Vec::new(),
                true,
                ValidationState::Indeterminate,
                None,
                now,
            );
        }
        for (name, records) in v6 {
            self.record_cache.insert(
                &name,
                RecordType::AAAA,
                records,
                Vec::new(),
                true,
                ValidationState::Indeterminate,
                None,
                now,
            );
        }
        debug!(hints = self.config.root_hints.len(), "primed root hints");
    }

    /// Effective configuration.
    pub fn config(&self) -> &RecursorConfig {
        &self.config
    }

    /// Process-wide counters.
    pub fn counters(&self) -> &ProcessCounters {
        &self.counters
    }

    /// The shared cross-worker state.
    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    /// The deferred-task queue.
    pub fn task_queue(&self) -> &Arc<TaskQueue> {
        &self.shared.task_queue
    }

    /// The positive record cache.
    pub fn record_cache(&self) -> &Arc<RecordCache> {
        &self.record_cache
    }

    /// The negative cache.
    pub fn negative_cache(&self) -> &Arc<NegativeCache> {
        &self.negative_cache
    }
}

/// Runs queued tasks on a fresh resolver instance each time.
struct BackgroundRunner {
    recursor: Recursor,
}

impl BackgroundRunner {
    fn new(recursor: Recursor) -> Self {
        Self { recursor }
    }
}

#[async_trait]
impl TaskRunner for BackgroundRunner {
    async fn run(&self, task: &ResolveTask, _log_errors: bool) -> Result<(), Error> {
        let mut worker = self.recursor.worker_state();
        let mut resolver = self.recursor.resolver(&mut worker, Instant::now());
        resolver.set_refresh_mode(task.refresh_mode);
        let mut records = Vec::new();
        let rcode = resolver
            .begin_resolve(&task.qname, task.qtype, DNSClass::IN, &mut records, 0)
            .await?;
        debug!(qname = %task.qname, qtype = %task.qtype, %rcode, records = records.len(),
            "background resolve done");
        Ok(())
    }
}

/// Builder for [`Recursor`]. A transport is required; everything else has
/// working defaults.
pub struct RecursorBuilder {
    config: RecursorConfig,
    transport: Option<Arc<dyn AskTransport>>,
    verifier: Arc<dyn DnssecVerifier>,
    domain_map: Option<Arc<DomainMap>>,
}

impl Default for RecursorBuilder {
    fn default() -> Self {
        Self {
            config: RecursorConfig::default(),
            transport: None,
            verifier: Arc::new(NoVerifier::new()),
            domain_map: None,
        }
    }
}

impl RecursorBuilder {
    /// Use this configuration instead of the defaults.
    pub fn config(mut self, config: RecursorConfig) -> Self {
        self.config = config;
        self
    }

    /// The async query primitive to reach upstream servers with (required).
    pub fn transport(mut self, transport: Arc<dyn AskTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// The DNSSEC verifier; defaults to no trust anchors.
    pub fn verifier(mut self, verifier: Arc<dyn DnssecVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Locally served and forwarded zones.
    pub fn domain_map(mut self, map: DomainMap) -> Self {
        self.domain_map = Some(Arc::new(map));
        self
    }

    /// Build the recursor, prime the root hints, and install the background
    /// task runner.
    pub fn build(self, now: Instant) -> Result<Recursor, Error> {
        let transport = self
            .transport
            .ok_or_else(|| Error::from("a transport is required to build a Recursor"))?;
        let config = Arc::new(self.config);
        let recursor = Recursor {
            record_cache: Arc::new(RecordCache::new(
                config.record_cache_capacity,
                config.minimum_ttl,
                config.max_cache_ttl,
            )),
            negative_cache: Arc::new(NegativeCache::new(
                config.negative_cache_capacity,
                config.max_negative_ttl,
            )),
            packet_cache: Arc::new(PacketCache::new(config.packet_cache_capacity)),
            shared: Arc::new(SharedState::new()),
            counters: Arc::new(ProcessCounters::default()),
            transport,
            verifier: self.verifier,
            domain_map: self.domain_map,
            config,
        };
        recursor.prime_root_hints(now);
        recursor
            .shared
            .set_background_runner(Arc::new(BackgroundRunner::new(recursor.clone())));
        info!(
            qname_minimization = recursor.config.qname_minimization,
            dnssec = ?recursor.config.dnssec_mode,
            "recursor ready"
        );
        Ok(recursor)
    }
}
