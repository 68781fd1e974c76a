//! Per-worker and cross-worker resolver state.
//!
//! Each worker owns its own [`WorkerState`] and hands it `&mut` to every
//! resolver instance it runs — there are no thread-locals and no globals.
//! The few maps that must be shared sit in [`SharedState`] behind one mutex
//! each; critical sections contain only the map operation.

use std::net::IpAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::nsspeed::NsSpeeds;
use crate::proto::rr::Name;
use crate::task_queue::{TaskQueue, TaskRunner};
use crate::throttle::{EdnsStatusMap, FailCounters, Throttle};
use crate::zones::DomainMap;

/// Throttle key: (server, target name, qtype). `(server, root, 0)` is the
/// sentinel that throttles the whole server.
pub type ThrottleKey = (IpAddr, Name, u16);

/// State owned by one worker, passed into each resolver instance it runs.
#[derive(Default)]
pub struct WorkerState {
    /// Decaying latency per (NS name, address).
    pub ns_speeds: NsSpeeds,
    /// Which (server, name, type) triples may currently not be queried.
    pub throttle: Throttle<ThrottleKey>,
    /// Per-server EDNS capability.
    pub edns_status: EdnsStatusMap,
    /// Snapshot of the locally configured zones.
    pub domain_map: Option<Arc<DomainMap>>,
}

impl WorkerState {
    /// Fresh worker state with no zone snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new zone snapshot.
    pub fn set_domain_map(&mut self, map: Arc<DomainMap>) {
        self.domain_map = Some(map);
    }

    /// Periodic maintenance: drop expired throttles and entries not touched
    /// since `cutoff`.
    pub fn prune(&mut self, now: Instant, cutoff: Instant) {
        self.throttle.prune(now);
        self.edns_status.prune(cutoff);
        self.ns_speeds.prune(cutoff);
    }

    /// Forget all learned server behavior.
    pub fn clear(&mut self) {
        self.ns_speeds.clear();
        self.throttle.clear();
        self.edns_status.clear();
    }
}

/// State shared by every worker of the process.
pub struct SharedState {
    /// Consecutive failure counts per server address.
    pub fails: Mutex<FailCounters<IpAddr>>,
    /// Name servers whose addresses repeatedly fail to resolve.
    pub non_resolving: Mutex<FailCounters<Name>>,
    /// The deferred-task queue.
    pub task_queue: Arc<TaskQueue>,
    /// Runner used for background refresh pushes; installed once at startup.
    background_runner: Mutex<Option<Arc<dyn TaskRunner>>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    /// Fresh shared state with an empty task queue.
    pub fn new() -> Self {
        Self {
            fails: Mutex::new(FailCounters::new()),
            non_resolving: Mutex::new(FailCounters::new()),
            task_queue: Arc::new(TaskQueue::new()),
            background_runner: Mutex::new(None),
        }
    }

    /// Install the runner handed to task-queue pushes.
    pub fn set_background_runner(&self, runner: Arc<dyn TaskRunner>) {
        *self.background_runner.lock() = Some(runner);
    }

    /// The installed background runner, if any.
    pub fn background_runner(&self) -> Option<Arc<dyn TaskRunner>> {
        self.background_runner.lock().clone()
    }

    /// Age out failure entries not updated since `cutoff`.
    pub fn prune(&self, cutoff: Instant) {
        self.fails.lock().prune(cutoff);
        self.non_resolving.lock().prune(cutoff);
    }
}

/// Process-wide resolution counters, mirrored out by the host's metrics.
#[derive(Debug, Default)]
pub struct ProcessCounters {
    /// Questions entering the engine.
    pub queries: AtomicU64,
    /// Outgoing upstream queries.
    pub outqueries: AtomicU64,
    /// Outgoing queries carried over TCP.
    pub tcpoutqueries: AtomicU64,
    /// Upstream attempts that timed out.
    pub outgoing_timeouts: AtomicU64,
    /// Timeouts against IPv4 servers.
    pub outgoing4_timeouts: AtomicU64,
    /// Timeouts against IPv6 servers.
    pub outgoing6_timeouts: AtomicU64,
    /// Candidate servers skipped because they were throttled.
    pub throttled_queries: AtomicU64,
    /// Candidate servers skipped by the don't-query list.
    pub dont_queries: AtomicU64,
    /// Questions answered from locally loaded zones.
    pub auth_zone_queries: AtomicU64,
    /// Upstream attempts that failed at the network layer.
    pub unreachables: AtomicU64,
    /// Full-name retries that succeeded after QName minimization failed.
    pub qname_min_fallback_success: AtomicU64,
    /// Resolutions aborted on a resource ceiling.
    pub resource_limits: AtomicU64,
    /// Outcomes by rcode class.
    pub servfails: AtomicU64,
    /// NXDOMAIN outcomes.
    pub nxdomains: AtomicU64,
    /// NOERROR outcomes.
    pub noerrors: AtomicU64,
    /// Answers served from the packet cache.
    pub packet_cache_hits: AtomicU64,
    /// Upstream queries satisfied by piggy-backing on an in-flight query.
    pub chained_queries: AtomicU64,
}
