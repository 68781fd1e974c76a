//! The deferred-task queue: background resolutions used to refresh records
//! nearing expiry and to finish work the foreground path would not wait for.
//!
//! One mutex guards the FIFO queue and its rate-limit companion set; tasks
//! run outside the lock, one at a time per draining worker. A task is
//! identified by (name, type, refresh-mode) only — the queue holds at most
//! one per identity, and the rate-limit set rejects re-submissions within a
//! 60 second window.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{Error, TaskFailureKind};
use crate::is_unsupported_qtype;
use crate::proto::rr::{Name, RecordType};

/// Executes one queued task against a fresh resolver instance.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Resolve `task.qname`/`task.qtype` in the background.
    async fn run(&self, task: &ResolveTask, log_errors: bool) -> Result<(), Error>;
}

/// A deferred resolution. Identity — equality, ordering, hashing — is the
/// (name, type, refresh-mode) triple; the deadline and runner do not count.
#[derive(Clone)]
pub struct ResolveTask {
    /// Name to resolve.
    pub qname: Name,
    /// Record type to resolve.
    pub qtype: RecordType,
    /// Wall-clock instant after which the task is dropped on pop.
    pub deadline: SystemTime,
    /// True for almost-expired refreshes, false for plain resolve tasks.
    pub refresh_mode: bool,
    /// Callback that performs the resolution.
    pub runner: Arc<dyn TaskRunner>,
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
struct TaskKey {
    qname: Name,
    qtype: u16,
    refresh_mode: bool,
}

impl ResolveTask {
    fn key(&self) -> TaskKey {
        TaskKey {
            qname: self.qname.clone(),
            qtype: u16::from(self.qtype),
            refresh_mode: self.refresh_mode,
        }
    }
}

impl PartialEq for ResolveTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ResolveTask {}

impl fmt::Debug for ResolveTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveTask")
            .field("qname", &self.qname)
            .field("qtype", &self.qtype)
            .field("deadline", &self.deadline)
            .field("refresh_mode", &self.refresh_mode)
            .finish_non_exhaustive()
    }
}

/// Set of recently submitted task identities, each expiring 60 seconds after
/// insertion. Purging walks a time-ordered index and is amortized by running
/// on every 1024th insertion; a rejected insert purges and retries once if
/// the purge freed anything.
struct TimedSet {
    set: HashMap<TaskKey, Instant>,
    by_ttd: BinaryHeap<Reverse<(Instant, TaskKey)>>,
    expiry: Duration,
    inserts: u64,
}

impl TimedSet {
    fn new(expiry: Duration) -> Self {
        Self {
            set: HashMap::new(),
            by_ttd: BinaryHeap::new(),
            expiry,
            inserts: 0,
        }
    }

    fn purge(&mut self, now: Instant) -> u64 {
        let mut erased = 0;
        while matches!(self.by_ttd.peek(), Some(Reverse((ttd, _))) if *ttd < now) {
            let Reverse((ttd, key)) = self.by_ttd.pop().expect("peeked entry");
            if self.set.get(&key) == Some(&ttd) {
                self.set.remove(&key);
                erased += 1;
            }
        }
        erased
    }

    fn insert(&mut self, now: Instant, key: TaskKey) -> bool {
        self.inserts += 1;
        if self.inserts % 1024 == 0 {
            self.purge(now);
        }
        let ttd = now + self.expiry;
        if self.set.contains_key(&key) {
            // Try again if the purge deleted at least one entry
            if self.purge(now) == 0 || self.set.contains_key(&key) {
                return false;
            }
        }
        self.set.insert(key.clone(), ttd);
        self.by_ttd.push(Reverse((ttd, key)));
        true
    }

    fn clear(&mut self) {
        self.set.clear();
        self.by_ttd.clear();
    }
}

struct Inner {
    queue: VecDeque<ResolveTask>,
    queued: HashSet<TaskKey>,
    rate_limit: TimedSet,
    pushes: u64,
    expired: u64,
}

impl Inner {
    fn push(&mut self, task: ResolveTask) -> bool {
        if !self.queued.insert(task.key()) {
            return false;
        }
        self.queue.push_back(task);
        self.pushes += 1;
        true
    }

    fn pop(&mut self) -> Option<ResolveTask> {
        let task = self.queue.pop_front()?;
        self.queued.remove(&task.key());
        Some(task)
    }
}

/// Exception counts per failure bucket.
#[derive(Debug, Default)]
pub struct ExceptionStats {
    /// Plain runtime errors.
    pub generic: AtomicU64,
    /// Loops, overlong chains, terminal rcodes.
    pub domain_error: AtomicU64,
    /// Failures reported as SERVFAIL.
    pub serv_fail: AtomicU64,
    /// Filter policy hits.
    pub policy_hit: AtomicU64,
    /// Everything else.
    pub unknown: AtomicU64,
}

impl ExceptionStats {
    fn incr(&self, kind: TaskFailureKind) {
        let counter = match kind {
            TaskFailureKind::Generic => &self.generic,
            TaskFailureKind::DomainError => &self.domain_error,
            TaskFailureKind::ServFail => &self.serv_fail,
            TaskFailureKind::PolicyHit => &self.policy_hit,
            TaskFailureKind::Unknown => &self.unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Sum over all buckets.
    pub fn total(&self) -> u64 {
        self.generic.load(Ordering::Relaxed)
            + self.domain_error.load(Ordering::Relaxed)
            + self.serv_fail.load(Ordering::Relaxed)
            + self.policy_hit.load(Ordering::Relaxed)
            + self.unknown.load(Ordering::Relaxed)
    }
}

/// Counters for one task mode (refresh vs. plain resolve).
#[derive(Debug, Default)]
pub struct TaskStats {
    /// Tasks accepted into the queue.
    pub pushed: AtomicU64,
    /// Tasks that ran to completion.
    pub run: AtomicU64,
    /// Tasks that failed, by bucket.
    pub exceptions: ExceptionStats,
}

/// The process-wide deferred-task queue.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    almost_expired: TaskStats,
    resolve: TaskStats,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// Create an empty queue with the standard 60 second rate-limit window.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                rate_limit: TimedSet::new(Duration::from_secs(60)),
                pushes: 0,
                expired: 0,
            }),
            almost_expired: TaskStats::default(),
            resolve: TaskStats::default(),
        }
    }

    /// Submit a plain resolve task, subject to the rate-limit set. Returns
    /// true if the task was accepted.
    pub fn push_resolve_task(
        &self,
        qname: Name,
        qtype: RecordType,
        now: Instant,
        deadline: SystemTime,
        runner: Arc<dyn TaskRunner>,
    ) -> bool {
        if is_unsupported_qtype(qtype) {
            error!(%qname, %qtype, "cannot push task, qtype unsupported");
            return false;
        }
        let task = ResolveTask {
            qname,
            qtype,
            deadline,
            refresh_mode: false,
            runner,
        };
        let mut inner = self.inner.lock();
        if !inner.rate_limit.insert(now, task.key()) {
            return false;
        }
        if inner.push(task) {
            self.resolve.pushed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Submit an almost-expired refresh task. Pre-refresh is always allowed;
    /// this bypasses the rate-limit set.
    pub fn push_almost_expired_task(
        &self,
        qname: Name,
        qtype: RecordType,
        deadline: SystemTime,
        runner: Arc<dyn TaskRunner>,
    ) -> bool {
        if is_unsupported_qtype(qtype) {
            error!(%qname, %qtype, "cannot push task, qtype unsupported");
            return false;
        }
        let task = ResolveTask {
            qname,
            qtype,
            deadline,
            refresh_mode: true,
            runner,
        };
        if self.inner.lock().push(task) {
            self.almost_expired.pushed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Pop and run one task. Expired tasks are counted and discarded without
    /// running; failures are classified and counted, never propagated.
    pub async fn run_once(&self, log_errors: bool) {
        let task = {
            let mut inner = self.inner.lock();
            match inner.pop() {
                Some(task) => task,
                None => return,
            }
        };
        if SystemTime::now() > task.deadline {
            self.inner.lock().expired += 1;
            debug!(qname = %task.qname, qtype = %task.qtype, "dropping expired task");
            return;
        }
        let stats = if task.refresh_mode {
            &self.almost_expired
        } else {
            &self.resolve
        };
        let runner = task.runner.clone();
        match runner.run(&task, log_errors).await {
            Ok(()) => {
                stats.run.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.exceptions.incr(e.task_failure_kind());
                if log_errors {
                    error!(qname = %task.qname, qtype = %task.qtype, error = %e,
                        "error while running a background resolve task");
                }
            }
        }
    }

    /// Tasks currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Total accepted pushes, both modes.
    pub fn pushes(&self) -> u64 {
        self.inner.lock().pushes
    }

    /// Tasks dropped on pop because their deadline had passed.
    pub fn expired(&self) -> u64 {
        self.inner.lock().expired
    }

    /// Plain resolve tasks accepted.
    pub fn resolve_tasks_pushed(&self) -> u64 {
        self.resolve.pushed.load(Ordering::Relaxed)
    }

    /// Plain resolve tasks completed.
    pub fn resolve_tasks_run(&self) -> u64 {
        self.resolve.run.load(Ordering::Relaxed)
    }

    /// Plain resolve task failures.
    pub fn resolve_task_exceptions(&self) -> &ExceptionStats {
        &self.resolve.exceptions
    }

    /// Refresh tasks accepted.
    pub fn almost_expired_tasks_pushed(&self) -> u64 {
        self.almost_expired.pushed.load(Ordering::Relaxed)
    }

    /// Refresh tasks completed.
    pub fn almost_expired_tasks_run(&self) -> u64 {
        self.almost_expired.run.load(Ordering::Relaxed)
    }

    /// Refresh task failures.
    pub fn almost_expired_task_exceptions(&self) -> &ExceptionStats {
        &self.almost_expired.exceptions
    }

    /// Drop all queued tasks and the rate-limit history.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.queued.clear();
        inner.rate_limit.clear();
    }
}
