//! Storage request scheduler.
//!
//! Sits between the request-intercepting shim and the downstream storage
//! service. Every tenant (keyed by source address) gets its own FIFO of
//! pending jobs, a strict priority class, and a set of token buckets pushed
//! down by the admission service. Worker threads pull one job at a time; the
//! scheduler arbitrates across tenants, enforces multiprogramming limits,
//! and bounds priority inversion with a starvation guard.
//!
//! Arbitration between two tenants, in order: a non-empty queue beats an
//! empty one; an immediate head job beats a non-immediate one; a tenant
//! within its rate limits beats one outside them, and priority only applies
//! between tenants that are both within limits; finally FCFS on head-job
//! arrival time. Tenants out of their limits run as best effort.
//!
//! One exclusive lock protects all scheduler state; a single condition
//! variable wakes workers when the set of dispatchable jobs may have grown.
//! The lock is never held across the downstream call.

use crate::descriptors::RateLimiterSpec;
use crate::estimator::Estimator;
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

static JOB_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Tenants are identified by the source address of their requests.
pub type TenantKey = String;

pub type JobReply = Result<Vec<u8>, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobClass {
    Read,
    Write,
    /// Metadata operations: arbitrated like any job but never back-pressured
    /// by the global multiprogramming cap.
    Immediate,
}

/// One storage request travelling through the scheduler.
#[derive(Debug)]
pub struct Job {
    pub id: u64,
    pub tenant: TenantKey,
    pub class: JobClass,
    pub request_size: u64,
    /// Opaque request bytes forwarded downstream.
    pub payload: Vec<u8>,
    /// Where the shim wants the downstream response delivered; absent for
    /// fire-and-forget submissions.
    pub reply: Option<Sender<JobReply>>,
    /// Downstream client handle assigned at dispatch.
    pub handle: usize,
    pub priority: u32,
    pub arrival_time: Instant,
    /// Work estimate charged against the tenant's token buckets.
    pub work: f64,
    /// Whether the tenant was within its rate limits at dispatch.
    pub rate_limit_obeyed: bool,
    seq_read: u64,
    seq_write: u64,
    seq_read_bytes: u64,
    seq_write_bytes: u64,
}

impl Job {
    pub fn is_read(&self) -> bool {
        self.class == JobClass::Read
    }

    pub fn is_write(&self) -> bool {
        self.class == JobClass::Write
    }

    pub fn is_immediate(&self) -> bool {
        self.class == JobClass::Immediate
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    rate: f64,
    burst: f64,
    tokens: f64,
}

#[derive(Debug)]
struct Tenant {
    pending: VecDeque<Job>,
    priority: u32,
    buckets: Vec<Bucket>,
    token_update_time: Instant,
    rate_limit_obeyed: bool,
    occupancy: Duration,
    /// Start of the current busy period (or the last occupancy fold).
    last_occupancy_time: Instant,
    /// Start of the current occupancy measurement window.
    occupancy_epoch: Instant,
}

impl Tenant {
    /// New tenants run unthrottled at priority 0 so unconfigured traffic
    /// (e.g. profiling runs) is not rate limited.
    fn new(now: Instant) -> Tenant {
        Tenant {
            pending: VecDeque::new(),
            priority: 0,
            buckets: Vec::new(),
            token_update_time: now,
            rate_limit_obeyed: false,
            occupancy: Duration::ZERO,
            last_occupancy_time: now,
            occupancy_epoch: now,
        }
    }
}

/// Snapshot of a dispatched rate-obeying job, kept in submission order for
/// the starvation guard.
#[derive(Debug, Clone)]
struct OutstandingJob {
    id: u64,
    priority: u32,
    seq_read: u64,
    seq_write: u64,
    seq_read_bytes: u64,
    seq_write_bytes: u64,
}

/// Multiprogramming limits for the dispatch gate.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_outstanding_read_jobs: u64,
    pub max_outstanding_write_jobs: u64,
    pub max_outstanding_read_bytes: u64,
    pub max_outstanding_write_bytes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> SchedulerConfig {
        SchedulerConfig {
            max_outstanding_read_jobs: 16,
            max_outstanding_write_jobs: 16,
            max_outstanding_read_bytes: 1 << 22,
            max_outstanding_write_bytes: 1 << 22,
        }
    }
}

#[derive(Debug)]
struct State {
    tenants: BTreeMap<TenantKey, Tenant>,
    /// Idle downstream client handles.
    available_handles: Vec<usize>,
    /// Handles retired by a failed call or keep-alive, awaiting revival.
    retired_handles: Vec<usize>,
    /// In-flight rate-obeying jobs in submission order.
    outstanding: VecDeque<OutstandingJob>,
    seq_read: u64,
    seq_write: u64,
    seq_read_bytes: u64,
    seq_write_bytes: u64,
    outstanding_jobs: u64,
    /// Raised by one for every in-flight immediate job.
    max_outstanding_jobs: u64,
    outstanding_read_jobs: u64,
    outstanding_write_jobs: u64,
    outstanding_read_bytes: u64,
    outstanding_write_bytes: u64,
    pending_job_count: usize,
    shutdown: bool,
}

pub struct Scheduler {
    state: Mutex<State>,
    available_jobs: Condvar,
    estimator: Estimator,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(handles: Vec<usize>, config: SchedulerConfig, estimator: Estimator) -> Scheduler {
        Scheduler {
            state: Mutex::new(State {
                tenants: BTreeMap::new(),
                available_handles: handles,
                retired_handles: Vec::new(),
                outstanding: VecDeque::new(),
                seq_read: 0,
                seq_write: 0,
                seq_read_bytes: 0,
                seq_write_bytes: 0,
                outstanding_jobs: 0,
                max_outstanding_jobs: config.max_outstanding_read_jobs
                    + config.max_outstanding_write_jobs,
                outstanding_read_jobs: 0,
                outstanding_write_jobs: 0,
                outstanding_read_bytes: 0,
                outstanding_write_bytes: 0,
                pending_job_count: 0,
                shutdown: false,
            }),
            available_jobs: Condvar::new(),
            estimator,
            config,
        }
    }

    /// Install a tenant's priority and token buckets; buckets start full.
    pub fn update_tenant(&self, tenant: &str, priority: u32, limiters: &[RateLimiterSpec]) {
        let mut state = self.state.lock();
        let t = get_tenant(&mut state, tenant);
        t.priority = priority;
        t.buckets = limiters
            .iter()
            .map(|l| Bucket {
                rate: l.rate,
                burst: l.burst,
                tokens: l.burst,
            })
            .collect();
        t.rate_limit_obeyed = false;
        drop(state);
        // New limits may make a previously throttled tenant dispatchable.
        self.available_jobs.notify_all();
    }

    /// Reset a tenant to defaults: no rate limits, priority 0.
    pub fn remove_tenant(&self, tenant: &str) {
        self.update_tenant(tenant, 0, &[]);
    }

    /// Fraction of the time since the previous call that the tenant had jobs
    /// queued; resets the measurement window.
    pub fn occupancy(&self, tenant: &str) -> f64 {
        let mut state = self.state.lock();
        let now = Instant::now();
        let t = get_tenant(&mut state, tenant);
        if !t.pending.is_empty() {
            t.occupancy += now.saturating_duration_since(t.last_occupancy_time);
            t.last_occupancy_time = now;
        }
        let window = now.saturating_duration_since(t.occupancy_epoch);
        let occupancy = if window.is_zero() {
            0.0
        } else {
            t.occupancy.as_secs_f64() / window.as_secs_f64()
        };
        t.occupancy = Duration::ZERO;
        t.occupancy_epoch = now;
        occupancy
    }

    pub fn pending_jobs(&self, tenant: &str) -> usize {
        let mut state = self.state.lock();
        get_tenant(&mut state, tenant).pending.len()
    }

    /// Queue a request for dispatch.
    pub fn submit(
        &self,
        tenant: &str,
        class: JobClass,
        request_size: u64,
        payload: Vec<u8>,
        reply: Option<Sender<JobReply>>,
    ) -> u64 {
        let now = Instant::now();
        let work = match class {
            JobClass::Read => self.estimator.work(request_size, true),
            JobClass::Write => self.estimator.work(request_size, false),
            // Metadata requests are treated as free.
            JobClass::Immediate => 0.0,
        };
        let job = Job {
            id: JOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            tenant: tenant.to_owned(),
            class,
            request_size,
            payload,
            reply,
            handle: usize::MAX,
            priority: 0,
            arrival_time: now,
            work,
            rate_limit_obeyed: false,
            seq_read: 0,
            seq_write: 0,
            seq_read_bytes: 0,
            seq_write_bytes: 0,
        };
        let id = job.id;
        let mut state = self.state.lock();
        let t = get_tenant(&mut state, tenant);
        if t.pending.is_empty() {
            t.last_occupancy_time = now;
            self.available_jobs.notify_one();
        }
        t.pending.push_back(job);
        state.pending_job_count += 1;
        id
    }

    /// Block until a job is dispatchable (or shutdown).
    pub fn next_job(&self) -> Option<Job> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(job) = self.schedule_job(&mut state) {
                return Some(job);
            }
            self.available_jobs.wait(&mut state);
        }
    }

    /// Non-blocking dispatch attempt.
    pub fn try_next_job(&self) -> Option<Job> {
        let mut state = self.state.lock();
        self.schedule_job(&mut state)
    }

    /// Account a finished job and wake workers for anything it unblocked.
    pub fn complete(&self, job: &Job) {
        let mut state = self.state.lock();
        if job.is_immediate() {
            state.max_outstanding_jobs -= 1;
        }
        state.outstanding_jobs -= 1;
        if job.is_read() {
            state.outstanding_read_jobs -= 1;
            state.outstanding_read_bytes -= job.request_size;
        } else if job.is_write() {
            state.outstanding_write_jobs -= 1;
            state.outstanding_write_bytes -= job.request_size;
        }
        if job.rate_limit_obeyed {
            if let Some(pos) = state.outstanding.iter().position(|o| o.id == job.id) {
                state.outstanding.remove(pos);
            }
        }
        if state.pending_job_count > 0 {
            self.available_jobs.notify_all();
        }
    }

    /// Return an idle downstream handle to the pool.
    pub fn return_handle(&self, handle: usize) {
        self.state.lock().available_handles.push(handle);
    }

    /// Park a handle whose downstream call failed; keep-alive will try to
    /// revive it.
    pub fn retire_handle(&self, handle: usize) {
        self.state.lock().retired_handles.push(handle);
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.available_jobs.notify_all();
    }

    /// Ping idle handles and retire failures; give retired handles a chance
    /// to come back.
    pub fn keep_alive(&self, backend: &dyn StorageBackend) {
        let mut state = self.state.lock();
        let idle = std::mem::take(&mut state.available_handles);
        let retired = std::mem::take(&mut state.retired_handles);
        // Probing can be slow; do it without the lock and re-file afterwards.
        drop(state);
        let mut alive = Vec::new();
        let mut dead = Vec::new();
        for handle in idle.into_iter().chain(retired) {
            if backend.keep_alive(handle) {
                alive.push(handle);
            } else {
                debug!(handle, "downstream handle failed keep-alive");
                dead.push(handle);
            }
        }
        let mut state = self.state.lock();
        state.available_handles.extend(alive);
        state.retired_handles.extend(dead);
        drop(state);
        self.available_jobs.notify_all();
    }

    fn schedule_job(&self, state: &mut State) -> Option<Job> {
        if state.pending_job_count == 0 || state.available_handles.is_empty() {
            return None;
        }
        let now = Instant::now();
        let keys: Vec<TenantKey> = state.tenants.keys().cloned().collect();
        for key in &keys {
            update_tokens(state.tenants.get_mut(key).unwrap(), now);
        }
        let mut best = keys.first()?;
        for key in &keys[1..] {
            if compare_tenants(&state.tenants[key], &state.tenants[best]) > 0 {
                best = key;
            }
        }
        let tenant_priority = state.tenants[best].priority;
        let head = state.tenants[best].pending.front()?;
        let head_class = head.class;
        let head_size = head.request_size;
        debug_assert!(state.outstanding_jobs <= state.max_outstanding_jobs);

        if head_class == JobClass::Immediate {
            // Immediate jobs widen the cap for their own lifetime.
            state.max_outstanding_jobs += 1;
        } else {
            if state.outstanding_jobs >= state.max_outstanding_jobs {
                return None;
            }
            if head_class == JobClass::Read {
                if state.outstanding_read_jobs >= self.config.max_outstanding_read_jobs
                    || state.outstanding_read_bytes + head_size
                        >= self.config.max_outstanding_read_bytes
                {
                    return None;
                }
                // Do not run ahead of an older higher-priority job by more
                // than one MPL window of jobs or bytes.
                let mut oldest_seq = state.seq_read;
                let mut oldest_bytes = state.seq_read_bytes;
                for o in &state.outstanding {
                    if o.priority < tenant_priority {
                        oldest_seq = o.seq_read;
                        oldest_bytes = o.seq_read_bytes;
                        break;
                    }
                }
                if state.seq_read > oldest_seq + self.config.max_outstanding_read_jobs {
                    return None;
                }
                if state.seq_read_bytes + head_size
                    >= oldest_bytes + self.config.max_outstanding_read_bytes
                {
                    return None;
                }
            } else {
                if state.outstanding_write_jobs >= self.config.max_outstanding_write_jobs
                    || state.outstanding_write_bytes + head_size
                        >= self.config.max_outstanding_write_bytes
                {
                    return None;
                }
                let mut oldest_seq = state.seq_write;
                let mut oldest_bytes = state.seq_write_bytes;
                for o in &state.outstanding {
                    if o.priority < tenant_priority {
                        oldest_seq = o.seq_write;
                        oldest_bytes = o.seq_write_bytes;
                        break;
                    }
                }
                if state.seq_write > oldest_seq + self.config.max_outstanding_write_jobs {
                    return None;
                }
                if state.seq_write_bytes + head_size
                    >= oldest_bytes + self.config.max_outstanding_write_bytes
                {
                    return None;
                }
            }
        }

        let best = best.clone();
        let mut job = remove_job(state, &best, now);
        job.priority = tenant_priority;
        job.seq_read = state.seq_read;
        job.seq_write = state.seq_write;
        job.seq_read_bytes = state.seq_read_bytes;
        job.seq_write_bytes = state.seq_write_bytes;
        if job.is_read() {
            state.seq_read += 1;
            state.seq_read_bytes += job.request_size;
        } else if job.is_write() {
            state.seq_write += 1;
            state.seq_write_bytes += job.request_size;
        }
        if job.rate_limit_obeyed {
            state.outstanding.push_back(OutstandingJob {
                id: job.id,
                priority: job.priority,
                seq_read: job.seq_read,
                seq_write: job.seq_write,
                seq_read_bytes: job.seq_read_bytes,
                seq_write_bytes: job.seq_write_bytes,
            });
        }
        job.handle = state.available_handles.pop().expect("handle checked above");
        state.outstanding_jobs += 1;
        if job.is_read() {
            state.outstanding_read_jobs += 1;
            state.outstanding_read_bytes += job.request_size;
        } else if job.is_write() {
            state.outstanding_write_jobs += 1;
            state.outstanding_write_bytes += job.request_size;
        }
        Some(job)
    }
}

fn get_tenant<'a>(state: &'a mut State, key: &str) -> &'a mut Tenant {
    if !state.tenants.contains_key(key) {
        state
            .tenants
            .insert(key.to_owned(), Tenant::new(Instant::now()));
    }
    state.tenants.get_mut(key).unwrap()
}

/// Refresh a tenant's buckets and its within-limits flag.
///
/// Time the queue spent empty refills up to the burst cap; time spent
/// non-empty refills without the cap, so best-effort tenants cannot be
/// throttled forever. Skipped while the flag is already set; dispatch clears
/// it.
fn update_tokens(tenant: &mut Tenant, now: Instant) {
    let Some(head) = tenant.pending.front() else {
        return;
    };
    if tenant.rate_limit_obeyed {
        return;
    }
    tenant.rate_limit_obeyed = true;
    if tenant.token_update_time < tenant.last_occupancy_time {
        let elapsed = tenant
            .last_occupancy_time
            .saturating_duration_since(tenant.token_update_time)
            .as_secs_f64();
        for bucket in &mut tenant.buckets {
            bucket.tokens = (bucket.tokens + elapsed * bucket.rate).min(bucket.burst);
        }
        tenant.token_update_time = tenant.last_occupancy_time;
    }
    let elapsed = now
        .saturating_duration_since(tenant.token_update_time)
        .as_secs_f64();
    tenant.token_update_time = now;
    let head_work = head.work;
    for bucket in &mut tenant.buckets {
        bucket.tokens += elapsed * bucket.rate;
        if head_work > bucket.tokens {
            tenant.rate_limit_obeyed = false;
        }
    }
}

const PREFER_1: i32 = 1;
const PREFER_EQUAL: i32 = 0;
const PREFER_2: i32 = -1;

/// Decide which of two tenants should dispatch next. Assumes token buckets
/// were refreshed this scheduling step.
fn compare_tenants(t1: &Tenant, t2: &Tenant) -> i32 {
    let (Some(job1), Some(job2)) = (t1.pending.front(), t2.pending.front()) else {
        return match (t1.pending.is_empty(), t2.pending.is_empty()) {
            (true, true) => PREFER_EQUAL,
            (true, false) => PREFER_2,
            (false, true) => PREFER_1,
            (false, false) => unreachable!(),
        };
    };
    if job1.is_immediate() {
        if !job2.is_immediate() {
            return PREFER_1;
        }
    } else if job2.is_immediate() {
        return PREFER_2;
    }
    if t1.rate_limit_obeyed {
        if t2.rate_limit_obeyed {
            // Priority only separates tenants that are both within limits.
            if t1.priority < t2.priority {
                return PREFER_1;
            } else if t1.priority > t2.priority {
                return PREFER_2;
            }
        } else {
            return PREFER_1;
        }
    } else if t2.rate_limit_obeyed {
        return PREFER_2;
    }
    if job1.arrival_time < job2.arrival_time {
        PREFER_1
    } else if job1.arrival_time > job2.arrival_time {
        PREFER_2
    } else {
        PREFER_EQUAL
    }
}

/// Pop a tenant's head job, fold occupancy, and charge its token buckets.
fn remove_job(state: &mut State, key: &str, now: Instant) -> Job {
    let tenant = state.tenants.get_mut(key).expect("best tenant exists");
    let mut job = tenant.pending.pop_front().expect("tenant has a head job");
    state.pending_job_count -= 1;
    if tenant.pending.is_empty() {
        tenant.occupancy += now.saturating_duration_since(tenant.last_occupancy_time);
    }
    job.rate_limit_obeyed = tenant.rate_limit_obeyed;
    for bucket in &mut tenant.buckets {
        // Floor at zero so best-effort traffic cannot dig an unbounded hole.
        bucket.tokens = (bucket.tokens - job.work).max(0.0);
    }
    tenant.rate_limit_obeyed = false;
    job
}

/// Downstream storage service as seen through the scheduler's handle pool.
pub trait StorageBackend: Send + Sync {
    /// Forward a job downstream over the given handle.
    fn forward(&self, handle: usize, job: &Job) -> JobReply;
    /// No-op ping used to keep idle handles alive and revive retired ones.
    fn keep_alive(&self, handle: usize) -> bool;
}

/// Worker pool that drains the scheduler into a storage backend, plus the
/// periodic keep-alive task.
pub struct WorkerPool {
    scheduler: Arc<Scheduler>,
    workers: Vec<JoinHandle<()>>,
    keep_alive_stop: Sender<()>,
    keep_alive_thread: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        scheduler: Arc<Scheduler>,
        backend: Arc<dyn StorageBackend>,
        workers: usize,
        keep_alive_period: Duration,
    ) -> WorkerPool {
        let workers: Vec<_> = (0..workers)
            .map(|_| {
                let scheduler = scheduler.clone();
                let backend = backend.clone();
                std::thread::spawn(move || worker_loop(scheduler, backend))
            })
            .collect();
        let (keep_alive_stop, stop_rx) = bounded::<()>(1);
        let keep_alive_thread = {
            let scheduler = scheduler.clone();
            let backend = backend.clone();
            std::thread::spawn(move || {
                while stop_rx.recv_timeout(keep_alive_period).is_err() {
                    scheduler.keep_alive(backend.as_ref());
                }
            })
        };
        WorkerPool {
            scheduler,
            workers,
            keep_alive_stop,
            keep_alive_thread: Some(keep_alive_thread),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        let _ = self.keep_alive_stop.send(());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(handle) = self.keep_alive_thread.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(scheduler: Arc<Scheduler>, backend: Arc<dyn StorageBackend>) {
    crate::threading::set_thread_priority(1);
    while let Some(job) = scheduler.next_job() {
        let result = backend.forward(job.handle, &job);
        match &result {
            Ok(_) => scheduler.return_handle(job.handle),
            Err(err) => {
                // The handle may be wedged; park it for keep-alive revival.
                warn!(handle = job.handle, error = %err, "downstream call failed");
                scheduler.retire_handle(job.handle);
            }
        }
        scheduler.complete(&job);
        if let Some(reply) = &job.reply {
            let _ = reply.send(result);
        }
    }
}
