//! Scheduler behavior under a real worker pool and the starvation guards.

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use slogate::descriptors::RateLimiterSpec;
use slogate::estimator::{Estimator, NetworkParams};
use slogate::scheduler::{Job, JobClass, JobReply, Scheduler, SchedulerConfig, StorageBackend, WorkerPool};
use std::sync::Arc;
use std::time::Duration;

fn byte_estimator() -> Estimator {
    Estimator::NetworkOut(NetworkParams {
        non_data_constant: 0.0,
        non_data_factor: 1.0,
        data_constant: 0.0,
        data_factor: 1.0,
    })
}

/// Backend that records every forwarded job in arrival order.
#[derive(Default)]
struct RecordingBackend {
    log: Mutex<Vec<(String, JobClass, u64)>>,
}

impl StorageBackend for RecordingBackend {
    fn forward(&self, _handle: usize, job: &Job) -> JobReply {
        self.log.lock().push((job.tenant.clone(), job.class, job.id));
        Ok(job.payload.clone())
    }

    fn keep_alive(&self, _handle: usize) -> bool {
        true
    }
}

#[test]
fn worker_pool_preserves_per_tenant_fifo_per_class() {
    let scheduler = Arc::new(Scheduler::new(
        vec![0],
        SchedulerConfig::default(),
        byte_estimator(),
    ));
    let backend = Arc::new(RecordingBackend::default());
    let (reply_tx, reply_rx) = unbounded();

    // one worker and one handle make the forwarding order the dispatch order
    let pool = WorkerPool::new(
        scheduler.clone(),
        backend.clone(),
        1,
        Duration::from_secs(60),
    );

    let mut submitted: Vec<(JobClass, u64)> = Vec::new();
    for round in 0..4u64 {
        for class in [JobClass::Read, JobClass::Write, JobClass::Immediate] {
            let id = scheduler.submit("t0", class, 100 + round, vec![round as u8], Some(reply_tx.clone()));
            submitted.push((class, id));
        }
    }
    for _ in 0..submitted.len() {
        reply_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("every job replies")
            .expect("downstream succeeds");
    }
    drop(pool);

    let log = backend.log.lock();
    assert_eq!(log.len(), submitted.len());
    for class in [JobClass::Read, JobClass::Write, JobClass::Immediate] {
        let dispatched: Vec<u64> = log
            .iter()
            .filter(|(_, c, _)| *c == class)
            .map(|(_, _, id)| *id)
            .collect();
        let expected: Vec<u64> = submitted
            .iter()
            .filter(|(c, _)| *c == class)
            .map(|(_, id)| *id)
            .collect();
        assert_eq!(dispatched, expected, "{class:?} order");
    }
}

#[test]
fn multiple_workers_drain_multiple_tenants() {
    let scheduler = Arc::new(Scheduler::new(
        (0..4).collect(),
        SchedulerConfig::default(),
        byte_estimator(),
    ));
    let backend = Arc::new(RecordingBackend::default());
    let (reply_tx, reply_rx) = unbounded();
    let pool = WorkerPool::new(
        scheduler.clone(),
        backend.clone(),
        4,
        Duration::from_secs(60),
    );

    scheduler.update_tenant("gold", 0, &[RateLimiterSpec { rate: 1e9, burst: 1e9 }]);
    scheduler.update_tenant("dust", 3, &[]);
    let total = 40;
    for i in 0..total {
        let tenant = if i % 2 == 0 { "gold" } else { "dust" };
        scheduler.submit(tenant, JobClass::Read, 512, vec![], Some(reply_tx.clone()));
    }
    for _ in 0..total {
        reply_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("every job replies")
            .expect("downstream succeeds");
    }
    drop(pool);
    assert_eq!(backend.log.lock().len(), total);
}

#[test]
fn starvation_guard_bounds_reads_behind_a_stuck_high_priority_job() {
    let mut config = SchedulerConfig::default();
    config.max_outstanding_read_jobs = 4;
    let scheduler = Scheduler::new((0..64).collect(), config, byte_estimator());
    scheduler.update_tenant("gold", 0, &[]);
    scheduler.update_tenant("dust", 1, &[]);

    // gold's job dispatches and stays outstanding
    scheduler.submit("gold", JobClass::Read, 8, vec![], None);
    let gold_job = scheduler.try_next_job().unwrap();
    assert_eq!(gold_job.tenant, "gold");

    // dust keeps submitting; each dispatched job completes immediately so
    // only the sequence window, not the outstanding cap, can stop it
    for _ in 0..10 {
        scheduler.submit("dust", JobClass::Read, 8, vec![], None);
    }
    let mut dispatched = 0;
    while let Some(job) = scheduler.try_next_job() {
        assert_eq!(job.tenant, "dust");
        scheduler.complete(&job);
        scheduler.return_handle(job.handle);
        dispatched += 1;
    }
    // no more than the configured window of later reads got ahead
    assert_eq!(dispatched, 4);

    // completing the high-priority job releases the guard
    scheduler.complete(&gold_job);
    scheduler.return_handle(gold_job.handle);
    let mut released = 0;
    while let Some(job) = scheduler.try_next_job() {
        scheduler.complete(&job);
        scheduler.return_handle(job.handle);
        released += 1;
    }
    assert_eq!(dispatched + released, 10);
}

#[test]
fn starvation_guard_bounds_read_bytes_behind_a_stuck_job() {
    let mut config = SchedulerConfig::default();
    config.max_outstanding_read_bytes = 100;
    config.max_outstanding_read_jobs = 1000;
    let scheduler = Scheduler::new((0..64).collect(), config, byte_estimator());
    scheduler.update_tenant("gold", 0, &[]);
    scheduler.update_tenant("dust", 1, &[]);

    scheduler.submit("gold", JobClass::Read, 8, vec![], None);
    let gold_job = scheduler.try_next_job().unwrap();

    for _ in 0..10 {
        scheduler.submit("dust", JobClass::Read, 30, vec![], None);
    }
    let mut bytes = 0;
    while let Some(job) = scheduler.try_next_job() {
        bytes += job.request_size;
        scheduler.complete(&job);
        scheduler.return_handle(job.handle);
    }
    // three 30-byte reads bring the sequence counter to 98 bytes; one more
    // would cross the 100-byte window behind gold's position
    assert_eq!(bytes, 90);

    scheduler.complete(&gold_job);
    scheduler.return_handle(gold_job.handle);
    assert!(scheduler.try_next_job().is_some());
}

#[test]
fn write_caps_gate_dispatch_like_read_caps() {
    let mut config = SchedulerConfig::default();
    config.max_outstanding_write_jobs = 2;
    let scheduler = Scheduler::new((0..8).collect(), config, byte_estimator());
    for _ in 0..3 {
        scheduler.submit("t0", JobClass::Write, 8, vec![], None);
    }
    let first = scheduler.try_next_job().unwrap();
    let _second = scheduler.try_next_job().unwrap();
    assert!(scheduler.try_next_job().is_none());
    scheduler.complete(&first);
    scheduler.return_handle(first.handle);
    assert!(scheduler.try_next_job().is_some());
}

#[test]
fn failed_downstream_calls_retire_the_handle_and_report_the_error() {
    struct FailingBackend;
    impl StorageBackend for FailingBackend {
        fn forward(&self, _handle: usize, _job: &Job) -> JobReply {
            Err("downstream timeout".to_owned())
        }
        fn keep_alive(&self, _handle: usize) -> bool {
            false
        }
    }
    let scheduler = Arc::new(Scheduler::new(
        vec![0],
        SchedulerConfig::default(),
        byte_estimator(),
    ));
    let (reply_tx, reply_rx) = unbounded();
    let pool = WorkerPool::new(
        scheduler.clone(),
        Arc::new(FailingBackend),
        1,
        Duration::from_secs(60),
    );
    scheduler.submit("t0", JobClass::Read, 8, vec![], Some(reply_tx));
    let reply = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(reply.is_err());
    drop(pool);
    // the sole handle was retired, so nothing else can dispatch
    scheduler.submit("t0", JobClass::Read, 8, vec![], None);
    assert!(scheduler.try_next_job().is_none());
}
