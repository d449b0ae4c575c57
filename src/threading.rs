//! Thread priority and CPU affinity helpers for the enforcer worker pool.
use std::error::Error;

/// Raise the scheduling priority of the current thread so dispatch workers
/// preempt housekeeping work.
///
/// On Linux this maps the level onto real-time policies: 2 and above uses
/// `SCHED_FIFO`, 1 uses `SCHED_RR`, 0 stays at `SCHED_OTHER`. Real-time
/// policies need the right capabilities; the call fails silently without
/// them. Other platforms are a no-op.
pub fn set_thread_priority(priority: i32) {
    #[cfg(target_os = "linux")]
    {
        use libc::{
            pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO, SCHED_OTHER, SCHED_RR,
        };
        use std::mem;

        let (policy, sched_priority) = if priority >= 2 {
            (SCHED_FIFO, 70)
        } else if priority == 1 {
            (SCHED_RR, 30)
        } else {
            (SCHED_OTHER, 0)
        };

        unsafe {
            let mut param: sched_param = mem::zeroed();
            param.sched_priority = sched_priority;
            let _ = pthread_setschedparam(pthread_self(), policy, &param);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = priority;
    }
}

/// Pin the current thread to one core to keep the scheduler's hot path cache
/// resident. No-op where thread affinity is unavailable.
pub fn set_thread_core(core_id: usize) {
    #[cfg(target_os = "linux")]
    unsafe {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_ZERO};
        let mut set: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(core_id, &mut set);
        let _ = pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
    }
}

/// Restrict the process to its first few cores, keeping the dispatch threads
/// away from interrupt-heavy cores.
pub fn set_cpu_affinity(cores: usize) -> Result<(), Box<dyn Error>> {
    #[cfg(target_os = "linux")]
    {
        use libc::{cpu_set_t, getpid, sched_setaffinity, CPU_SET, CPU_ZERO};

        unsafe {
            let mut set: cpu_set_t = std::mem::zeroed();
            CPU_ZERO(&mut set);
            for core in 0..cores.max(1) {
                CPU_SET(core, &mut set);
            }
            let _ = sched_setaffinity(getpid(), std::mem::size_of::<cpu_set_t>(), &set);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = cores;
    }
    Ok(())
}
