//! Instance pool: a bounded set of reusable annotator contexts.
//!
//! An [`Instance`] is the lease a worker must hold before invoking the
//! annotator; it carries the identity and health history that survive across
//! files. The child process itself is per-invocation and owned by the
//! invoker, so live children never exceed the pool size: one lease, one
//! worker, one child.
//!
//! Invariants:
//! - at most `max_size` instances exist at any time
//! - a leased instance has exactly one owner until released
//! - waiting leases are served in FIFO order (ticket numbers)
//!
//! Health policy: two consecutive timeouts, three consecutive failures, or an
//! explicit unhealthy release retire the instance; it is replaced lazily on
//! the next lease. Instances also retire after a configured number of files.

use crate::error::JobError;
use notemill_protocol::ErrorKind;
use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

const MAX_CONSECUTIVE_FAILURES: u32 = 3;
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 2;

/// A reusable annotator context. Single-owner while leased.
#[derive(Debug)]
pub struct Instance {
    id: u32,
    files_processed: u32,
    consecutive_failures: u32,
    consecutive_timeouts: u32,
}

impl Instance {
    fn new(id: u32) -> Self {
        Self {
            id,
            files_processed: 0,
            consecutive_failures: 0,
            consecutive_timeouts: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn files_processed(&self) -> u32 {
        self.files_processed
    }
}

/// What happened to the job the lease was used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Completed,
    Failed(ErrorKind),
    /// The worker observed the annotator child die abnormally (non-zero
    /// exit, signal); retire the instance regardless of history.
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    pub live: usize,
    pub idle: usize,
    pub created: u64,
    pub recycled: u64,
}

struct PoolState {
    idle: VecDeque<Instance>,
    /// Leased + idle.
    live: usize,
    max_size: usize,
    next_instance_id: u32,
    next_ticket: u64,
    now_serving: u64,
    abandoned: HashSet<u64>,
    shutting_down: bool,
    created: u64,
    recycled: u64,
}

pub struct InstancePool {
    state: Mutex<PoolState>,
    available: Condvar,
    recycle_limit: u32,
}

impl InstancePool {
    pub fn new(max_size: usize, recycle_limit: u32) -> Self {
        Self {
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                live: 0,
                max_size: max_size.max(1),
                next_instance_id: 0,
                next_ticket: 0,
                now_serving: 0,
                abandoned: HashSet::new(),
                shutting_down: false,
                created: 0,
                recycled: 0,
            }),
            available: Condvar::new(),
            recycle_limit,
        }
    }

    /// Lease an idle instance, creating one while under capacity. Blocks up
    /// to `timeout` in FIFO order behind earlier waiters.
    pub fn lease(&self, timeout: Duration) -> Result<Instance, JobError> {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .state
            .lock()
            .map_err(|_| JobError::Other("instance pool lock poisoned".into()))?;

        let ticket = state.next_ticket;
        state.next_ticket += 1;

        loop {
            // Skip over tickets whose waiters gave up.
            while {
                let now_serving = state.now_serving;
                state.abandoned.remove(&now_serving)
            } {
                state.now_serving += 1;
            }

            if state.shutting_down {
                self.abandon(&mut state, ticket);
                return Err(JobError::Other("instance pool is shut down".into()));
            }

            if state.now_serving == ticket {
                if let Some(instance) = state.idle.pop_front() {
                    state.now_serving += 1;
                    self.available.notify_all();
                    return Ok(instance);
                }
                if state.live < state.max_size {
                    state.live += 1;
                    state.created += 1;
                    let id = state.next_instance_id;
                    state.next_instance_id += 1;
                    state.now_serving += 1;
                    self.available.notify_all();
                    debug!("Created annotator instance {id}");
                    return Ok(Instance::new(id));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.abandon(&mut state, ticket);
                return Err(JobError::PoolExhausted(timeout));
            }
            let (guard, _timed_out) = self
                .available
                .wait_timeout(state, remaining)
                .map_err(|_| JobError::Other("instance pool lock poisoned".into()))?;
            state = guard;
        }
    }

    /// Return a lease. Healthy instances go back to the idle queue; retired
    /// ones are dropped and replaced lazily on the next lease. Never blocks
    /// beyond the internal mutex.
    pub fn release(&self, mut instance: Instance, outcome: LeaseOutcome) {
        instance.files_processed += 1;
        let mut force_retire = false;
        match outcome {
            LeaseOutcome::Completed => {
                instance.consecutive_failures = 0;
                instance.consecutive_timeouts = 0;
            }
            LeaseOutcome::Failed(kind) => {
                instance.consecutive_failures += 1;
                if kind == ErrorKind::Timeout {
                    instance.consecutive_timeouts += 1;
                } else {
                    instance.consecutive_timeouts = 0;
                }
            }
            LeaseOutcome::Unhealthy => force_retire = true,
        }

        let unhealthy = force_retire
            || instance.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS
            || instance.consecutive_failures >= MAX_CONSECUTIVE_FAILURES;
        let worn_out = self.recycle_limit > 0 && instance.files_processed >= self.recycle_limit;

        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.shutting_down || state.live > state.max_size || unhealthy || worn_out {
            debug!(
                "Retiring instance {} (unhealthy={}, files={})",
                instance.id, unhealthy, instance.files_processed
            );
            state.live = state.live.saturating_sub(1);
            state.recycled += 1;
        } else {
            state.idle.push_back(instance);
        }
        self.available.notify_all();
    }

    /// Grow or shrink capacity. Removed capacity drains: surplus idle
    /// instances retire now, surplus leased ones on release.
    pub fn resize(&self, new_size: usize) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.max_size = new_size.max(1);
        while state.live > state.max_size {
            if state.idle.pop_back().is_none() {
                break;
            }
            state.live -= 1;
            state.recycled += 1;
        }
        self.available.notify_all();
    }

    /// Refuse new leases, wait for in-flight leases to return, then drop all
    /// instances.
    pub fn shutdown(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.shutting_down = true;
        self.available.notify_all();
        while state.live > state.idle.len() {
            let Ok(guard) = self.available.wait(state) else {
                return;
            };
            state = guard;
        }
        state.live = 0;
        state.idle.clear();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().expect("pool lock poisoned");
        PoolStats {
            max_size: state.max_size,
            live: state.live,
            idle: state.idle.len(),
            created: state.created,
            recycled: state.recycled,
        }
    }

    fn abandon(&self, state: &mut PoolState, ticket: u64) {
        if state.now_serving == ticket {
            state.now_serving += 1;
            self.available.notify_all();
        } else {
            state.abandoned.insert(ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn test_lease_up_to_capacity_then_exhausted() {
        let pool = InstancePool::new(2, 100);
        let a = pool.lease(SHORT).unwrap();
        let b = pool.lease(SHORT).unwrap();
        assert_ne!(a.id(), b.id());
        let err = pool.lease(SHORT).unwrap_err();
        assert!(matches!(err, JobError::PoolExhausted(_)));
        pool.release(a, LeaseOutcome::Completed);
        pool.release(b, LeaseOutcome::Completed);
    }

    #[test]
    fn test_released_instance_is_reused() {
        let pool = InstancePool::new(1, 100);
        let a = pool.lease(SHORT).unwrap();
        let id = a.id();
        pool.release(a, LeaseOutcome::Completed);
        let again = pool.lease(SHORT).unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.files_processed(), 1);
    }

    #[test]
    fn test_recycle_after_file_limit() {
        let pool = InstancePool::new(1, 2);
        let a = pool.lease(SHORT).unwrap();
        pool.release(a, LeaseOutcome::Completed);
        let a = pool.lease(SHORT).unwrap();
        pool.release(a, LeaseOutcome::Completed); // second file hits the limit
        let fresh = pool.lease(SHORT).unwrap();
        assert_eq!(fresh.files_processed(), 0);
        assert_eq!(pool.stats().recycled, 1);
    }

    #[test]
    fn test_three_consecutive_failures_retire() {
        let pool = InstancePool::new(1, 100);
        let mut id = None;
        for _ in 0..3 {
            let inst = pool.lease(SHORT).unwrap();
            id = Some(inst.id());
            pool.release(inst, LeaseOutcome::Failed(ErrorKind::Io));
        }
        let fresh = pool.lease(SHORT).unwrap();
        assert_ne!(Some(fresh.id()), id);
    }

    #[test]
    fn test_two_consecutive_timeouts_retire() {
        let pool = InstancePool::new(1, 100);
        let inst = pool.lease(SHORT).unwrap();
        let first_id = inst.id();
        pool.release(inst, LeaseOutcome::Failed(ErrorKind::Timeout));
        let inst = pool.lease(SHORT).unwrap();
        assert_eq!(inst.id(), first_id);
        pool.release(inst, LeaseOutcome::Failed(ErrorKind::Timeout));
        let fresh = pool.lease(SHORT).unwrap();
        assert_ne!(fresh.id(), first_id);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let pool = InstancePool::new(1, 100);
        let inst = pool.lease(SHORT).unwrap();
        let id = inst.id();
        pool.release(inst, LeaseOutcome::Failed(ErrorKind::Io));
        let inst = pool.lease(SHORT).unwrap();
        pool.release(inst, LeaseOutcome::Completed);
        let inst = pool.lease(SHORT).unwrap();
        pool.release(inst, LeaseOutcome::Failed(ErrorKind::Io));
        // Streak was broken; instance survives.
        let inst = pool.lease(SHORT).unwrap();
        assert_eq!(inst.id(), id);
        pool.release(inst, LeaseOutcome::Completed);
    }

    #[test]
    fn test_explicit_unhealthy_retires_immediately() {
        let pool = InstancePool::new(1, 100);
        let inst = pool.lease(SHORT).unwrap();
        let id = inst.id();
        pool.release(inst, LeaseOutcome::Unhealthy);
        let fresh = pool.lease(SHORT).unwrap();
        assert_ne!(fresh.id(), id);
    }

    #[test]
    fn test_fifo_ordering_of_waiters() {
        let pool = Arc::new(InstancePool::new(1, 100));
        let held = pool.lease(SHORT).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for tag in 0..2u32 {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            handles.push(std::thread::spawn(move || {
                let inst = pool.lease(Duration::from_secs(5)).unwrap();
                order.lock().unwrap().push(tag);
                std::thread::sleep(Duration::from_millis(20));
                pool.release(inst, LeaseOutcome::Completed);
            }));
            // Stagger so ticket order matches spawn order.
            std::thread::sleep(Duration::from_millis(100));
        }

        pool.release(held, LeaseOutcome::Completed);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_concurrent_leases_never_exceed_capacity() {
        let pool = Arc::new(InstancePool::new(4, 1000));
        let active = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            let active = Arc::clone(&active);
            let high_water = Arc::clone(&high_water);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    let inst = pool.lease(Duration::from_secs(10)).unwrap();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(1));
                    active.fetch_sub(1, Ordering::SeqCst);
                    pool.release(inst, LeaseOutcome::Completed);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(high_water.load(Ordering::SeqCst) <= 4);
    }

    #[test]
    fn test_resize_shrink_and_grow() {
        let pool = InstancePool::new(2, 100);
        let a = pool.lease(SHORT).unwrap();
        let b = pool.lease(SHORT).unwrap();
        pool.resize(1);
        // Surplus lease retires on release.
        pool.release(a, LeaseOutcome::Completed);
        pool.release(b, LeaseOutcome::Completed);
        assert_eq!(pool.stats().live, 1);

        pool.resize(3);
        let _x = pool.lease(SHORT).unwrap();
        let _y = pool.lease(SHORT).unwrap();
        let _z = pool.lease(SHORT).unwrap();
        assert!(pool.lease(SHORT).is_err());
    }

    #[test]
    fn test_shutdown_refuses_new_leases() {
        let pool = InstancePool::new(1, 100);
        pool.shutdown();
        assert!(pool.lease(SHORT).is_err());
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn test_shutdown_waits_for_inflight_lease() {
        let pool = Arc::new(InstancePool::new(1, 100));
        let inst = pool.lease(SHORT).unwrap();
        let pool2 = Arc::clone(&pool);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            pool2.release(inst, LeaseOutcome::Completed);
        });
        pool.shutdown();
        assert_eq!(pool.stats().live, 0);
        handle.join().unwrap();
    }
}
