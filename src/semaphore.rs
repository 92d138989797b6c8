// Copyright 2024 CeresDB Project Authors. Licensed under Apache-2.0.

//! Admission semaphore + resource tracker (component E, §4.E, §9).
//!
//! A process-wide (per-shard, §5) controller admitting new readers subject
//! to a count cap and a memory budget, with a FIFO waiting queue, a bounded
//! queue length, and per-request deadlines. [`Permit`] is reference-counted
//! so it can be shared between the restricted reader wrapper and every
//! buffer charged against it (§9 "Cyclic references").

use std::{
    collections::VecDeque,
    sync::{atomic::{AtomicU64, Ordering as AtomicOrdering}, Arc},
};

use tokio::time::Instant;

use crate::{
    error::{Result, TimeoutSnafu},
    key::SequenceNumber,
};

/// Producer of the error returned when the admission queue is saturated
/// (§4.E `queue_overflow_error`).
pub type QueueOverflowFactory = Arc<dyn Fn() -> crate::Error + Send + Sync>;

#[derive(Clone)]
pub struct SemaphoreConfig {
    pub max_count: i64,
    pub max_memory: i64,
    pub max_queue: usize,
    pub queue_overflow_error: QueueOverflowFactory,
}

struct Waiter {
    id: u64,
    base_cost: i64,
    notify: tokio::sync::oneshot::Sender<()>,
}

struct State {
    available_count: i64,
    available_memory: i64,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
}

struct Shared {
    config: SemaphoreConfig,
    state: std::sync::Mutex<State>,
    next_sequence: AtomicU64,
}

impl Shared {
    fn next_sequence(&self) -> SequenceNumber {
        self.next_sequence.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Returns `(count, memory)` to the budget, then wakes waiters from the
    /// front of the FIFO queue while the head request fits (§4.E).
    fn release(&self, count: i64, memory: i64) {
        let mut state = self.state.lock().unwrap();
        state.available_count += count;
        state.available_memory += memory;

        while let Some(head) = state.queue.front() {
            if state.available_count > 0 && state.available_memory - head.base_cost >= 0 {
                let head = state.queue.pop_front().expect("front() just succeeded");
                state.available_count -= 1;
                state.available_memory -= head.base_cost;
                // Ignore send failures: the waiter already timed out and
                // removed itself, in which case the budget it would have
                // used stays reserved for the next waiter in line.
                let _ = head.notify.send(());
            } else {
                break;
            }
        }
    }

    fn charge_memory(&self, bytes: i64) {
        // Over-commit is allowed: memory may go negative, but new admissions
        // are blocked until it returns to >= 0 (§4.E).
        let mut state = self.state.lock().unwrap();
        state.available_memory -= bytes;
    }

    fn release_memory(&self, bytes: i64) {
        self.release(0, bytes);
    }
}

/// Admits new readers subject to count/memory caps (§4.E).
#[derive(Clone)]
pub struct AdmissionSemaphore {
    shared: Arc<Shared>,
}

impl AdmissionSemaphore {
    pub fn new(config: SemaphoreConfig) -> Self {
        let state = State {
            available_count: config.max_count,
            available_memory: config.max_memory,
            queue: VecDeque::new(),
            next_waiter_id: 0,
        };
        AdmissionSemaphore {
            shared: Arc::new(Shared {
                config,
                state: std::sync::Mutex::new(state),
                next_sequence: AtomicU64::new(0),
            }),
        }
    }

    pub fn available_count(&self) -> i64 {
        self.shared.state.lock().unwrap().available_count
    }

    pub fn available_memory(&self) -> i64 {
        self.shared.state.lock().unwrap().available_memory
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    /// Deducts `(1, base_cost)` from the budget when admission is granted.
    /// If granting would drop count or memory below zero, the caller is
    /// enqueued FIFO; if the queue is already at `max_queue`, fails
    /// immediately with `queue_overflow_error`. If `deadline` elapses while
    /// waiting, fails with [`crate::Error::Timeout`] and the caller is
    /// removed from the queue (§4.E).
    pub async fn wait_admission(&self, base_cost: i64, deadline: Instant) -> Result<Permit> {
        let (id, rx) = {
            let mut state = self.shared.state.lock().unwrap();
            // FIFO fairness (P8): never let a newcomer cut in front of
            // requests that are already waiting, even if it alone would fit.
            if state.queue.is_empty()
                && state.available_count > 0
                && state.available_memory - base_cost >= 0
            {
                state.available_count -= 1;
                state.available_memory -= base_cost;
                let seq = self.shared.next_sequence();
                log::trace!("admission granted immediately, seq:{seq}, base_cost:{base_cost}");
                return Ok(Permit::new(self.shared.clone(), base_cost, seq));
            }

            if state.queue.len() >= self.shared.config.max_queue {
                log::error!("admission queue overflow, max_queue:{}", self.shared.config.max_queue);
                return Err((self.shared.config.queue_overflow_error)());
            }

            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = tokio::sync::oneshot::channel();
            state.queue.push_back(Waiter {
                id,
                base_cost,
                notify: tx,
            });
            log::debug!("admission request queued, waiter_id:{id}, base_cost:{base_cost}");
            (id, rx)
        };

        tokio::pin!(rx);
        tokio::select! {
            res = &mut rx => {
                res.expect("admission grantor never drops the sender without sending");
                let seq = self.shared.next_sequence();
                log::trace!("admission granted after wait, waiter_id:{id}, seq:{seq}");
                Ok(Permit::new(self.shared.clone(), base_cost, seq))
            }
            _ = tokio::time::sleep_until(deadline) => {
                let removed = {
                    let mut state = self.shared.state.lock().unwrap();
                    let before = state.queue.len();
                    state.queue.retain(|w| w.id != id);
                    state.queue.len() != before
                };
                if removed {
                    log::debug!("admission wait timed out, waiter_id:{id}");
                    TimeoutSnafu { what: "wait_admission" }.fail()
                } else {
                    // Raced with a grant: the budget was already deducted on
                    // our behalf, so honour it instead of leaking it.
                    match rx.try_recv() {
                        Ok(()) => {
                            let seq = self.shared.next_sequence();
                            Ok(Permit::new(self.shared.clone(), base_cost, seq))
                        }
                        Err(_) => TimeoutSnafu { what: "wait_admission" }.fail(),
                    }
                }
            }
        }
    }
}

struct PermitInner {
    shared: Arc<Shared>,
    base_cost: i64,
    sequence: SequenceNumber,
}

impl Drop for PermitInner {
    fn drop(&mut self) {
        log::trace!("releasing permit, seq:{}, base_cost:{}", self.sequence, self.base_cost);
        self.shared.release(1, self.base_cost);
    }
}

/// Reference-counted ticket representing admitted use of the semaphore's
/// budget (§4.E, §9). Cloning a permit does not grant additional budget --
/// it shares ownership of the one grant, which is released once every clone
/// is dropped. This is how a tracked buffer can outlive the reader that
/// created it while still keeping the underlying permit alive (§9).
#[derive(Clone)]
pub struct Permit(Arc<PermitInner>);

impl std::fmt::Debug for Permit {
    // Hand-written rather than derived: `Shared` carries the
    // `queue_overflow_error` factory (a boxed `Fn`), which has no `Debug`
    // impl to derive through. `Result::unwrap_err` on a granted permit
    // (tests asserting the *error* branch) needs this to compile.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("base_cost", &self.0.base_cost)
            .field("sequence", &self.0.sequence)
            .finish()
    }
}

impl Permit {
    fn new(shared: Arc<Shared>, base_cost: i64, sequence: SequenceNumber) -> Self {
        Permit(Arc::new(PermitInner { shared, base_cost, sequence }))
    }

    pub fn base_cost(&self) -> i64 {
        self.0.base_cost
    }

    /// Diagnostic-only identifier assigned at grant time; never used for
    /// ordering (§2 ambient `SequenceNumber`).
    pub fn sequence(&self) -> SequenceNumber {
        self.0.sequence
    }

    /// Charges `bytes` against the semaphore's shared memory budget on
    /// behalf of a buffer acquired through this permit (§4.E `track`).
    pub(crate) fn charge(&self, bytes: i64) {
        self.0.shared.charge_memory(bytes);
    }

    /// Returns `bytes` previously charged via [`Self::charge`] (§4.E).
    pub(crate) fn release_charge(&self, bytes: i64) {
        self.0.shared.release_memory(bytes);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::QueueOverflowSnafu;

    fn overflow_factory() -> QueueOverflowFactory {
        Arc::new(|| QueueOverflowSnafu { max_queue: 0usize }.build())
    }

    fn config(max_count: i64, max_memory: i64, max_queue: usize) -> SemaphoreConfig {
        SemaphoreConfig {
            max_count,
            max_memory,
            max_queue,
            queue_overflow_error: overflow_factory(),
        }
    }

    fn deadline(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn conservation_holds_after_grant_and_release() {
        let sem = AdmissionSemaphore::new(config(2, 16384, 4));
        let permit = sem.wait_admission(1000, deadline(1)).await.unwrap();
        assert_eq!(sem.available_count(), 1);
        assert_eq!(sem.available_memory(), 15384);
        drop(permit);
        assert_eq!(sem.available_count(), 2);
        assert_eq!(sem.available_memory(), 16384);
    }

    #[tokio::test]
    async fn queue_overflow_when_queue_is_full() {
        let sem = AdmissionSemaphore::new(config(1, 16384, 0));
        let _p1 = sem.wait_admission(1, deadline(1)).await.unwrap();
        let err = sem.wait_admission(1, deadline(1)).await.unwrap_err();
        assert!(matches!(err, crate::Error::QueueOverflow { .. }));
    }

    #[tokio::test]
    async fn timeout_while_waiting_releases_queue_slot() {
        let sem = AdmissionSemaphore::new(config(1, 16384, 4));
        let _p1 = sem.wait_admission(1, deadline(5)).await.unwrap();

        let err = sem
            .wait_admission(1, Instant::now() + Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Timeout { .. }));
        assert_eq!(sem.queue_len(), 0);
    }

    #[tokio::test]
    async fn semaphore_pressure_scenario_s5() {
        // S1 of the semaphore pressure scenario: max_count=2, max_memory=16384.
        let sem = AdmissionSemaphore::new(config(2, 16384, 8));
        let r1 = sem.wait_admission(1, deadline(5)).await.unwrap();
        let r2 = sem.wait_admission(1, deadline(5)).await.unwrap();

        let sem_clone = sem.clone();
        let waiter = tokio::spawn(async move { sem_clone.wait_admission(1, deadline(5)).await });
        tokio::task::yield_now().await;
        assert_eq!(sem.queue_len(), 1);

        drop(r1);
        let r3 = waiter.await.unwrap().unwrap();
        assert_eq!(sem.queue_len(), 0);

        drop(r2);
        drop(r3);
        assert_eq!(sem.available_memory(), 16384);
        assert_eq!(sem.available_count(), 2);
    }

    #[tokio::test]
    async fn fifo_fairness_grants_in_arrival_order() {
        let sem = AdmissionSemaphore::new(config(1, 16384, 8));
        let _held = sem.wait_admission(1, deadline(5)).await.unwrap();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let sem = sem.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let permit = sem.wait_admission(1, deadline(5)).await.unwrap();
                order.lock().unwrap().push(i);
                permit
            }));
            tokio::task::yield_now().await;
        }

        drop(_held);
        for h in handles {
            // Drop each permit as soon as it is granted so the next queued
            // waiter can be admitted in turn.
            drop(h.await.unwrap());
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
