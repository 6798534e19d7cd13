//! The pool dispatcher: a single task owning all scheduling state.
//!
//! Every mutation of pool state happens on this task, fed by one event
//! channel. Submissions, worker replies, watchdog timers and recovery
//! timers all arrive as events, so no lock is ever needed and each event is
//! processed to completion before the next.
//!
//! Scheduling policy: LIFO over idle workers (most-recently-released first),
//! FIFO over queued tasks. After every event a scheduling pass refills the
//! worker set to the configured concurrency and dispatches while both a
//! task and an idle worker are available.
//!
//! A failing pass (worker spawn failure) drives a bounded recovery state
//! machine: quarantine everything, retry after an exponentially growing
//! backoff, and latch a fatal error once the failure threshold is reached.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use ytcipher_common::CipherError;

use crate::pool::task_queue::{Task, TaskQueue};
use crate::pool::worker::{EvalOutcome, WorkerHandle, WorkerId};
use crate::pool::PoolConfig;
use crate::runtime::evaluator::EvaluatorFactory;

/// Events consumed by the dispatcher. Everything that can happen to the
/// pool arrives through this enum.
#[derive(Debug)]
pub enum PoolEvent {
    /// A new task from a submitter.
    Submit(Task),
    /// A worker finished initializing and can take work.
    Ready(WorkerId),
    /// A worker finished (or failed) one evaluation.
    Reply {
        worker: WorkerId,
        outcome: EvalOutcome,
    },
    /// A worker thread exited. `error` is set when construction failed.
    Exited {
        worker: WorkerId,
        error: Option<String>,
    },
    /// The in-flight watchdog for a dispatch fired.
    InFlightTimeout { worker: WorkerId, epoch: u64 },
    /// The recovery backoff timer elapsed.
    RecoveryElapsed,
    /// Snapshot request (tests, diagnostics).
    Stats(oneshot::Sender<PoolStats>),
}

/// Point-in-time view of pool state.
#[derive(Clone, Debug)]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub quarantined: usize,
    pub recovery_failures: u32,
    pub backoff: Duration,
    pub fatal: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Spawning,
    Idle,
    InFlight,
}

struct WorkerSlot {
    handle: WorkerHandle,
    messages_remaining: u32,
    quarantined: bool,
    phase: Phase,
}

struct InFlight {
    reply: oneshot::Sender<Result<String, CipherError>>,
    epoch: u64,
    /// Dropping this cancels the watchdog timer for the dispatch.
    _cancel: oneshot::Sender<()>,
}

pub(crate) struct Dispatcher {
    config: PoolConfig,
    factory: EvaluatorFactory,
    events: mpsc::UnboundedSender<PoolEvent>,

    workers: HashMap<WorkerId, WorkerSlot>,
    idle: Vec<WorkerId>,
    queue: TaskQueue,
    in_flight: HashMap<WorkerId, InFlight>,

    pool_fatal: Option<String>,
    recovery_failures: u32,
    backoff: Duration,
    recovery_pending: bool,

    next_worker_id: u64,
    next_epoch: u64,
}

impl Dispatcher {
    pub fn new(
        config: PoolConfig,
        factory: EvaluatorFactory,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        let backoff = config.recovery_backoff_base;
        Self {
            config,
            factory,
            events,
            workers: HashMap::new(),
            idle: Vec::new(),
            queue: TaskQueue::new(),
            in_flight: HashMap::new(),
            pool_fatal: None,
            recovery_failures: 0,
            backoff,
            recovery_pending: false,
            next_worker_id: 0,
            next_epoch: 0,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PoolEvent>) {
        // Eager initialization: bring the pool to full strength before the
        // first submission.
        self.schedule();

        while let Some(event) = rx.recv().await {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Submit(task) => self.on_submit(task),
            PoolEvent::Ready(worker) => self.on_ready(worker),
            PoolEvent::Reply { worker, outcome } => self.on_reply(worker, outcome),
            PoolEvent::Exited { worker, error } => self.on_exited(worker, error),
            PoolEvent::InFlightTimeout { worker, epoch } => self.on_timeout(worker, epoch),
            PoolEvent::RecoveryElapsed => {
                self.recovery_pending = false;
                self.schedule();
            }
            PoolEvent::Stats(tx) => {
                let _ = tx.send(self.stats());
            }
        }
    }

    fn on_submit(&mut self, task: Task) {
        if let Some(cause) = &self.pool_fatal {
            task.reject(CipherError::PoolFatal(cause.clone()));
            return;
        }
        self.queue.push(task);
        self.schedule();
    }

    fn on_ready(&mut self, worker: WorkerId) {
        let Some(slot) = self.workers.get_mut(&worker) else {
            return; // retired while spawning
        };
        if slot.quarantined {
            self.retire(worker);
            return;
        }
        slot.phase = Phase::Idle;
        self.idle.push(worker);

        // A worker coming up is the proof that refills work again; spawning
        // a thread alone is not, since evaluator construction happens inside
        // it and reports back asynchronously.
        if self.recovery_failures > 0 {
            tracing::info!(
                failures = self.recovery_failures,
                "worker initialized; resetting recovery state"
            );
            self.recovery_failures = 0;
            self.backoff = self.config.recovery_backoff_base;
        }

        self.schedule();
    }

    fn on_reply(&mut self, worker: WorkerId, outcome: EvalOutcome) {
        let Some(record) = self.in_flight.remove(&worker) else {
            if self.workers.contains_key(&worker) {
                tracing::warn!(worker = worker.0, "stray reply from worker with no in-flight task");
                self.retire(worker);
                self.schedule();
            }
            return;
        };

        match outcome {
            EvalOutcome::Output(output) => {
                let _ = record.reply.send(Ok(output));
                self.release(worker);
            }
            EvalOutcome::ScriptError { message, stack } => {
                let _ = record
                    .reply
                    .send(Err(CipherError::WorkerReported { message, stack }));
                self.zero_budget(worker);
                self.release(worker);
            }
            EvalOutcome::Malformed(desc) => {
                let _ = record.reply.send(Err(CipherError::WorkerProtocol(desc)));
                self.zero_budget(worker);
                self.release(worker);
            }
            EvalOutcome::Panicked(message) => {
                let _ = record.reply.send(Err(CipherError::WorkerCrashed(message)));
                self.retire(worker);
            }
        }
        self.schedule();
    }

    fn on_exited(&mut self, worker: WorkerId, error: Option<String>) {
        let Some(slot) = self.workers.get(&worker) else {
            return; // already retired; late exit notification
        };

        if slot.phase == Phase::Spawning {
            // Evaluator construction failed: this is a refill failure, not a
            // task failure. Feed it to the recovery machine.
            let cause = error.unwrap_or_else(|| "worker exited during spawn".to_string());
            self.retire(worker);
            self.enter_recovery(cause);
            return;
        }

        if let Some(record) = self.in_flight.remove(&worker) {
            let message =
                error.unwrap_or_else(|| "worker thread exited unexpectedly".to_string());
            let _ = record.reply.send(Err(CipherError::WorkerCrashed(message)));
        }
        self.retire(worker);
        self.schedule();
    }

    fn on_timeout(&mut self, worker: WorkerId, epoch: u64) {
        let current = self.in_flight.get(&worker).is_some_and(|r| r.epoch == epoch);
        if !current {
            return; // stale watchdog for a dispatch that already settled
        }
        tracing::warn!(worker = worker.0, "in-flight timeout; retiring worker");
        if let Some(record) = self.in_flight.remove(&worker) {
            let _ = record.reply.send(Err(CipherError::WorkerTimeout));
        }
        self.retire(worker);
        self.schedule();
    }

    /// One coalesced refill-and-dispatch pass. A failing pass enters
    /// recovery; recovery state resets once a fresh worker reports ready.
    fn schedule(&mut self) {
        if self.pool_fatal.is_some() || self.recovery_pending {
            return;
        }
        if let Err(cause) = self.try_schedule() {
            self.enter_recovery(cause);
        }
    }

    fn try_schedule(&mut self) -> Result<(), String> {
        loop {
            self.ensure_capacity()?;
            if !self.dispatch_ready() {
                return Ok(());
            }
        }
    }

    fn ensure_capacity(&mut self) -> Result<(), String> {
        while self.live_worker_count() < self.config.concurrency {
            let id = WorkerId(self.next_worker_id);
            self.next_worker_id += 1;
            let handle = WorkerHandle::spawn(id, self.factory.clone(), self.events.clone())
                .map_err(|e| format!("failed to spawn worker thread: {e}"))?;
            self.workers.insert(
                id,
                WorkerSlot {
                    handle,
                    messages_remaining: self.config.messages_limit,
                    quarantined: false,
                    phase: Phase::Spawning,
                },
            );
            tracing::debug!(worker = id.0, "spawned worker");
        }
        Ok(())
    }

    /// Dispatches queued tasks onto idle workers. Returns `true` when a
    /// worker was retired mid-pass and the caller should refill again.
    fn dispatch_ready(&mut self) -> bool {
        while !self.queue.is_empty() {
            let Some(worker) = self.idle.pop() else {
                return false;
            };

            let usable = self
                .workers
                .get(&worker)
                .is_some_and(|slot| !slot.quarantined && slot.messages_remaining > 0);
            if !usable {
                self.retire(worker);
                return true;
            }

            let Some(task) = self.queue.shift() else {
                self.idle.push(worker);
                return false;
            };

            if task.enqueued_at.elapsed() > self.config.max_task_age {
                tracing::warn!("rejecting task that aged out in the queue");
                task.reject(CipherError::QueueAgeExceeded);
                self.idle.push(worker);
                continue;
            }

            if self.dispatch(worker, task) {
                return true;
            }
        }
        false
    }

    /// Sends one task to one worker. Returns `true` when the send failed
    /// and the worker was retired.
    fn dispatch(&mut self, worker: WorkerId, task: Task) -> bool {
        let Task { input, reply, .. } = task;

        let send_failed = match self.workers.get_mut(&worker) {
            Some(slot) => {
                slot.messages_remaining -= 1;
                let failed = slot.handle.send(input).is_err();
                if failed {
                    slot.messages_remaining = 0;
                } else {
                    slot.phase = Phase::InFlight;
                }
                failed
            }
            // Cannot happen on the single-owner dispatcher; fail the task
            // rather than lose it.
            None => true,
        };

        if send_failed {
            let _ = reply.send(Err(CipherError::DispatchFailed));
            self.retire(worker);
            return true;
        }

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        self.in_flight.insert(
            worker,
            InFlight {
                reply,
                epoch,
                _cancel: cancel_tx,
            },
        );

        let events = self.events.clone();
        let timeout = self.config.in_flight_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let _ = events.send(PoolEvent::InFlightTimeout { worker, epoch });
                }
                _ = cancel_rx => {}
            }
        });

        false
    }

    /// Releases a worker after its reply was handled: quarantined workers
    /// retire, exhausted budgets retire, everyone else returns to idle.
    fn release(&mut self, worker: WorkerId) {
        let Some(slot) = self.workers.get_mut(&worker) else {
            return;
        };
        if slot.quarantined || slot.messages_remaining == 0 {
            self.retire(worker);
            return;
        }
        slot.phase = Phase::Idle;
        self.idle.push(worker);
    }

    fn zero_budget(&mut self, worker: WorkerId) {
        if let Some(slot) = self.workers.get_mut(&worker) {
            slot.messages_remaining = 0;
        }
    }

    /// Removes a worker from every tracking structure and closes its input
    /// channel. Safe to call twice; a worker is never referenced again
    /// afterwards.
    fn retire(&mut self, worker: WorkerId) {
        if let Some(record) = self.in_flight.remove(&worker) {
            // Only reachable through anomalous paths; never strand a task.
            let _ = record
                .reply
                .send(Err(CipherError::WorkerCrashed(
                    "worker retired with task in flight".to_string(),
                )));
        }
        self.idle.retain(|w| *w != worker);
        if let Some(slot) = self.workers.remove(&worker) {
            slot.handle.terminate();
            tracing::debug!(worker = worker.0, "retired worker");
        }
    }

    /// The bounded recovery state machine, entered when a scheduling pass
    /// fails.
    fn enter_recovery(&mut self, cause: String) {
        self.recovery_failures += 1;
        tracing::error!(
            failures = self.recovery_failures,
            cause = %cause,
            "scheduling pass failed; quarantining workers"
        );

        // Quarantine every tracked worker. Idle and spawning workers retire
        // immediately; in-flight workers finish their task first and retire
        // on release.
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            let Some(slot) = self.workers.get_mut(&id) else {
                continue;
            };
            slot.messages_remaining = 0;
            slot.quarantined = true;
            if !self.in_flight.contains_key(&id) {
                self.retire(id);
            }
        }

        // Cross-check: an in-flight record without a tracked worker is
        // anomalous; fail its task with the recovery cause.
        let anomalous: Vec<WorkerId> = self
            .in_flight
            .keys()
            .filter(|w| !self.workers.contains_key(w))
            .copied()
            .collect();
        for id in anomalous {
            tracing::error!(worker = id.0, "in-flight record for untracked worker");
            if let Some(record) = self.in_flight.remove(&id) {
                let _ = record.reply.send(Err(CipherError::WorkerCrashed(format!(
                    "pool entered recovery: {cause}"
                ))));
            }
        }

        // Schedule the next attempt first: every failure gets its backoff
        // delay computed and armed, including the one that crosses the
        // threshold. Once fatal is latched the elapsed timer is a no-op.
        let delay = self.backoff.min(self.config.recovery_backoff_max);
        self.backoff = (self.backoff * 2).min(self.config.recovery_backoff_max);
        self.recovery_pending = true;
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(PoolEvent::RecoveryElapsed);
        });

        if self.recovery_failures >= self.config.recovery_failure_threshold {
            self.latch_fatal(cause);
        }
    }

    fn latch_fatal(&mut self, cause: String) {
        tracing::error!(cause = %cause, "recovery failure threshold reached; pool is fatal");
        self.pool_fatal = Some(cause.clone());
        while let Some(task) = self.queue.shift() {
            task.reject(CipherError::PoolFatal(cause.clone()));
        }
    }

    fn live_worker_count(&self) -> usize {
        self.workers.values().filter(|s| !s.quarantined).count()
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.len(),
            idle: self.idle.len(),
            in_flight: self.in_flight.len(),
            queued: self.queue.len(),
            quarantined: self.workers.values().filter(|s| s.quarantined).count(),
            recovery_failures: self.recovery_failures,
            backoff: self.backoff,
            fatal: self.pool_fatal.clone(),
        }
    }
}
