//! Bounded pool of isolated script-evaluation workers.
//!
//! The pool accepts string-in/string-out evaluation tasks and schedules
//! them onto a fixed-size set of worker threads, each owning its own
//! evaluator. Workers carry a message budget and are retired when it runs
//! out; crashed, timed-out, or misbehaving workers are retired and
//! replaced. Repeated refill failures drive an exponential-backoff recovery
//! protocol that eventually latches the pool into a fatal state.
//!
//! All scheduling state lives on a single dispatcher task; see
//! [`dispatcher`] for the event model.

pub mod dispatcher;
pub mod task_queue;
pub mod worker;

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use ytcipher_common::CipherError;

use crate::runtime::evaluator::EvaluatorFactory;
use dispatcher::{Dispatcher, PoolEvent};
pub use dispatcher::PoolStats;
use task_queue::Task;

/// Pool configuration, immutable after construction.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of workers the pool maintains.
    pub concurrency: usize,
    /// Evaluations a single worker performs before retirement.
    pub messages_limit: u32,
    /// Queued tasks older than this are rejected at dequeue, never
    /// dispatched.
    pub max_task_age: Duration,
    /// Watchdog ceiling for a single evaluation.
    pub in_flight_timeout: Duration,
    pub recovery_backoff_base: Duration,
    pub recovery_backoff_max: Duration,
    /// Consecutive recovery failures before the pool latches fatal.
    pub recovery_failure_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            messages_limit: 10_000,
            max_task_age: Duration::from_secs(30 * 60),
            in_flight_timeout: Duration::from_secs(60 * 60),
            recovery_backoff_base: Duration::from_millis(25),
            recovery_backoff_max: Duration::from_secs(5),
            recovery_failure_threshold: 5,
        }
    }
}

impl PoolConfig {
    /// Clamps nonsensical values rather than failing startup.
    pub fn sanitized(mut self) -> Self {
        self.concurrency = self.concurrency.max(1);
        self.messages_limit = self.messages_limit.max(1);
        self
    }
}

/// Handle to the worker pool. Cheap to clone; all clones feed the same
/// dispatcher.
#[derive(Clone)]
pub struct WorkerPool {
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl WorkerPool {
    /// Starts the dispatcher and eagerly spawns workers up to the
    /// configured concurrency.
    pub fn new(config: PoolConfig, factory: EvaluatorFactory) -> Self {
        let config = config.sanitized();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(config, factory, events_tx.clone());
        tokio::spawn(dispatcher.run(events_rx));
        Self { events: events_tx }
    }

    /// Submits one evaluation and waits for its result.
    ///
    /// # Errors
    ///
    /// Any of the worker-error taxonomy: dispatch failure, crash, timeout,
    /// protocol violation, script-reported error, queue-age rejection, or a
    /// latched pool-fatal error.
    pub async fn submit(&self, input: String) -> Result<String, CipherError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let task = Task::new(input, reply_tx);
        self.events
            .send(PoolEvent::Submit(task))
            .map_err(|_| CipherError::PoolFatal("pool dispatcher is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| CipherError::PoolFatal("task was dropped by the pool".to_string()))?
    }

    /// Snapshot of current pool state.
    pub async fn stats(&self) -> Result<PoolStats, CipherError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(PoolEvent::Stats(tx))
            .map_err(|_| CipherError::PoolFatal("pool dispatcher is gone".to_string()))?;
        rx.await
            .map_err(|_| CipherError::PoolFatal("pool dispatcher is gone".to_string()))
    }
}
