//! Worker threads: isolated evaluation contexts.
//!
//! Each worker is a dedicated OS thread owning one evaluator. Inputs arrive
//! over a std mpsc channel (the thread blocks on `recv`), replies and
//! lifecycle events flow back to the dispatcher over its event channel.
//! Evaluation is wrapped in `catch_unwind` so a panicking evaluator reports
//! a crash instead of tearing down the host; a thread that dies for any
//! other reason is observed through channel disconnection.
//!
//! There is no way to interrupt a thread stuck inside the engine, so
//! "terminating" a worker means dropping its input channel: the thread
//! finishes whatever it is doing and exits at the next receive. The
//! dispatcher stops tracking it immediately either way.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;

use tokio::sync::mpsc::UnboundedSender;

use crate::pool::dispatcher::PoolEvent;
use crate::runtime::evaluator::{EvalError, EvaluatorFactory};

/// Stack size for worker threads. Player preprocessors recurse deeply while
/// parsing multi-megabyte sources.
const WORKER_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Identifies a worker for the lifetime of the pool. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

/// Outcome of a single evaluation, as reported by the worker thread.
#[derive(Debug)]
pub enum EvalOutcome {
    /// Evaluation succeeded with a string payload.
    Output(String),
    /// The evaluated script reported an error.
    ScriptError {
        message: String,
        stack: Option<String>,
    },
    /// Evaluation completed with something other than a string.
    Malformed(String),
    /// The evaluator panicked; the worker thread is going down with it.
    Panicked(String),
}

/// Dispatcher-side handle to a worker thread.
pub struct WorkerHandle {
    input: std_mpsc::Sender<String>,
}

impl WorkerHandle {
    /// Spawns a worker thread. The evaluator is constructed inside the
    /// thread (it is not `Send`); the worker emits `Ready` once that
    /// succeeds, or `Exited` with the construction error.
    pub fn spawn(
        id: WorkerId,
        factory: EvaluatorFactory,
        events: UnboundedSender<PoolEvent>,
    ) -> std::io::Result<Self> {
        let (input_tx, input_rx) = std_mpsc::channel::<String>();

        std::thread::Builder::new()
            .name(format!("ytcipher-worker-{}", id.0))
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || worker_loop(id, factory, input_rx, events))?;

        Ok(Self { input: input_tx })
    }

    /// Hands an input to the worker. Fails when the thread is gone.
    pub fn send(&self, input: String) -> Result<(), ()> {
        self.input.send(input).map_err(|_| ())
    }

    /// Terminates the worker by closing its input channel. The thread exits
    /// at its next receive; a thread mid-evaluation finishes that call
    /// first. Idempotent by construction, and never fails.
    pub fn terminate(self) {}
}

fn worker_loop(
    id: WorkerId,
    factory: EvaluatorFactory,
    input_rx: std_mpsc::Receiver<String>,
    events: UnboundedSender<PoolEvent>,
) {
    let mut evaluator = match factory() {
        Ok(evaluator) => evaluator,
        Err(e) => {
            tracing::error!(worker = id.0, error = %e, "evaluator construction failed");
            let _ = events.send(PoolEvent::Exited {
                worker: id,
                error: Some(e.to_string()),
            });
            return;
        }
    };

    if events.send(PoolEvent::Ready(id)).is_err() {
        return;
    }

    while let Ok(input) = input_rx.recv() {
        let outcome = match catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(&input))) {
            Ok(Ok(output)) => EvalOutcome::Output(output),
            Ok(Err(EvalError::Script { message, stack })) => {
                EvalOutcome::ScriptError { message, stack }
            }
            Ok(Err(EvalError::NonString(desc))) => EvalOutcome::Malformed(desc),
            Err(panic) => {
                // The evaluator state may be poisoned; report and die.
                let _ = events.send(PoolEvent::Reply {
                    worker: id,
                    outcome: EvalOutcome::Panicked(panic_message(panic.as_ref())),
                });
                return;
            }
        };

        if events
            .send(PoolEvent::Reply {
                worker: id,
                outcome,
            })
            .is_err()
        {
            return;
        }
    }

    let _ = events.send(PoolEvent::Exited {
        worker: id,
        error: None,
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::evaluator::closure_factory;
    use tokio::sync::mpsc;

    fn spawn_worker(
        factory: EvaluatorFactory,
    ) -> (WorkerHandle, mpsc::UnboundedReceiver<PoolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle::spawn(WorkerId(0), factory, tx).unwrap();
        (handle, rx)
    }

    #[tokio::test]
    async fn test_worker_reports_ready_then_replies() {
        let (handle, mut rx) = spawn_worker(closure_factory(|s| Ok(s.to_uppercase())));

        assert!(matches!(rx.recv().await, Some(PoolEvent::Ready(_))));
        handle.send("abc".to_string()).unwrap();
        match rx.recv().await {
            Some(PoolEvent::Reply {
                outcome: EvalOutcome::Output(s),
                ..
            }) => assert_eq!(s, "ABC"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_panic_reports_crash_and_dies() {
        let (handle, mut rx) = spawn_worker(closure_factory(|_| panic!("engine fault")));

        assert!(matches!(rx.recv().await, Some(PoolEvent::Ready(_))));
        handle.send("x".to_string()).unwrap();
        match rx.recv().await {
            Some(PoolEvent::Reply {
                outcome: EvalOutcome::Panicked(msg),
                ..
            }) => assert!(msg.contains("engine fault")),
            other => panic!("unexpected event: {other:?}"),
        }
        // Thread is gone; further sends fail eventually.
        let mut dead = false;
        for _ in 0..50 {
            if handle.send("y".to_string()).is_err() {
                dead = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(dead, "worker thread should be gone after a panic");
    }

    #[tokio::test]
    async fn test_factory_failure_reports_exited_with_error() {
        let factory: EvaluatorFactory = std::sync::Arc::new(|| {
            Err(ytcipher_common::CipherError::Evaluation(
                "no bundle".to_string(),
            ))
        });
        let (_handle, mut rx) = spawn_worker(factory);

        match rx.recv().await {
            Some(PoolEvent::Exited {
                error: Some(msg), ..
            }) => assert!(msg.contains("no bundle")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminate_disconnects_thread() {
        let (handle, mut rx) = spawn_worker(closure_factory(|s| Ok(s.to_string())));
        assert!(matches!(rx.recv().await, Some(PoolEvent::Ready(_))));

        handle.terminate();
        match rx.recv().await {
            Some(PoolEvent::Exited { error: None, .. }) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
