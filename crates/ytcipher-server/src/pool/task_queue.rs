//! FIFO queue of pending evaluation tasks.
//!
//! The queue itself is deliberately dumb: ordering and O(1) operations at
//! both ends, nothing else. Age-based expiry is the dispatcher's job, applied
//! at dequeue time so an expired entry is never handed to a worker.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::oneshot;

use ytcipher_common::CipherError;

/// A single pending evaluation: one string in, one string (or error) out.
///
/// The reply channel enforces the settle-exactly-once contract; a consumer
/// that dropped its receiver is tolerated.
pub struct Task {
    pub input: String,
    pub reply: oneshot::Sender<Result<String, CipherError>>,
    pub enqueued_at: Instant,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("input_len", &self.input.len())
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

impl Task {
    pub fn new(input: String, reply: oneshot::Sender<Result<String, CipherError>>) -> Self {
        Self {
            input,
            reply,
            enqueued_at: Instant::now(),
        }
    }

    /// Settles the task with an error. A gone consumer is not an error.
    pub fn reject(self, error: CipherError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Ordered queue of tasks. Push at the tail, shift from the head.
#[derive(Default)]
pub struct TaskQueue {
    entries: VecDeque<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        self.entries.push_back(task);
    }

    /// Removes and returns the head task, or `None` when empty.
    pub fn shift(&mut self) -> Option<Task> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
