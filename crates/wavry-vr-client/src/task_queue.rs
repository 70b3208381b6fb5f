//! Per-thread command queue.
//!
//! The owning thread drains actions in FIFO order. Other threads hand work to
//! it with [`TaskQueue::post`], or with [`TaskQueue::send`] when they must not
//! continue until the action has run.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use wavry_vr::{VrError, VrResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Envelope {
    task: Task,
    /// Present for `send` submissions; the sender waits for this ticket.
    ticket: Option<u64>,
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Envelope>,
    terminated: bool,
    next_ticket: u64,
    completed: u64,
}

#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    completed: Condvar,
    owner: OnceLock<ThreadId>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the queue to the calling thread. Returns `false` if another
    /// thread already owns it.
    pub fn claim_owner(&self) -> bool {
        let current = thread::current().id();
        *self.owner.get_or_init(|| current) == current
    }

    pub fn is_owner(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    /// Enqueues `action` and returns immediately. Returns `false` when the
    /// queue has been interrupted and the action was dropped.
    pub fn post<F>(&self, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if state.terminated {
            return false;
        }
        state.tasks.push_back(Envelope {
            task: Box::new(action),
            ticket: None,
        });
        self.not_empty.notify_all();
        true
    }

    /// Enqueues `action` and blocks until the owning thread has executed it.
    ///
    /// Called from the owning thread the action runs inline. Returns
    /// [`VrError::Interrupted`] if the queue terminates before the action
    /// completes.
    pub fn send<F>(&self, action: F) -> VrResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_owner() {
            if self.is_terminated() {
                return Err(VrError::Interrupted);
            }
            action();
            return Ok(());
        }

        let mut state = self.lock();
        if state.terminated {
            return Err(VrError::Interrupted);
        }
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        state.tasks.push_back(Envelope {
            task: Box::new(action),
            ticket: Some(ticket),
        });
        self.not_empty.notify_all();

        while state.completed < ticket && !state.terminated {
            state = self
                .completed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if state.completed >= ticket {
            Ok(())
        } else {
            Err(VrError::Interrupted)
        }
    }

    /// Blocks until at least one action is queued, then runs everything
    /// queued. Returns `false` once the queue is terminated.
    pub fn wait_next(&self) -> bool {
        let mut state = self.lock();
        while state.tasks.is_empty() && !state.terminated {
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let batch = std::mem::take(&mut state.tasks);
        drop(state);

        self.run_batch(batch);
        !self.is_terminated()
    }

    /// Runs whatever is queued without blocking. Returns `false` once the
    /// queue is terminated.
    pub fn wait_idle(&self) -> bool {
        let batch = std::mem::take(&mut self.lock().tasks);
        self.run_batch(batch);
        !self.is_terminated()
    }

    /// Sleeps up to `timeout` unless work arrives or the queue terminates.
    /// Nothing is executed. Returns `true` when woken early.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .not_empty
            .wait_timeout_while(state, timeout, |s| s.tasks.is_empty() && !s.terminated)
            .unwrap_or_else(PoisonError::into_inner);
        !state.tasks.is_empty() || state.terminated
    }

    /// Terminates the queue and wakes every waiter. Queued actions are left in
    /// place for a final drain by the owner.
    pub fn interrupt(&self) {
        let mut state = self.lock();
        state.terminated = true;
        self.not_empty.notify_all();
        self.completed.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn run_batch(&self, batch: VecDeque<Envelope>) {
        if batch.is_empty() {
            return;
        }
        debug_assert!(
            self.owner.get().map_or(true, |id| *id == thread::current().id()),
            "task queue drained off its owning thread"
        );

        // A panicking action takes the owner down; terminate so no sender
        // waits on actions that will never run.
        let _owner_guard = OwnerGuard(self);
        for envelope in batch {
            let _completion = envelope.ticket.map(|ticket| Completion {
                queue: self,
                ticket,
            });
            (envelope.task)();
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct Completion<'a> {
    queue: &'a TaskQueue,
    ticket: u64,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        let mut state = self.queue.lock();
        state.completed = state.completed.max(self.ticket);
        self.queue.completed.notify_all();
    }
}

struct OwnerGuard<'a>(&'a TaskQueue);

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.interrupt();
        }
    }
}
