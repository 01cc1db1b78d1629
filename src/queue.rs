//! Generic bounded-concurrency task runner.
//!
//! Work items enter through [`TaskQueue::add`] or a cloneable [`Injector`]
//! handle, which a running task may use to enqueue more work. The queue only
//! drains once both the pending list and the in-flight set are empty, so the
//! "discover a dependency while processing" recursion terminates naturally.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::{BoxFuture, select_all};
use parking_lot::Mutex;
use tracing::trace;

type Factory<T, E> = Arc<dyn Fn(T, Injector<T>) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

/// Handle for enqueueing work into a running queue. Every task receives one,
/// so work discovered mid-task can feed back into the same backlog.
pub struct Injector<T> {
    pending: Arc<Mutex<VecDeque<T>>>,
}

impl<T> Clone for Injector<T> {
    fn clone(&self) -> Self {
        Self {
            pending: self.pending.clone(),
        }
    }
}

impl<T> Injector<T> {
    pub fn add(&self, item: T) {
        self.pending.lock().push_back(item);
    }
}

pub struct TaskQueue<T, E = anyhow::Error> {
    pending: Arc<Mutex<VecDeque<T>>>,
    concurrency: usize,
    factory: Factory<T, E>,
}

impl<T, E> TaskQueue<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Build a queue that turns each item into one asynchronous task via
    /// `factory`, keeping at most `concurrency` tasks in flight. Start order
    /// follows add order as slots free up.
    pub fn new<F, Fut>(concurrency: usize, factory: F) -> Self
    where
        F: Fn(T, Injector<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        Self {
            pending: Arc::new(Mutex::new(VecDeque::new())),
            concurrency: concurrency.max(1),
            factory: Arc::new(move |item, injector| Box::pin(factory(item, injector))),
        }
    }

    pub fn add(&self, item: T) {
        trace!("queue add");
        self.pending.lock().push_back(item);
    }

    pub fn injector(&self) -> Injector<T> {
        Injector {
            pending: self.pending.clone(),
        }
    }

    /// Drive the queue until every task has completed, including any added
    /// while running. The first task failure is reported; after a failure no
    /// further pending work is started, but tasks already in flight run to
    /// completion (there is no forced-cancellation primitive).
    pub async fn run(&self) -> Result<(), E> {
        let mut in_flight: Vec<BoxFuture<'static, Result<(), E>>> = Vec::new();
        let mut first_err: Option<E> = None;

        loop {
            if first_err.is_none() {
                while in_flight.len() < self.concurrency {
                    let next = self.pending.lock().pop_front();
                    match next {
                        Some(item) => in_flight.push((self.factory)(item, self.injector())),
                        None => break,
                    }
                }
            }

            if in_flight.is_empty() {
                // unless a failure stopped intake, the pending list is empty
                // here as well
                match first_err.take() {
                    Some(err) => return Err(err),
                    None if self.pending.lock().is_empty() => return Ok(()),
                    None => continue,
                }
            }

            // select_all polls in add order, so earlier tasks start first
            let (result, _, remaining) = select_all(in_flight).await;
            in_flight = remaining;
            if let Err(err) = result {
                first_err.get_or_insert(err);
            }
        }
    }
}

impl<T, E> std::fmt::Debug for TaskQueue<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("concurrency", &self.concurrency)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
