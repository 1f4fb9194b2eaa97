//! Bounded worker pool.
//!
//! The pool owns exactly as many threads as the scheduler's capacity, so the
//! number of bodies executing at once can never exceed it, even while a timed
//! out body is still winding down. Workers never touch scheduler state: they
//! run a job and post one `Finished` event back to the control context.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Instant;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, trace, warn};

use super::cancel::CancelToken;
use super::tag::Tag;
use super::task::{Job, TaskId};
use super::ControlMsg;

/// A dispatched body on its way to a worker.
pub(crate) struct WorkItem {
    pub(crate) id: TaskId,
    pub(crate) tag: Tag,
    pub(crate) token: CancelToken,
    pub(crate) job: Job,
}

/// Fixed-size pool of worker threads.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    /// Job sender; `None` once the pool is shutting down.
    jobs: Option<Sender<WorkItem>>,
    /// Worker threads.
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers that report to `events`.
    pub(crate) fn new(
        size: usize,
        thread_name: &str,
        stack_size: Option<usize>,
        events: Sender<ControlMsg>,
    ) -> io::Result<Self> {
        let (jobs, queue) = channel::unbounded();
        let mut workers = Vec::with_capacity(size);

        for worker_id in 0..size {
            let queue = queue.clone();
            let events = events.clone();

            let mut builder = thread::Builder::new().name(format!("{}-{}", thread_name, worker_id));
            if let Some(stack_size) = stack_size {
                builder = builder.stack_size(stack_size);
            }
            let worker = builder.spawn(move || Self::worker_loop(worker_id, &queue, &events))?;
            workers.push(worker);
        }

        debug!(workers = size, "worker pool started");
        Ok(Self {
            jobs: Some(jobs),
            workers,
        })
    }

    /// Hand a job to the next free worker.
    pub(crate) fn execute(
        &self,
        item: WorkItem,
    ) {
        if let Some(jobs) = &self.jobs {
            if jobs.send(item).is_err() {
                warn!("worker pool has no live workers");
            }
        }
    }

    /// Number of worker threads.
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting jobs and wait for every worker to exit.
    ///
    /// Blocks until bodies already handed out have returned.
    pub(crate) fn shutdown(&mut self) {
        self.jobs = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("worker thread panicked outside a task body");
            }
        }
    }

    /// Stop accepting jobs without waiting for the workers.
    ///
    /// Idle workers exit once the job channel disconnects; a worker stuck in
    /// a body is left to finish on its own.
    pub(crate) fn detach(&mut self) {
        self.jobs = None;
        let detached = self.workers.drain(..).count();
        debug!(workers = detached, "worker pool detached");
    }

    /// Worker thread main loop.
    fn worker_loop(
        worker_id: usize,
        queue: &Receiver<WorkItem>,
        events: &Sender<ControlMsg>,
    ) {
        for WorkItem { id, tag, token, job } in queue.iter() {
            trace!(worker_id, tag = %tag, id = id.inner(), "shuttle start");
            let start = Instant::now();

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&token))) {
                warn!(
                    tag = %tag,
                    id = %id,
                    "task body panicked: {}",
                    panic_message(payload.as_ref())
                );
            }

            trace!(
                worker_id,
                tag = %tag,
                id = %id,
                elapsed_us = start.elapsed().as_micros() as u64,
                "shuttle done"
            );

            // The control context is gone; nothing left to report to.
            if events.send(ControlMsg::Finished { id, tag }).is_err() {
                break;
            }
        }
        trace!(worker_id, "worker exiting");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
