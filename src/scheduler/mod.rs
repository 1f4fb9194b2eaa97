//! Dependency-aware task scheduler.
//!
//! [`Loom`] runs task bodies on a bounded worker pool and delivers every
//! result back to a single control context: whoever owns the `Loom`. All
//! scheduler state is mutated through `&mut Loom`, so completion callbacks
//! never race with each other or with submissions.
//!
//! ```text
//! submit ─► readiness gate ─┬─► weave ─► WorkerPool ─► Finished ─┐
//!                           └─► PendingQueue                     │
//!        ▲                                                       ▼
//!        └──────────── pick_up_ready ◄── tie_off ◄── pump (control context)
//! ```
//!
//! A task is ready when no task carrying one of its dependency tags (or its
//! own tag) is running and a worker is free. A timed out body that has not
//! returned yet still occupies its worker. Unready tasks wait in one
//! priority-ordered queue until a retirement frees them.

pub mod cancel;
pub mod error;
pub mod handle;
pub mod queue;
pub mod tag;
pub mod task;
pub mod timer;
pub(crate) mod worker;

#[cfg(test)]
mod tests;

pub use cancel::CancelToken;
pub use error::{SubmitError, TaskError};
pub use handle::{default_handle, LoomHandle, LoomThread};
pub use queue::{PendingQueue, Queued};
pub use tag::Tag;
pub use task::{TaskHandle, TaskId, TaskIdGenerator, TaskSpec, TaskSpecBuilder, TaskState};
pub use timer::TimerQueue;

use std::io;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use hashbrown::{HashMap, HashSet};
use tracing::{debug, trace, warn};

use crate::util::config::LoomConfig;
use task::Completion;
use worker::{WorkItem, WorkerPool};

/// Longest a blocking pump sleeps before re-checking its exit condition.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Message posted to the control context.
pub(crate) enum ControlMsg {
    /// A worker finished running a body.
    Finished { id: TaskId, tag: Tag },
    /// A task submitted through a [`LoomHandle`].
    Submit {
        id: TaskId,
        token: CancelToken,
        spec: TaskSpec,
    },
    /// A cancellation requested through a [`LoomHandle`].
    Cancel(Tag),
    /// Stop accepting work.
    Shutdown,
}

/// A descriptor waiting in the pending queue.
#[derive(Debug)]
struct QueuedTask {
    id: TaskId,
    token: CancelToken,
    spec: TaskSpec,
}

impl Queued for QueuedTask {
    fn priority(&self) -> i32 {
        self.spec.priority()
    }

    fn is_lifo(&self) -> bool {
        self.spec.is_lifo()
    }
}

/// A dispatched task, from weave until tie-off.
struct ActiveTask {
    id: TaskId,
    token: CancelToken,
    timeout: Option<Duration>,
    started: Instant,
    completion: Box<dyn Completion>,
}

/// What a cancellation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelReport {
    /// Pending tasks removed and completed with [`TaskError::Cancelled`].
    pub dequeued: usize,
    /// Whether a running task's token was set.
    pub signalled: bool,
}

impl CancelReport {
    /// Whether the tag matched anything.
    #[inline]
    pub fn found(&self) -> bool {
        self.dequeued > 0 || self.signalled
    }
}

/// Scheduler statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoomStats {
    /// Tasks accepted by `submit`.
    pub submitted: usize,
    /// Tasks handed to the worker pool.
    pub dispatched: usize,
    /// Tasks whose body returned a value.
    pub completed: usize,
    /// Tasks whose body returned an error or panicked.
    pub failed: usize,
    /// Tasks retired by their timeout.
    pub timed_out: usize,
    /// Tasks cancelled before dispatch.
    pub cancelled: usize,
    /// Results that arrived after their task had already retired.
    pub late_results_dropped: usize,
    /// Peak number of running tasks.
    pub peak_running: usize,
}

impl LoomStats {
    /// Record a dispatch.
    #[inline]
    fn record_dispatched(
        &mut self,
        running: usize,
    ) {
        self.dispatched += 1;
        self.peak_running = self.peak_running.max(running);
    }

    /// Record a delivered result.
    #[inline]
    fn record_retired(
        &mut self,
        state: TaskState,
    ) {
        match state {
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::TimedOut => self.timed_out += 1,
            TaskState::Cancelled => self.cancelled += 1,
            _ => {},
        }
    }

    /// Tasks that have delivered their result.
    #[inline]
    pub fn retired(&self) -> usize {
        self.completed + self.failed + self.timed_out + self.cancelled
    }
}

/// Dependency-aware scheduler.
///
/// The owner of a `Loom` is its control context. Submissions made through
/// [`Loom::submit`] dispatch before returning when the task is ready;
/// results are delivered when the owner pumps events with [`Loom::pump`],
/// [`Loom::pump_timeout`] or [`Loom::run_until_idle`]. Other threads reach
/// the scheduler through a [`LoomHandle`].
pub struct Loom {
    /// Configuration.
    config: LoomConfig,
    /// Maximum concurrently running tasks.
    capacity: usize,
    /// Running tasks, at most one per tag.
    running: HashMap<Tag, ActiveTask>,
    /// Tasks waiting for a dependency or a free slot.
    pending: PendingQueue<QueuedTask>,
    /// Timeout deadlines of running tasks.
    timers: TimerQueue,
    /// Timed out tasks whose body still holds the input.
    orphans: HashMap<TaskId, Box<dyn Completion>>,
    /// Timed out tasks whose body has not returned; each holds a worker.
    lingering: HashSet<TaskId>,
    /// Worker threads.
    pool: WorkerPool,
    /// Sender side of the control channel, cloned into workers and handles.
    events_tx: Sender<ControlMsg>,
    /// Control channel.
    events_rx: Receiver<ControlMsg>,
    /// Task ID generator.
    ids: TaskIdGenerator,
    /// Statistics.
    stats: LoomStats,
    /// Shutdown requested; new work is cancelled on arrival.
    closing: bool,
    /// Shutdown finished.
    closed: bool,
}

impl std::fmt::Debug for Loom {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Loom")
            .field("capacity", &self.capacity)
            .field("workers", &self.pool.size())
            .field("running", &self.running.len())
            .field("pending", &self.pending.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Loom {
    /// Create a scheduler with the default configuration.
    #[inline]
    pub fn new() -> io::Result<Self> {
        Self::with_config(LoomConfig::default())
    }

    /// Create a scheduler with a fixed capacity.
    #[inline]
    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        Self::with_config(LoomConfig::with_max_threads(capacity))
    }

    /// Create a scheduler with custom configuration.
    pub fn with_config(config: LoomConfig) -> io::Result<Self> {
        let capacity = config.capacity();
        let (events_tx, events_rx) = channel::unbounded();
        let pool = WorkerPool::new(
            capacity,
            &config.thread_name,
            config.stack_size,
            events_tx.clone(),
        )?;

        Ok(Self {
            config,
            capacity,
            running: HashMap::new(),
            pending: PendingQueue::new(),
            timers: TimerQueue::new(),
            orphans: HashMap::new(),
            lingering: HashSet::new(),
            pool,
            events_tx,
            events_rx,
            ids: TaskIdGenerator::new(),
            stats: LoomStats::default(),
            closing: false,
            closed: false,
        })
    }

    /// Submit a task.
    ///
    /// Rejects an empty tag. Otherwise never blocks: a ready task is
    /// dispatched before this returns, anything else is queued.
    ///
    /// At most one task per tag runs at a time, so a task whose tag is
    /// already running waits in the queue even when a worker is free.
    pub fn submit(
        &mut self,
        spec: TaskSpec,
    ) -> Result<TaskHandle, SubmitError> {
        if spec.tag().is_empty() {
            return Err(SubmitError::EmptyTag);
        }
        let id = self.ids.next();
        let token = CancelToken::new();
        let handle = TaskHandle::new(id, spec.tag(), token.clone());
        self.enqueue(QueuedTask { id, token, spec });
        Ok(handle)
    }

    /// Cancel tasks tagged `tag`.
    ///
    /// Pending tasks are removed at once and complete with
    /// [`TaskError::Cancelled`] without their body ever running. A running
    /// task only has its token set; it completes normally once the body
    /// returns.
    pub fn cancel(
        &mut self,
        tag: impl Into<Tag>,
    ) -> CancelReport {
        let tag = tag.into();
        let dequeued = self.pending.drain_matching(|task| task.spec.tag() == tag);
        let report = CancelReport {
            dequeued: dequeued.len(),
            signalled: self.running.get(&tag).map_or(false, |active| {
                active.token.cancel();
                true
            }),
        };

        debug!(
            tag = %tag,
            dequeued = report.dequeued,
            signalled = report.signalled,
            "cancel requested"
        );
        for task in dequeued {
            self.abandon(task);
        }
        report
    }

    /// Whether every worker is taken, counting those still stuck in a timed
    /// out body.
    #[inline]
    pub fn is_at_capacity(&self) -> bool {
        self.running.len() >= self.slots()
    }

    /// Workers available to running tasks.
    #[inline]
    fn slots(&self) -> usize {
        self.capacity.saturating_sub(self.lingering.len())
    }

    /// Whether nothing is running or pending.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.pending.is_empty()
    }

    /// Whether a task tagged `tag` is running.
    #[inline]
    pub fn is_running(
        &self,
        tag: impl Into<Tag>,
    ) -> bool {
        self.running.contains_key(&tag.into())
    }

    /// Whether a task tagged `tag` is pending.
    pub fn is_pending(
        &self,
        tag: impl Into<Tag>,
    ) -> bool {
        let tag = tag.into();
        self.pending.iter().any(|task| task.spec.tag() == tag)
    }

    /// Live state of the class `tag`: `Running` wins over `Pending`.
    pub fn state_of(
        &self,
        tag: impl Into<Tag>,
    ) -> Option<TaskState> {
        let tag = tag.into();
        if self.running.contains_key(&tag) {
            Some(TaskState::Running)
        } else if self.is_pending(tag) {
            Some(TaskState::Pending)
        } else {
            None
        }
    }

    /// Tags of pending tasks in queue order.
    pub fn pending_tags(&self) -> Vec<Tag> {
        self.pending.iter().map(|task| task.spec.tag()).collect()
    }

    /// Get the capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of running tasks.
    #[inline]
    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Number of timed out bodies that have not returned yet.
    #[inline]
    pub fn lingering_len(&self) -> usize {
        self.lingering.len()
    }

    /// Number of pending tasks.
    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Get statistics.
    #[inline]
    pub fn stats(&self) -> LoomStats {
        self.stats
    }

    /// Get the configuration.
    #[inline]
    pub fn config(&self) -> &LoomConfig {
        &self.config
    }

    /// Handle for submitting and cancelling from other threads or from
    /// inside completion callbacks.
    pub fn handle(&self) -> LoomHandle {
        LoomHandle::new(self.events_tx.clone(), self.ids.clone())
    }

    /// Process posted events and expired timeouts without blocking.
    ///
    /// Returns the number of events handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.events_rx.try_recv() {
            self.handle_msg(msg);
            handled += 1;
        }
        handled + self.fire_expired(Instant::now())
    }

    /// Like [`Loom::pump`], but waits up to `timeout` for the first event.
    pub fn pump_timeout(
        &mut self,
        timeout: Duration,
    ) -> usize {
        self.pump_until(Instant::now() + timeout)
    }

    /// Pump until nothing is running or pending.
    pub fn run_until_idle(&mut self) {
        self.pump();
        while !self.is_idle() {
            self.pump_timeout(IDLE_POLL);
        }
    }

    /// Pump until idle or until `timeout` passes. Returns whether idle.
    pub fn run_until_idle_timeout(
        &mut self,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        self.pump();
        while !self.is_idle() {
            if Instant::now() >= deadline {
                return false;
            }
            self.pump_until(deadline);
        }
        true
    }

    /// Pump until a handle requests shutdown, then shut down.
    ///
    /// This is the body of a dedicated control thread.
    pub fn run_until_shutdown(mut self) -> LoomStats {
        while !self.closing {
            self.pump_timeout(IDLE_POLL);
        }
        self.close();
        self.stats
    }

    /// Cancel pending work, signal running bodies, wait for them to retire
    /// and stop the workers.
    pub fn shutdown(mut self) -> LoomStats {
        self.close();
        self.stats
    }

    fn pump_until(
        &mut self,
        deadline: Instant,
    ) -> usize {
        let handled = self.pump();
        if handled > 0 {
            return handled;
        }

        let wake = self
            .timers
            .next_deadline()
            .map_or(deadline, |next| next.min(deadline));
        match self.events_rx.recv_deadline(wake) {
            Ok(msg) => {
                self.handle_msg(msg);
                1 + self.pump()
            },
            Err(RecvTimeoutError::Timeout) => self.fire_expired(Instant::now()),
            Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    fn handle_msg(
        &mut self,
        msg: ControlMsg,
    ) {
        match msg {
            ControlMsg::Finished { id, tag } => self.on_finished(id, tag),
            ControlMsg::Submit { id, token, spec } => {
                self.enqueue(QueuedTask { id, token, spec });
            },
            ControlMsg::Cancel(tag) => {
                self.cancel(tag);
            },
            ControlMsg::Shutdown => {
                debug!("shutdown requested");
                self.closing = true;
            },
        }
    }

    /// Readiness gate.
    fn is_ready(
        running: &HashMap<Tag, ActiveTask>,
        slots: usize,
        spec: &TaskSpec,
    ) -> bool {
        running.len() < slots
            && !running.contains_key(&spec.tag())
            && spec
                .dependencies()
                .iter()
                .all(|dependency| !running.contains_key(dependency))
    }

    fn enqueue(
        &mut self,
        task: QueuedTask,
    ) {
        self.stats.submitted += 1;
        if self.closing {
            self.abandon(task);
            return;
        }

        if Self::is_ready(&self.running, self.slots(), &task.spec) {
            self.weave(task);
        } else {
            let position = self.pending.insert(task);
            debug!(position, pending = self.pending.len(), "queued task");
        }
    }

    /// Dispatch a ready task to the worker pool.
    fn weave(
        &mut self,
        task: QueuedTask,
    ) {
        let QueuedTask { id, token, spec } = task;
        let tag = spec.tag();
        let timeout = spec
            .timeout()
            .or_else(|| self.config.default_timeout())
            .filter(|timeout| !timeout.is_zero());
        let (job, completion) = spec.into_work().split();

        let started = Instant::now();
        if let Some(timeout) = timeout {
            self.timers.arm(started + timeout, id, tag);
        }

        debug!(tag = %tag, id = %id, ?timeout, "weaving task");
        self.running.insert(
            tag,
            ActiveTask {
                id,
                token: token.clone(),
                timeout,
                started,
                completion,
            },
        );
        self.stats.record_dispatched(self.running.len());
        self.pool.execute(WorkItem {
            id,
            tag,
            token,
            job,
        });
    }

    /// Dispatch every pending task that has become ready, in queue order.
    fn pick_up_ready(&mut self) {
        let slots = self.slots();
        while self.running.len() < slots {
            let running = &self.running;
            let Some(index) = self
                .pending
                .position(|task| Self::is_ready(running, slots, &task.spec))
            else {
                break;
            };
            if let Some(task) = self.pending.remove(index) {
                self.weave(task);
            }
        }
    }

    /// Retire a running task: deliver its result, free its slot, dispatch
    /// what that unblocked, then release its input.
    fn tie_off(
        &mut self,
        tag: Tag,
        synthesized: Option<TaskError>,
    ) {
        let Some(mut active) = self.running.remove(&tag) else {
            return;
        };
        let state = active.completion.complete(synthesized);
        debug_assert!(state.is_terminal());
        self.stats.record_retired(state);
        debug!(
            tag = %tag,
            id = %active.id,
            ?state,
            elapsed_ms = active.started.elapsed().as_millis() as u64,
            "tied off task"
        );

        self.pick_up_ready();

        if let Some(orphan) = active.completion.release() {
            self.orphans.insert(active.id, orphan);
        }
    }

    /// A worker reported back. Only the task currently registered under
    /// `tag` with the same ID may retire; anything else is a late result.
    fn on_finished(
        &mut self,
        id: TaskId,
        tag: Tag,
    ) {
        if self.running.get(&tag).map(|active| active.id) == Some(id) {
            self.tie_off(tag, None);
            return;
        }

        self.stats.late_results_dropped += 1;
        trace!(tag = %tag, id = %id, "dropping late result");
        if let Some(orphan) = self.orphans.remove(&id) {
            if let Some(orphan) = orphan.release() {
                self.orphans.insert(id, orphan);
            }
        }
        if self.lingering.remove(&id) && !self.closing {
            self.pick_up_ready();
        }
    }

    /// Retire every running task whose deadline has passed.
    fn fire_expired(
        &mut self,
        now: Instant,
    ) -> usize {
        let mut fired = 0;
        while let Some((id, tag)) = self.timers.pop_expired(now) {
            let timeout = match self.running.get(&tag) {
                Some(active) if active.id == id => {
                    active.token.cancel();
                    active.timeout.unwrap_or_default()
                },
                _ => continue,
            };

            warn!(tag = %tag, id = %id, ?timeout, "task timed out");
            self.lingering.insert(id);
            self.tie_off(tag, Some(TaskError::TimedOut { tag, timeout }));
            fired += 1;
        }
        fired
    }

    /// Complete a never-dispatched task with `Cancelled`.
    fn abandon(
        &mut self,
        task: QueuedTask,
    ) {
        let QueuedTask { id, token, spec } = task;
        let tag = spec.tag();
        token.cancel();
        self.stats.record_retired(TaskState::Cancelled);
        debug!(tag = %tag, id = %id, "cancelled pending task");
        spec.into_work().abandon(TaskError::Cancelled { tag });
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closing = true;
        self.pump();

        while let Some(task) = self.pending.pop_front() {
            self.abandon(task);
        }
        for active in self.running.values() {
            active.token.cancel();
        }
        while !self.running.is_empty() {
            self.pump_timeout(IDLE_POLL);
        }

        if self.lingering.is_empty() {
            self.pool.shutdown();
        } else {
            // Those bodies may never return.
            self.pool.detach();
        }
        self.pump();
        self.closed = true;
        debug!(retired = self.stats.retired(), stats = ?self.stats, "loom disassembled");
    }
}

impl Drop for Loom {
    fn drop(&mut self) {
        self.close();
    }
}
