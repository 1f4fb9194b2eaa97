//! Task descriptors for the scheduler.
//!
//! A [`TaskSpec`] is the immutable description of one unit of work: its tag,
//! the tags it waits on, its queue position hints, an optional timeout, and
//! the typed body/completion pair. Internally the typed parts are erased
//! behind [`TaskWork`] so that one `Loom` can carry tasks of any input and
//! output type.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::cancel::CancelToken;
use super::error::TaskError;
use super::tag::Tag;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Shared source of task IDs.
///
/// Clones hand out IDs from the same counter, so a `Loom` and all of its
/// handles never collide.
#[derive(Debug, Clone, Default)]
pub struct TaskIdGenerator {
    next_id: Arc<AtomicU64>,
}

impl TaskIdGenerator {
    /// Create a new task ID generator.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate the next task ID.
    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Task state.
///
/// `Pending → Running → {Completed | Failed | TimedOut | Cancelled} → Retired`,
/// with `Pending → Cancelled` for tasks cancelled before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in the pending queue for a dependency or a free slot.
    Pending,
    /// Body handed to the worker pool.
    Running,
    /// Body returned a value.
    Completed,
    /// Body returned an error or panicked.
    Failed,
    /// Timeout expired before the body returned.
    TimedOut,
    /// Cancelled before dispatch.
    Cancelled,
    /// Bookkeeping finished; the descriptor is gone.
    Retired,
}

impl TaskState {
    /// Whether no further transition except `Retired` can happen.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed
                | TaskState::Failed
                | TaskState::TimedOut
                | TaskState::Cancelled
                | TaskState::Retired
        )
    }

    /// Terminal state for a delivered result.
    pub fn of_result<T>(result: &Result<T, TaskError>) -> Self {
        match result {
            Ok(_) => TaskState::Completed,
            Err(TaskError::Body(_)) => TaskState::Failed,
            Err(TaskError::TimedOut { .. }) => TaskState::TimedOut,
            Err(TaskError::Cancelled { .. }) => TaskState::Cancelled,
        }
    }
}

/// Work handed to a worker thread.
pub(crate) type Job = Box<dyn FnOnce(&CancelToken) + Send>;

/// Control-context half of a dispatched task.
pub(crate) trait Completion: Send {
    /// Run the completion callback and report the terminal state. A
    /// synthesized error replaces whatever the body produced. Calls after the
    /// first are ignored and report `Retired`.
    fn complete(
        &mut self,
        synthesized: Option<TaskError>,
    ) -> TaskState;

    /// Release the task input. Hands `self` back if a body still shares it.
    fn release(self: Box<Self>) -> Option<Box<dyn Completion>>;
}

/// Type-erased body, input and completion of a task.
pub(crate) trait TaskWork: Send {
    /// Split into the worker half and the control-context half.
    fn split(self: Box<Self>) -> (Job, Box<dyn Completion>);

    /// Deliver `error` without ever running the body.
    fn abandon(
        self: Box<Self>,
        error: TaskError,
    );
}

type InputDestroy<I> = Box<dyn FnOnce(I) + Send>;

struct Work<I, O, B, C> {
    tag: Tag,
    input: Arc<I>,
    body: B,
    on_complete: C,
    input_destroy: Option<InputDestroy<I>>,
    _output: PhantomData<fn() -> O>,
}

impl<I, O, B, C> TaskWork for Work<I, O, B, C>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
    B: FnOnce(&I, &CancelToken) -> anyhow::Result<O> + Send + 'static,
    C: FnOnce(&I, Result<O, TaskError>) + Send + 'static,
{
    fn split(self: Box<Self>) -> (Job, Box<dyn Completion>) {
        let Work {
            tag,
            input,
            body,
            on_complete,
            input_destroy,
            ..
        } = *self;

        let slot = Arc::new(Mutex::new(None));
        let job_input = Arc::clone(&input);
        let job_slot = Arc::clone(&slot);

        // The worker's input reference is gone before it reports back.
        let job: Job = Box::new(move |token: &CancelToken| {
            let result = body(&job_input, token);
            drop(job_input);
            *job_slot.lock() = Some(result);
        });

        let delivery = Delivery {
            tag,
            input,
            slot,
            on_complete: Some(on_complete),
            input_destroy,
        };
        (job, Box::new(delivery))
    }

    fn abandon(
        self: Box<Self>,
        error: TaskError,
    ) {
        let Work {
            input,
            on_complete,
            input_destroy,
            ..
        } = *self;

        on_complete(&input, Err(error));
        if let (Ok(value), Some(destroy)) = (Arc::try_unwrap(input), input_destroy) {
            destroy(value);
        }
    }
}

struct Delivery<I, O, C> {
    tag: Tag,
    input: Arc<I>,
    slot: Arc<Mutex<Option<anyhow::Result<O>>>>,
    on_complete: Option<C>,
    input_destroy: Option<InputDestroy<I>>,
}

impl<I, O, C> Completion for Delivery<I, O, C>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
    C: FnOnce(&I, Result<O, TaskError>) + Send + 'static,
{
    fn complete(
        &mut self,
        synthesized: Option<TaskError>,
    ) -> TaskState {
        let Some(on_complete) = self.on_complete.take() else {
            return TaskState::Retired;
        };

        let result = match synthesized {
            Some(error) => Err(error),
            None => match self.slot.lock().take() {
                Some(Ok(output)) => Ok(output),
                Some(Err(error)) => Err(TaskError::Body(error)),
                None => Err(TaskError::Body(anyhow::anyhow!(
                    "task '{}' body panicked",
                    self.tag
                ))),
            },
        };
        let state = TaskState::of_result(&result);
        on_complete(&self.input, result);
        state
    }

    fn release(self: Box<Self>) -> Option<Box<dyn Completion>> {
        let Delivery {
            tag,
            input,
            slot,
            on_complete,
            input_destroy,
        } = *self;

        match Arc::try_unwrap(input) {
            Ok(value) => {
                if let Some(destroy) = input_destroy {
                    destroy(value);
                }
                None
            },
            Err(input) => Some(Box::new(Delivery {
                tag,
                input,
                slot,
                on_complete,
                input_destroy,
            })),
        }
    }
}

/// Immutable description of one unit of work.
///
/// Build with [`TaskSpec::builder`].
pub struct TaskSpec {
    tag: Tag,
    dependencies: SmallVec<[Tag; 4]>,
    priority: i32,
    lifo: bool,
    timeout: Option<Duration>,
    work: Box<dyn TaskWork>,
}

impl fmt::Debug for TaskSpec {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("tag", &self.tag)
            .field("dependencies", &self.dependencies)
            .field("priority", &self.priority)
            .field("lifo", &self.lifo)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TaskSpec {
    /// Start describing a task with the given tag.
    #[inline]
    pub fn builder(tag: impl Into<Tag>) -> TaskSpecBuilder {
        TaskSpecBuilder::new(tag)
    }

    /// Get the tag.
    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Get the tags this task waits on.
    #[inline]
    pub fn dependencies(&self) -> &[Tag] {
        &self.dependencies
    }

    /// Get the priority (lower runs first).
    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Whether the task jumps ahead of equal-priority entries.
    #[inline]
    pub fn is_lifo(&self) -> bool {
        self.lifo
    }

    /// Get the timeout. `None` defers to the scheduler default;
    /// `Some(Duration::ZERO)` disables the timeout.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn into_work(self) -> Box<dyn TaskWork> {
        self.work
    }
}

/// Builder for [`TaskSpec`].
#[derive(Debug, Clone)]
pub struct TaskSpecBuilder {
    tag: Tag,
    dependencies: SmallVec<[Tag; 4]>,
    priority: i32,
    lifo: bool,
    timeout: Option<Duration>,
}

impl TaskSpecBuilder {
    /// Create a new builder.
    #[inline]
    pub fn new(tag: impl Into<Tag>) -> Self {
        Self {
            tag: tag.into(),
            dependencies: SmallVec::new(),
            priority: 0,
            lifo: false,
            timeout: None,
        }
    }

    /// Wait for every running task tagged `tag`.
    #[inline]
    pub fn depends_on(
        mut self,
        tag: impl Into<Tag>,
    ) -> Self {
        self.dependencies.push(tag.into());
        self
    }

    /// Wait for every running task carrying one of `tags`.
    pub fn dependencies<T>(
        mut self,
        tags: impl IntoIterator<Item = T>,
    ) -> Self
    where
        T: Into<Tag>,
    {
        self.dependencies.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Set the priority. Lower values dispatch first; negative values are
    /// meant for latency-sensitive work.
    #[inline]
    pub fn priority(
        mut self,
        priority: i32,
    ) -> Self {
        self.priority = priority;
        self
    }

    /// Queue ahead of existing entries with the same priority.
    #[inline]
    pub fn lifo(
        mut self,
        lifo: bool,
    ) -> Self {
        self.lifo = lifo;
        self
    }

    /// Set the timeout. `Duration::ZERO` means no timeout.
    #[inline]
    pub fn timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the timeout in milliseconds. `0` means no timeout.
    #[inline]
    pub fn timeout_ms(
        self,
        timeout_ms: u64,
    ) -> Self {
        self.timeout(Duration::from_millis(timeout_ms))
    }

    /// Finish the descriptor.
    ///
    /// `body` runs on a worker thread; `on_complete` runs on the control
    /// context exactly once, after which `input` is dropped.
    pub fn build<I, O, B, C>(
        self,
        input: I,
        body: B,
        on_complete: C,
    ) -> TaskSpec
    where
        I: Send + Sync + 'static,
        O: Send + 'static,
        B: FnOnce(&I, &CancelToken) -> anyhow::Result<O> + Send + 'static,
        C: FnOnce(&I, Result<O, TaskError>) + Send + 'static,
    {
        self.finish(input, body, on_complete, None)
    }

    /// Finish the descriptor with a cleanup hook for `input`.
    ///
    /// `input_destroy` runs after `on_complete` and after the scheduler has
    /// dispatched whatever the retirement unblocked.
    pub fn build_with_destroy<I, O, B, C, D>(
        self,
        input: I,
        body: B,
        on_complete: C,
        input_destroy: D,
    ) -> TaskSpec
    where
        I: Send + Sync + 'static,
        O: Send + 'static,
        B: FnOnce(&I, &CancelToken) -> anyhow::Result<O> + Send + 'static,
        C: FnOnce(&I, Result<O, TaskError>) + Send + 'static,
        D: FnOnce(I) + Send + 'static,
    {
        self.finish(input, body, on_complete, Some(Box::new(input_destroy)))
    }

    fn finish<I, O, B, C>(
        self,
        input: I,
        body: B,
        on_complete: C,
        input_destroy: Option<InputDestroy<I>>,
    ) -> TaskSpec
    where
        I: Send + Sync + 'static,
        O: Send + 'static,
        B: FnOnce(&I, &CancelToken) -> anyhow::Result<O> + Send + 'static,
        C: FnOnce(&I, Result<O, TaskError>) + Send + 'static,
    {
        let work = Work {
            tag: self.tag,
            input: Arc::new(input),
            body,
            on_complete,
            input_destroy,
            _output: PhantomData,
        };

        TaskSpec {
            tag: self.tag,
            dependencies: self.dependencies,
            priority: self.priority,
            lifo: self.lifo,
            timeout: self.timeout,
            work: Box::new(work),
        }
    }
}

/// Handle returned by a successful submission.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    tag: Tag,
    token: CancelToken,
}

impl TaskHandle {
    pub(crate) fn new(
        id: TaskId,
        tag: Tag,
        token: CancelToken,
    ) -> Self {
        Self { id, tag, token }
    }

    /// Get the task ID.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Get the tag, usable with `cancel`.
    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// The token the body observes. Cancelling it only signals the body; use
    /// `Loom::cancel` to also drop a still-pending task.
    #[inline]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }
}
