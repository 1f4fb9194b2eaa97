//! Reaching the control context from other threads.
//!
//! A [`LoomHandle`] only posts messages; the owning [`Loom`] applies them the
//! next time it pumps. [`LoomThread`] gives a `Loom` its own control thread
//! for applications that have no event loop to pump it from.

use std::io;
use std::thread;

use crossbeam::channel::Sender;
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use super::cancel::CancelToken;
use super::error::SubmitError;
use super::tag::Tag;
use super::task::{TaskHandle, TaskIdGenerator, TaskSpec};
use super::{ControlMsg, Loom, LoomStats};
use crate::util::config::LoomConfig;

/// Cloneable, thread-safe front end of a [`Loom`].
#[derive(Debug, Clone)]
pub struct LoomHandle {
    events: Sender<ControlMsg>,
    ids: TaskIdGenerator,
}

impl LoomHandle {
    pub(crate) fn new(
        events: Sender<ControlMsg>,
        ids: TaskIdGenerator,
    ) -> Self {
        Self { events, ids }
    }

    /// Post a task to the control context.
    ///
    /// An empty tag is rejected here, synchronously. Dispatch happens when
    /// the owning `Loom` next pumps.
    pub fn submit(
        &self,
        spec: TaskSpec,
    ) -> Result<TaskHandle, SubmitError> {
        if spec.tag().is_empty() {
            return Err(SubmitError::EmptyTag);
        }
        let id = self.ids.next();
        let token = CancelToken::new();
        let handle = TaskHandle::new(id, spec.tag(), token.clone());
        self.events
            .send(ControlMsg::Submit { id, token, spec })
            .map_err(|_| SubmitError::Closed)?;
        Ok(handle)
    }

    /// Post a cancellation for `tag`.
    pub fn cancel(
        &self,
        tag: impl Into<Tag>,
    ) -> Result<(), SubmitError> {
        self.events
            .send(ControlMsg::Cancel(tag.into()))
            .map_err(|_| SubmitError::Closed)
    }

    /// Ask the control context to shut down.
    pub fn shutdown(&self) -> Result<(), SubmitError> {
        self.events
            .send(ControlMsg::Shutdown)
            .map_err(|_| SubmitError::Closed)
    }
}

/// A [`Loom`] running on its own control thread.
///
/// Dropping it shuts the scheduler down and waits for the control thread.
#[derive(Debug)]
pub struct LoomThread {
    handle: LoomHandle,
    thread: Option<thread::JoinHandle<LoomStats>>,
}

impl LoomThread {
    /// Spawn a control thread owning a new `Loom`.
    pub fn spawn(config: LoomConfig) -> io::Result<Self> {
        let loom = Loom::with_config(config)?;
        let handle = loom.handle();
        let thread = thread::Builder::new()
            .name("loom-control".to_string())
            .spawn(move || loom.run_until_shutdown())?;

        debug!("control thread started");
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Get the handle.
    #[inline]
    pub fn handle(&self) -> &LoomHandle {
        &self.handle
    }

    /// Shut down and wait for the control thread. Returns final statistics.
    pub fn join(mut self) -> Option<LoomStats> {
        self.stop()
    }

    fn stop(&mut self) -> Option<LoomStats> {
        let thread = self.thread.take()?;
        // Already gone if the send fails; join reports how it ended.
        let _ = self.handle.shutdown();
        match thread.join() {
            Ok(stats) => Some(stats),
            Err(_) => {
                warn!("control thread panicked");
                None
            },
        }
    }
}

impl Drop for LoomThread {
    fn drop(&mut self) {
        self.stop();
    }
}

static DEFAULT_LOOM: OnceCell<LoomThread> = OnceCell::new();

/// Process-wide default scheduler.
///
/// The first call spawns a [`LoomThread`] configured from the user config
/// file and environment; every later call returns the same cached handle.
/// Its control thread lives until the process exits. Prefer creating a
/// `Loom` explicitly and passing it by reference; this exists for code that
/// has nowhere to thread one through.
pub fn default_handle() -> io::Result<&'static LoomHandle> {
    DEFAULT_LOOM
        .get_or_try_init(|| {
            let config = crate::util::config::load_user_config()
                .unwrap_or_else(|error| {
                    warn!("ignoring unreadable config: {}", error);
                    LoomConfig::default()
                })
                .apply_env();
            LoomThread::spawn(config)
        })
        .map(LoomThread::handle)
}
