//! Scheduler unit tests
//!
//! Shared helpers: tasks that record what happened into a shared log, and
//! gated tasks whose body blocks until the test releases it.


use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

use crate::scheduler::{TaskSpec, TaskSpecBuilder};

/// How long a gated body waits before giving up on its own.
pub(super) const GATE_LIMIT: Duration = Duration::from_secs(10);

pub(super) type Log = Arc<Mutex<Vec<String>>>;

pub(super) fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub(super) fn entries(log: &Log) -> Vec<String> {
    log.lock().clone()
}

/// Position of `entry` in the log.
pub(super) fn index_of(
    log: &Log,
    entry: &str,
) -> usize {
    entries(log)
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("'{}' not in log {:?}", entry, entries(log)))
}

/// Task logging `start:<name>` from its body and `done:<name>` from its
/// completion callback.
pub(super) fn recorded(
    builder: TaskSpecBuilder,
    name: &str,
    log: &Log,
) -> TaskSpec {
    let body_log = log.clone();
    let done_log = log.clone();
    let body_name = name.to_string();
    let done_name = name.to_string();
    builder.build(
        (),
        move |_: &(), _| {
            body_log.lock().push(format!("start:{}", body_name));
            Ok(())
        },
        move |_: &(), result: Result<(), _>| {
            let outcome = if result.is_ok() { "done" } else { "failed" };
            done_log.lock().push(format!("{}:{}", outcome, done_name));
        },
    )
}

/// Like [`recorded`], but the body blocks until the returned sender fires.
pub(super) fn gated(
    builder: TaskSpecBuilder,
    name: &str,
    log: &Log,
) -> (TaskSpec, Sender<()>) {
    let (release, gate) = channel::bounded::<()>(1);
    let body_log = log.clone();
    let done_log = log.clone();
    let body_name = name.to_string();
    let done_name = name.to_string();
    let spec = builder.build(
        gate,
        move |gate, _| {
            body_log.lock().push(format!("start:{}", body_name));
            let _ = gate.recv_timeout(GATE_LIMIT);
            body_log.lock().push(format!("end:{}", body_name));
            Ok(())
        },
        move |_, result: Result<(), _>| {
            let outcome = if result.is_ok() { "done" } else { "failed" };
            done_log.lock().push(format!("{}:{}", outcome, done_name));
        },
    );
    (spec, release)
}
