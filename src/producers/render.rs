//! Page rendering tasks.
//!
//! Rendering is latency sensitive and the page the user scrolled to last is
//! the one they want to see, so render tasks run ahead of background work and
//! the newest request jumps ahead of older ones.

use crate::scheduler::{CancelToken, TaskError, TaskSpec};

/// Priority of page renders.
pub const RENDER_PRIORITY: i32 = -1;

/// Tag of the render task for `page`.
pub fn render_tag(page: u32) -> String {
    format!("render-page-{}", page)
}

/// Build a render task for `page`.
///
/// Cancelling [`render_tag`]`(page)` drops a render that has not started yet,
/// e.g. when the page scrolls out of view.
pub fn render_page<I, O, B, C>(
    page: u32,
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
    TaskSpec::builder(render_tag(page))
        .priority(RENDER_PRIORITY)
        .lifo(true)
        .build(input, body, on_complete)
}
