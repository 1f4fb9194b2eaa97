//! taskloom
//!
//! An in-process, dependency-aware task scheduler. Tasks carry a tag, the tags
//! they wait on, a priority and an optional timeout; bodies run on a bounded
//! worker pool while every result is delivered, exactly once, back on the
//! thread that owns the scheduler.
//!
//! # Example
//!
//! ```no_run
//! use taskloom::{Loom, Result, TaskError, TaskSpec};
//!
//! fn main() -> Result<()> {
//!     let mut loom = Loom::with_capacity(2)?;
//!
//!     loom.submit(TaskSpec::builder("parser").build(
//!         "paper.pdf".to_string(),
//!         |path: &String, _token| Ok(path.len()),
//!         |_: &String, result: std::result::Result<usize, TaskError>| {
//!             println!("parsed: {:?}", result.map_err(|e| e.to_string()));
//!         },
//!     ))?;
//!     loom.submit(
//!         TaskSpec::builder("write-json")
//!             .priority(5)
//!             .depends_on("parser")
//!             .build((), |_: &(), _| Ok(()), |_: &(), _: std::result::Result<(), TaskError>| {}),
//!     )?;
//!
//!     loom.run_until_idle();
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/taskloom")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod plan;
pub mod producers;
pub mod scheduler;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use scheduler::{
    default_handle, CancelReport, CancelToken, Loom, LoomHandle, LoomStats, LoomThread, SubmitError, Tag,
    TaskError, TaskHandle, TaskId, TaskSpec, TaskSpecBuilder, TaskState,
};
pub use util::config::LoomConfig;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "taskloom";
