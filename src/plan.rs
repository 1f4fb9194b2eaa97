//! Command plans.
//!
//! A plan is a TOML file listing shell-free commands as tasks:
//!
//! ```toml
//! [[task]]
//! tag = "parser"
//! command = "paperparser"
//! args = ["paper.pdf"]
//! timeout_ms = 30000
//!
//! [[task]]
//! tag = "write-json"
//! command = "cp"
//! args = ["out.json", "ppdb.json"]
//! depends_on = ["parser"]
//! priority = 5
//! ```
//!
//! Tasks are handed to the scheduler in file order. A task is held back until
//! every earlier task it depends on has been dispatched, so `depends_on`
//! always orders it after them.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use hashbrown::HashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::producers::extract::wait_or_kill;
use crate::scheduler::{Loom, LoomStats, SubmitError, Tag, TaskError, TaskSpec, TaskState};

/// How long the runner waits for events while holding tasks back.
const HOLD_POLL: Duration = Duration::from_millis(20);

/// A parsed plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, rename = "task")]
    pub tasks: Vec<PlanTask>,
}

/// One `[[task]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTask {
    pub tag: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub lifo: bool,
    /// `None` uses the scheduler default; 0 disables the timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Plan errors
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read plan {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("plan parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("task #{index} has an empty tag")]
    EmptyTag { index: usize },

    #[error("task '{tag}' depends on '{dependency}', which is not declared before it")]
    UnknownDependency { tag: String, dependency: String },

    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Outcome of one plan task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub tag: String,
    pub state: TaskState,
    /// Error message for anything but `Completed`.
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl fmt::Display for TaskOutcome {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let state = format!("{:?}", self.state);
        write!(
            f,
            "{:<12} {:<10} {:>6}ms",
            self.tag,
            state,
            self.elapsed.as_millis()
        )?;
        if let Some(error) = &self.error {
            write!(f, "  {}", error)?;
        }
        Ok(())
    }
}

/// Result of running a plan.
#[derive(Debug, Clone)]
pub struct PlanReport {
    /// Outcomes in completion order.
    pub outcomes: Vec<TaskOutcome>,
    pub stats: LoomStats,
}

impl PlanReport {
    /// Whether every task completed.
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.state == TaskState::Completed)
    }
}

impl Plan {
    /// Load a plan file.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let content = fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate plan text.
    pub fn parse(content: &str) -> Result<Self, PlanError> {
        let plan: Plan = toml::from_str(content)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Check tags and that every dependency is declared earlier.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut declared = HashSet::new();
        for (index, task) in self.tasks.iter().enumerate() {
            if task.tag.is_empty() {
                return Err(PlanError::EmptyTag { index });
            }
            if let Some(missing) = task.depends_on.iter().find(|d| !declared.contains(d.as_str())) {
                return Err(PlanError::UnknownDependency {
                    tag: task.tag.clone(),
                    dependency: missing.clone(),
                });
            }
            declared.insert(task.tag.as_str());
        }
        Ok(())
    }

    /// Run every task on `loom` and wait for all of them.
    pub fn run(
        &self,
        loom: &mut Loom,
    ) -> Result<PlanReport, PlanError> {
        let outcomes = Arc::new(Mutex::new(Vec::with_capacity(self.tasks.len())));
        let stats_before = loom.stats();

        for task in &self.tasks {
            let dependencies: Vec<Tag> = task.depends_on.iter().map(|d| Tag::new(d)).collect();
            while dependencies.iter().any(|&dependency| loom.is_pending(dependency)) {
                loom.pump_timeout(HOLD_POLL);
            }
            let handle = loom.submit(task.to_spec(outcomes.clone()))?;
            debug!(tag = %handle.tag(), id = %handle.id(), "plan task submitted");
        }
        loom.run_until_idle();

        let stats = loom.stats();
        let outcomes = std::mem::take(&mut *outcomes.lock());
        info!(tasks = outcomes.len(), "plan finished");
        Ok(PlanReport {
            outcomes,
            stats: LoomStats {
                submitted: stats.submitted - stats_before.submitted,
                dispatched: stats.dispatched - stats_before.dispatched,
                completed: stats.completed - stats_before.completed,
                failed: stats.failed - stats_before.failed,
                timed_out: stats.timed_out - stats_before.timed_out,
                cancelled: stats.cancelled - stats_before.cancelled,
                late_results_dropped: stats.late_results_dropped - stats_before.late_results_dropped,
                peak_running: stats.peak_running,
            },
        })
    }
}

impl PlanTask {
    fn to_spec(
        &self,
        outcomes: Arc<Mutex<Vec<TaskOutcome>>>,
    ) -> TaskSpec {
        let mut builder = TaskSpec::builder(self.tag.as_str())
            .dependencies(self.depends_on.iter().map(String::as_str))
            .priority(self.priority)
            .lifo(self.lifo);
        if let Some(timeout_ms) = self.timeout_ms {
            builder = builder.timeout_ms(timeout_ms);
        }

        let queued = Instant::now();
        builder.build(
            self.clone(),
            |task: &PlanTask, token| {
                let mut child = Command::new(&task.command)
                    .args(&task.args)
                    .stdin(Stdio::null())
                    .spawn()
                    .with_context(|| format!("failed to run '{}'", task.command))?;
                match wait_or_kill(&mut child, token)? {
                    Some(status) if status.success() => Ok(()),
                    Some(status) => anyhow::bail!("'{}' exited with {}", task.command, status),
                    None => anyhow::bail!("'{}' was killed", task.command),
                }
            },
            move |task: &PlanTask, result: Result<(), TaskError>| {
                outcomes.lock().push(TaskOutcome {
                    tag: task.tag.clone(),
                    state: TaskState::of_result(&result),
                    error: result.err().map(|e| e.to_string()),
                    elapsed: queued.elapsed(),
                });
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan() {
        let plan = Plan::parse(
            r#"
            [[task]]
            tag = "parser"
            command = "true"

            [[task]]
            tag = "write-json"
            command = "true"
            args = ["-x"]
            depends_on = ["parser"]
            priority = 5
            timeout_ms = 0
            "#,
        )
        .unwrap();

        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[0].priority, 0);
        assert_eq!(plan.tasks[0].timeout_ms, None);
        assert_eq!(plan.tasks[1].depends_on, vec!["parser"]);
        assert_eq!(plan.tasks[1].timeout_ms, Some(0));
    }

    #[test]
    fn test_forward_dependency_rejected() {
        let err = Plan::parse(
            r#"
            [[task]]
            tag = "write-json"
            command = "true"
            depends_on = ["parser"]

            [[task]]
            tag = "parser"
            command = "true"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { .. }));
        assert!(err.to_string().contains("'parser'"));
    }

    #[test]
    fn test_empty_tag_rejected() {
        let err = Plan::parse("[[task]]\ntag = \"\"\ncommand = \"true\"\n").unwrap_err();
        assert!(matches!(err, PlanError::EmptyTag { index: 0 }));
    }

    #[test]
    fn test_empty_plan() {
        let plan = Plan::parse("").unwrap();
        let mut loom = Loom::with_capacity(1).unwrap();
        let report = plan.run(&mut loom).unwrap();
        assert!(report.outcomes.is_empty());
        assert!(report.succeeded());
    }

    #[test]
    fn test_outcome_display() {
        let outcome = TaskOutcome {
            tag: "parser".to_string(),
            state: TaskState::Failed,
            error: Some("boom".to_string()),
            elapsed: Duration::from_millis(12),
        };
        let line = outcome.to_string();
        assert!(line.starts_with("parser"));
        assert!(line.contains("Failed"));
        assert!(line.ends_with("  boom"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_plan_orders_dependencies() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("parsed");
        let copy = dir.path().join("copied");
        let plan = Plan {
            tasks: vec![
                PlanTask {
                    tag: "parser".to_string(),
                    command: "sh".to_string(),
                    args: vec![
                        "-c".to_string(),
                        format!("sleep 0.1 && echo done > '{}'", marker.display()),
                    ],
                    depends_on: Vec::new(),
                    priority: 0,
                    lifo: false,
                    timeout_ms: None,
                },
                PlanTask {
                    tag: "write-json".to_string(),
                    command: "cp".to_string(),
                    args: vec![marker.display().to_string(), copy.display().to_string()],
                    depends_on: vec!["parser".to_string()],
                    priority: 5,
                    lifo: false,
                    timeout_ms: None,
                },
            ],
        };

        let mut loom = Loom::with_capacity(2).unwrap();
        let report = plan.run(&mut loom).unwrap();
        assert!(report.succeeded(), "{:?}", report.outcomes);
        assert_eq!(report.outcomes[0].tag, "parser");
        assert_eq!(fs::read_to_string(&copy).unwrap().trim(), "done");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_plan_reports_failure_and_timeout() {
        let plan = Plan::parse(
            r#"
            [[task]]
            tag = "fails"
            command = "false"

            [[task]]
            tag = "hangs"
            command = "sleep"
            args = ["10"]
            timeout_ms = 50
            "#,
        )
        .unwrap();

        let mut loom = Loom::with_capacity(2).unwrap();
        let report = plan.run(&mut loom).unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.timed_out, 1);

        let hangs = report.outcomes.iter().find(|o| o.tag == "hangs").unwrap();
        assert_eq!(hangs.state, TaskState::TimedOut);
    }
}
