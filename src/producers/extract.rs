//! Metadata extraction through the external `paperparser` program.
//!
//! The parser is a separate executable that takes a PDF path and prints JSON
//! of the form `{"predicted_spans": [{"entity": "TITLE", "text": "..."}]}`.
//! Extraction tasks share the [`EXTRACT_TAG`] tag, so persistence tasks
//! depending on it never write while a parse is in flight.

use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::scheduler::{CancelToken, TaskError, TaskSpec};

/// Tag of extraction tasks.
pub const EXTRACT_TAG: &str = "parser";

/// Parser executable name.
pub const PARSER_EXE_NAME: &str = "paperparser";

/// Parser location relative to the directory of the running binary.
pub const PARSER_REL_PATH: &str = "paperparser/paperparser";

/// Environment override for the parser location.
pub const PARSER_ENV: &str = "PAPERPARSER_PATH";

/// How often a running parser is checked for exit or cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bibliographic metadata of one paper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    /// Publication year, 0 when unknown.
    #[serde(default)]
    pub year: u32,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, rename = "abstract")]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub arxiv_id: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    pub pdf_file: PathBuf,
}

impl PaperMetadata {
    /// Empty record for `pdf_file`.
    pub fn new(pdf_file: impl Into<PathBuf>) -> Self {
        Self {
            pdf_file: pdf_file.into(),
            ..Self::default()
        }
    }
}

/// Extraction errors
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("could not locate '{}' anywhere", PARSER_EXE_NAME)]
    NotFound,

    #[error("failed to run {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("lost track of the parser process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("paperparser failed ({status})")]
    Failed { status: ExitStatus },

    #[error("extraction of {} was cancelled", pdf.display())]
    Cancelled { pdf: PathBuf },

    #[error("failed to parse parser output: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ParserOutput {
    #[serde(default)]
    predicted_spans: Vec<PredictedSpan>,
}

#[derive(Debug, Deserialize)]
struct PredictedSpan {
    #[serde(default)]
    entity: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

/// Find the parser executable.
///
/// Looks next to the running binary first, then at `$PAPERPARSER_PATH`, then
/// on `PATH`.
pub fn locate_parser() -> Result<PathBuf, ExtractError> {
    let beside_exe = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(PARSER_REL_PATH)));
    if let Some(candidate) = beside_exe.filter(|path| is_executable(path)) {
        return Ok(candidate);
    }

    if let Some(candidate) = env::var_os(PARSER_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .filter(|path| is_executable(path))
    {
        return Ok(candidate);
    }

    find_in_path(PARSER_EXE_NAME).ok_or(ExtractError::NotFound)
}

/// Search `PATH` for an executable called `name`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Run `program` on `pdf` and parse what it prints.
///
/// Blocks until the parser exits. If `token` is cancelled first the child is
/// killed and [`ExtractError::Cancelled`] returned.
pub fn run_parser(
    program: &Path,
    pdf: &Path,
    token: &CancelToken,
) -> Result<PaperMetadata, ExtractError> {
    info!("Parsing '{}'...", pdf.display());
    let mut child = Command::new(program)
        .arg(pdf)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| ExtractError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;

    // Drain stdout on the side so a chatty parser never blocks on a full pipe.
    let reader = child.stdout.take().map(|mut stdout| {
        thread::spawn(move || {
            let mut buffer = String::new();
            stdout.read_to_string(&mut buffer).map(|_| buffer)
        })
    });

    // A killed parser may leave grandchildren holding the pipe, so the reader
    // is left to finish on its own.
    let Some(status) = wait_or_kill(&mut child, token).map_err(ExtractError::Wait)? else {
        return Err(ExtractError::Cancelled {
            pdf: pdf.to_path_buf(),
        });
    };

    let output = match reader.map(|handle| handle.join()) {
        Some(Ok(Ok(output))) => output,
        Some(Ok(Err(error))) => return Err(ExtractError::Wait(error)),
        Some(Err(_)) | None => String::new(),
    };
    if !status.success() {
        return Err(ExtractError::Failed { status });
    }
    parse_parser_output(&output, pdf)
}

/// Wait for `child`, killing it if `token` is cancelled. `None` means killed.
pub(crate) fn wait_or_kill(
    child: &mut Child,
    token: &CancelToken,
) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if token.is_cancelled() {
            debug!(pid = child.id(), "killing cancelled child process");
            // Already exited if this fails; wait() below reaps it either way.
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Turn parser JSON into metadata for `pdf`.
///
/// Unknown entities are ignored; a later `TITLE`, `YEAR`, etc. replaces an
/// earlier one while every `AUTHOR` is kept in order.
pub fn parse_parser_output(
    output: &str,
    pdf: &Path,
) -> Result<PaperMetadata, ExtractError> {
    let parsed: ParserOutput = serde_json::from_str(output)?;
    let mut paper = PaperMetadata::new(pdf);

    for span in parsed.predicted_spans {
        let (Some(entity), Some(text)) = (span.entity, span.text) else {
            continue;
        };
        match entity.as_str() {
            "TITLE" => paper.title = Some(text),
            "AUTHOR" => paper.authors.push(text),
            "YEAR" => paper.year = leading_number(&text),
            "ARXIV_ID" => paper.arxiv_id = Some(text),
            "DOI" => paper.doi = Some(text),
            "ABSTRACT" => paper.abstract_text = Some(text),
            _ => {},
        }
    }
    Ok(paper)
}

/// Leading decimal digits of `text`, 0 if there are none.
fn leading_number(text: &str) -> u32 {
    let digits: String = text
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

/// Build an extraction task for `pdf`.
///
/// The parser is located when the body starts, so installing it after the
/// task was queued still works.
pub fn extract_metadata<C>(
    pdf: impl Into<PathBuf>,
    on_complete: C,
) -> TaskSpec
where
    C: FnOnce(&PathBuf, Result<PaperMetadata, TaskError>) + Send + 'static,
{
    TaskSpec::builder(EXTRACT_TAG).build(
        pdf.into(),
        |pdf: &PathBuf, token| {
            let program = locate_parser()?;
            Ok(run_parser(&program, pdf, token)?)
        },
        on_complete,
    )
}
