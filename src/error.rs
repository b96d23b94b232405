//! Error taxonomy for the spawning engine.
//!
//! Two layers: `SpawnError` is the low-level cause (an I/O failure, a
//! timeout, a protocol violation), while `SpawnException` is the fully
//! assembled report handed back to the caller, carrying the journey
//! snapshot and everything an error page needs.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::journey::Journey;

/// Broad failure classification, persisted to
/// `response/error/category` and into every `SpawnException`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    InternalError,
    OperatingSystemError,
    IoError,
    TimeoutError,
    UnknownError,
}

impl ErrorCategory {
    pub fn name(self) -> &'static str {
        match self {
            ErrorCategory::InternalError => "INTERNAL_ERROR",
            ErrorCategory::OperatingSystemError => "OPERATING_SYSTEM_ERROR",
            ErrorCategory::IoError => "IO_ERROR",
            ErrorCategory::TimeoutError => "TIMEOUT_ERROR",
            ErrorCategory::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "INTERNAL_ERROR" => ErrorCategory::InternalError,
            "OPERATING_SYSTEM_ERROR" => ErrorCategory::OperatingSystemError,
            "IO_ERROR" => ErrorCategory::IoError,
            "TIMEOUT_ERROR" => ErrorCategory::TimeoutError,
            _ => ErrorCategory::UnknownError,
        }
    }

    /// Infer the category from the underlying error kind.
    pub fn from_spawn_error(err: &SpawnError) -> Self {
        match err {
            SpawnError::Io(_) => ErrorCategory::IoError,
            SpawnError::Os { .. } => ErrorCategory::OperatingSystemError,
            SpawnError::Timeout(_) => ErrorCategory::TimeoutError,
            _ => ErrorCategory::InternalError,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Low-level error type used by the engine's internal helpers.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{msg} (errno={errno})")]
    Os { msg: String, errno: i32 },

    #[error("{0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid journey step: {0}")]
    InvalidStep(String),

    #[error("{0}")]
    InvalidTransition(String),

    #[error("{0}")]
    Internal(String),
}

impl SpawnError {
    pub fn os(msg: impl Into<String>, errno: nix::errno::Errno) -> Self {
        SpawnError::Os {
            msg: format!("{}: {}", msg.into(), errno.desc()),
            errno: errno as i32,
        }
    }
}

impl From<nix::errno::Errno> for SpawnError {
    fn from(err: nix::errno::Errno) -> Self {
        SpawnError::Os {
            msg: "system call failed".to_string(),
            errno: err as i32,
        }
    }
}

/// Result type alias for the engine's internal operations.
pub type Result<T> = std::result::Result<T, SpawnError>;

/// The assembled spawn failure report.
///
/// Accumulates everything needed to render a forensic error page:
/// category, the journey snapshot at the time of failure, a one-line
/// summary, operator-facing details, problem/solution HTML fragments,
/// any captured subprocess output, and freeform annotations.
#[derive(Debug, Clone)]
pub struct SpawnException {
    category: ErrorCategory,
    journey: Journey,
    summary: String,
    advanced_problem_details: Option<String>,
    problem_description_html: Option<String>,
    solution_description_html: Option<String>,
    stdout_and_err_data: Option<String>,
    annotations: BTreeMap<String, String>,
}

impl SpawnException {
    pub fn new(category: ErrorCategory, journey: &Journey) -> Self {
        SpawnException {
            category,
            journey: journey.clone(),
            summary: String::new(),
            advanced_problem_details: None,
            problem_description_html: None,
            solution_description_html: None,
            stdout_and_err_data: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Wrap a low-level error, inferring the category from its kind and
    /// seeding the summary from its message.
    pub fn from_error(err: &SpawnError, journey: &Journey) -> Self {
        let mut e = SpawnException::new(ErrorCategory::from_spawn_error(err), journey);
        e.summary = err.to_string();
        e
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) -> &mut Self {
        self.summary = summary.into();
        self
    }

    pub fn set_advanced_problem_details(&mut self, details: impl Into<String>) -> &mut Self {
        self.advanced_problem_details = Some(details.into());
        self
    }

    pub fn set_problem_description_html(&mut self, html: impl Into<String>) -> &mut Self {
        self.problem_description_html = Some(html.into());
        self
    }

    pub fn set_solution_description_html(&mut self, html: impl Into<String>) -> &mut Self {
        self.solution_description_html = Some(html.into());
        self
    }

    pub fn set_stdout_and_err_data(&mut self, data: impl Into<String>) -> &mut Self {
        self.stdout_and_err_data = Some(data.into());
        self
    }

    /// Sets an annotation. With `overwrite == false` an existing value
    /// is preserved.
    pub fn set_annotation(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        overwrite: bool,
    ) -> &mut Self {
        let name = name.into();
        if overwrite || !self.annotations.contains_key(&name) {
            self.annotations.insert(name, value.into());
        }
        self
    }

    /// Fills in default problem/solution HTML from the summary so that
    /// every surfaced exception renders to something.
    pub fn finalize(mut self) -> Self {
        if self.summary.is_empty() {
            self.summary = "An error occurred while spawning an application process".to_string();
        }
        if self.problem_description_html.is_none() {
            self.problem_description_html = Some(format!("<p>{}</p>", escape_html(&self.summary)));
        }
        if self.solution_description_html.is_none() {
            self.solution_description_html = Some(
                "<p class=\"sole-solution\">Please try troubleshooting the problem by \
                 studying the <strong>error message</strong> and the \
                 <strong>diagnostics</strong> reports.</p>"
                    .to_string(),
            );
        }
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn journey(&self) -> &Journey {
        &self.journey
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn advanced_problem_details(&self) -> Option<&str> {
        self.advanced_problem_details.as_deref()
    }

    pub fn problem_description_html(&self) -> Option<&str> {
        self.problem_description_html.as_deref()
    }

    pub fn solution_description_html(&self) -> Option<&str> {
        self.solution_description_html.as_deref()
    }

    pub fn stdout_and_err_data(&self) -> Option<&str> {
        self.stdout_and_err_data.as_deref()
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }
}

impl fmt::Display for SpawnException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary)
    }
}

impl std::error::Error for SpawnException {}

/// Minimal HTML escaping for embedding untrusted text in error pages.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
