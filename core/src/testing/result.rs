use std::{fmt, process::ExitStatus, time::Duration};

use chrono::{DateTime, Local};
use serde::Serialize;

use super::testcase::TestCase;

/// Exit code of a finished process.
///
/// Normal exits keep the program's own code (0..=255). A process terminated by
/// signal `N` gets `-N`, so it can never be mistaken for an expected code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const UNKNOWN: ExitCode = ExitCode(-1);

    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitCode(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return ExitCode(-sig);
            }
        }
        Self::UNKNOWN
    }

    pub fn is_signaled(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_signaled() && *self != Self::UNKNOWN {
            write!(f, "{} (signal {})", self.0, -self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Captured stdout/stderr of one process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessOutput {
    pub exit: Option<ExitCode>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    LaunchError,
    Timeout,
    ExitMismatch,
    EarlyExit,
    Internal,
}

impl FailureKind {
    pub fn verdict(self) -> Verdict {
        use FailureKind::*;
        match self {
            LaunchError | Internal => Verdict::Error,
            Timeout => Verdict::Timeout,
            ExitMismatch | EarlyExit => Verdict::Fail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
}

impl Failure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// Outcome of one [`TestCase`] execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub case_name: String,
    pub suite: String,
    pub server_exit: Option<ExitCode>,
    pub client_exit: Option<ExitCode>,
    pub expected_server_exit: i32,
    pub expected_client_exit: i32,
    pub verdict: Verdict,
    pub failure: Option<Failure>,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    #[serde(rename = "duration_ms", with = "crate::serdable::duration_ms")]
    pub duration: Duration,
    pub server_output: Option<ProcessOutput>,
    pub client_output: Option<ProcessOutput>,
}

/// Observed codes compared against the expectation.
/// `None` means the process never ran or never exited on its own.
pub fn judge(
    case: &TestCase,
    server_exit: Option<ExitCode>,
    client_exit: Option<ExitCode>,
) -> Result<(), Failure> {
    let server_ok = server_exit == Some(ExitCode(case.expected_server_exit));
    let client_ok = client_exit == Some(ExitCode(case.expected_client_exit));
    if server_ok && client_ok {
        return Ok(());
    }

    fn show(code: Option<ExitCode>) -> String {
        code.map_or_else(|| "none".to_owned(), |c| c.to_string())
    }
    Err(Failure::new(
        FailureKind::ExitMismatch,
        format!(
            "server exit {} (expected {}), client exit {} (expected {})",
            show(server_exit),
            case.expected_server_exit,
            show(client_exit),
            case.expected_client_exit,
        ),
    ))
}

impl RunResult {
    /// Result for a case whose run was cut short by the harness itself.
    pub fn internal_error(
        case: &TestCase,
        reason: impl Into<String>,
        started_at: DateTime<Local>,
        duration: Duration,
    ) -> Self {
        let failure = Failure::new(FailureKind::Internal, reason);
        Self {
            case_name: case.name.clone(),
            suite: case.suite.clone(),
            server_exit: None,
            client_exit: None,
            expected_server_exit: case.expected_server_exit,
            expected_client_exit: case.expected_client_exit,
            verdict: failure.kind.verdict(),
            failure: Some(failure),
            started_at,
            finished_at: Local::now(),
            duration,
            server_output: None,
            client_output: None,
        }
    }

    pub fn is_pass(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    pub fn reason(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.reason.as_str())
    }
}
