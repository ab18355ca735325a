use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use fsutil::AppendLog;
use serde::Serialize;

use crate::testing::{RunResult, Verdict};

pub type Result<T> = std::result::Result<T, ReportError>;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error(transparent)]
    Io(#[from] fsutil::Error),

    #[error("Cannot serialize log record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub module: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub error: usize,
}

impl SessionSummary {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, verdict: Verdict) {
        self.total += 1;
        match verdict {
            Verdict::Pass => self.passed += 1,
            Verdict::Fail => self.failed += 1,
            Verdict::Timeout => self.timeout += 1,
            Verdict::Error => self.error += 1,
        }
    }

    pub fn count(&self, verdict: Verdict) -> usize {
        match verdict {
            Verdict::Pass => self.passed,
            Verdict::Fail => self.failed,
            Verdict::Timeout => self.timeout,
            Verdict::Error => self.error,
        }
    }

    /// Cases that did not pass.
    pub fn failures(&self) -> usize {
        self.total - self.passed
    }

    pub fn all_passed(&self) -> bool {
        self.failures() == 0
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum LogRecord<'a> {
    SessionStart {
        module: &'a str,
        at: DateTime<Local>,
        harness: &'a str,
    },
    Case(&'a RunResult),
    SessionEnd {
        at: DateTime<Local>,
        #[serde(flatten)]
        summary: &'a SessionSummary,
    },
}

/// One reporting session for one test module.
///
/// Results go to `<log_dir>/<module>.log` as JSON lines: a `session-start`
/// record, one `case` record per appended result in append order, and a
/// `session-end` record with the counts written by [`LogSession::close`].
#[derive(Debug)]
pub struct LogSession {
    log: AppendLog,
    summary: SessionSummary,
}

/// Keeps a module name usable as a file name.
/// ```
/// use twt_core::report::log_file_stem;
///
/// assert_eq!(log_file_stem("openssl_release_buf"), "openssl_release_buf");
/// assert_eq!(log_file_stem("tls/1.3 basic"), "tls_1.3_basic");
/// ```
pub fn log_file_stem(module: &str) -> String {
    module
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.' => c,
            _ => '_',
        })
        .collect()
}

impl LogSession {
    pub fn log_path_for(log_dir: impl AsRef<Path>, module: &str) -> PathBuf {
        log_dir
            .as_ref()
            .join(format!("{}.log", self::log_file_stem(module)))
    }

    pub fn open(log_dir: impl AsRef<Path>, module: &str) -> Result<Self> {
        let log = AppendLog::open(Self::log_path_for(log_dir, module))?;
        let mut session = Self {
            log,
            summary: SessionSummary::new(module),
        };
        session.write(&LogRecord::SessionStart {
            module,
            at: Local::now(),
            harness: concat!("twt-core ", env!("CARGO_PKG_VERSION")),
        })?;
        Ok(session)
    }

    fn write(&mut self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.log.append_line(&line)?;
        Ok(())
    }

    pub fn log_path(&self) -> &Path {
        self.log.filepath()
    }

    pub fn append(&mut self, result: &RunResult) -> Result<()> {
        self.write(&LogRecord::Case(result))?;
        self.summary.record(result.verdict);
        Ok(())
    }

    pub fn close(mut self) -> Result<SessionSummary> {
        let summary = self.summary.clone();
        self.write(&LogRecord::SessionEnd {
            at: Local::now(),
            summary: &summary,
        })?;
        self.log.sync()?;
        Ok(summary)
    }
}
