pub mod error {
    #[allow(unused_imports)]
    pub(crate) use anyhow::{anyhow, bail, ensure, Context as _};
    pub use anyhow::{Error, Result};
}
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use colored::Colorize;
use error::*;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::task::JoinSet;

use crate::catalog::{Catalog, Suite};
use crate::config::{Config, HarnessConfig};
use crate::report::{LogSession, SessionSummary};
use crate::style;
use crate::testing::{Readiness, RunResult, TestCase};

pub fn init_config_file(dir: impl AsRef<Path>) -> Result<PathBuf> {
    let path = dir.as_ref().join(Config::FILENAME);
    fsutil::write_new_with_mkdir(&path, Config::example_toml())
        .context("Failed to create config file")?;
    Ok(path)
}

/// Everything one `run_catalog` call produced.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub results: Vec<RunResult>,
    pub sessions: Vec<SessionSummary>,
    pub log_files: Vec<PathBuf>,
}

impl RunReport {
    pub fn failures(&self) -> usize {
        self.sessions.iter().map(|s| s.failures()).sum()
    }

    pub fn all_passed(&self) -> bool {
        self.failures() == 0
    }

    /// Process exit status of the harness: the failure count, clamped to `1..=255`.
    pub fn exit_code(&self) -> i32 {
        match self.failures() {
            0 => 0,
            n => n.min(255) as i32,
        }
    }
}

/// Runs every suite of `catalog`, one log session per suite.
///
/// With `harness.jobs > 1` up to that many cases of a suite run at once.
/// Results are still appended by this task alone, in completion order.
pub async fn run_catalog(
    catalog: &Catalog,
    cfg: &HarnessConfig,
    show_progress: bool,
) -> Result<RunReport> {
    ensure!(!catalog.is_empty(), "No test cases to run");

    let jobs = cfg.jobs.max(1);
    if jobs > 1 && matches!(cfg.readiness, Readiness::PortBind { .. } | Readiness::Connect { .. })
    {
        log::warn!(
            "Running {} cases at once with a fixed readiness address; cases sharing a port will collide",
            jobs
        );
    }

    let coordinator = Arc::new(cfg.coordinator());
    let run_case = move |case: TestCase| {
        let coordinator = coordinator.clone();
        async move { coordinator.run(&case).await }
    };
    let progress = if show_progress {
        MultiProgress::new()
    } else {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    };

    let mut report = RunReport::default();
    for suite in catalog.suites() {
        let mut session = LogSession::open(&cfg.log_dir, &suite.name)
            .with_context(|| format!("Failed to open log for '{}'", suite.name))?;
        log::info!(
            "Suite {} ({} cases) -> {}",
            suite.name,
            suite.cases.len(),
            session.log_path().to_string_lossy()
        );

        let results =
            self::run_suite(suite, &run_case, jobs, &progress, &mut session).await?;

        report.log_files.push(session.log_path().to_owned());
        let summary = session
            .close()
            .with_context(|| format!("Failed to close log for '{}'", suite.name))?;
        report.sessions.push(summary);
        report.results.extend(results);
    }

    if show_progress {
        println!();
        report
            .results
            .iter()
            .filter(|r| !r.is_pass())
            .for_each(style::print_result_detail);
        style::print_run_summary(&report.sessions);
    }

    Ok(report)
}

async fn run_suite<F, Fut>(
    suite: &Suite,
    run_case: &F,
    jobs: usize,
    progress: &MultiProgress,
    session: &mut LogSession,
) -> Result<Vec<RunResult>>
where
    F: Fn(TestCase) -> Fut,
    Fut: Future<Output = RunResult> + Send + 'static,
{
    let spinner = ProgressStyle::default_spinner()
        .template("{spinner} {msg}")
        .context("Bad progress template")?;

    let mut queue = suite.cases.iter().cloned();
    let mut running = JoinSet::new();
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();
    let mut results = Vec::with_capacity(suite.cases.len());

    loop {
        while running.len() < jobs {
            let Some(case) = queue.next() else { break };
            let bar = progress
                .add(ProgressBar::new_spinner())
                .with_style(spinner.clone())
                .with_message(format!("{} ...", case.name));
            bar.enable_steady_tick(Duration::from_millis(80));
            bars.insert(case.name.clone(), bar);
            let task = run_case(case.clone());
            running.spawn(self::run_isolated(case, task));
        }

        let Some(joined) = running.join_next().await else { break };
        let res = joined.context("Case task was cancelled")?;

        if let Some(bar) = bars.remove(&res.case_name) {
            bar.finish_with_message(format!(
                "{} ... {} [{}ms]",
                res.case_name.cyan(),
                style::verdict_badge(res.verdict),
                res.duration.as_millis(),
            ));
        }
        log::debug!("{}: {}", res.case_name, res.verdict);

        session
            .append(&res)
            .with_context(|| format!("Failed to log result of '{}'", res.case_name))?;
        results.push(res);
    }

    Ok(results)
}

/// Runs one case on its own task so a panic turns into an error result
/// for that case instead of aborting the suite.
async fn run_isolated<Fut>(case: TestCase, task: Fut) -> RunResult
where
    Fut: Future<Output = RunResult> + Send + 'static,
{
    let started_at = Local::now();
    let clock = tokio::time::Instant::now();

    // Dropping the set aborts the case, so cancelling this task reaches it too.
    let mut isolated = JoinSet::new();
    isolated.spawn(task);

    match isolated.join_next().await {
        Some(Ok(res)) => res,
        None => RunResult::internal_error(&case, "case task vanished", started_at, clock.elapsed()),
        Some(Err(e)) => {
            log::error!("Case {} aborted: {}", case.name, e);
            RunResult::internal_error(
                &case,
                format!("harness task failed: {}", e),
                started_at,
                clock.elapsed(),
            )
        }
    }
}
