use std::path::PathBuf;

use colored::Colorize;
use twt_core::{action, serdable::GlobPattern, Catalog};

use crate::util;

use super::{GlobalArgs, SubcmdResult};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Case catalog TOML (default: `harness.catalog`, else the built-in one)
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Only cases whose name or suite name matches this glob
    #[arg(short = 'f', long)]
    pub filter: Option<GlobPattern>,

    /// Number of cases run at once
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Dir containing the test programs
    #[arg(long)]
    pub bin_dir: Option<PathBuf>,

    /// Do not draw progress or failure details
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let mut cfg = global_args.load_config()?.harness;
    if let Some(jobs) = args.jobs {
        anyhow::ensure!(jobs >= 1, "--jobs must be at least 1");
        cfg.jobs = jobs;
    }
    if let Some(dir) = &args.bin_dir {
        cfg.bin_dir = Some(dir.clone());
    }

    let mut catalog = match &args.catalog {
        Some(path) => Catalog::from_toml_file(path)?,
        None => cfg.load_catalog()?,
    };
    if let Some(pat) = &args.filter {
        catalog = catalog.filter(pat);
    }

    let report = tokio::select! {
        report = action::run_catalog(&catalog, &cfg, !args.quiet) => report?,
        _ = tokio::signal::ctrl_c() => anyhow::bail!("Interrupted; running cases were killed"),
    };

    for path in &report.log_files {
        log::info!(
            "Log: {}",
            util::replace_homedir_to_tilde(path).to_string_lossy()
        );
    }
    if args.quiet {
        let line = format!(
            "{} cases, {} failed",
            report.results.len(),
            report.failures()
        );
        if report.all_passed() {
            println!("{}", line.green());
        } else {
            println!("{}", line.bright_red());
        }
    }
    Ok(report.exit_code())
}
