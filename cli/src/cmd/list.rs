use std::path::PathBuf;

use colored::Colorize;
use twt_core::{serdable::GlobPattern, Catalog};

use super::{GlobalArgs, SubcmdResult};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Case catalog TOML (default: `harness.catalog`, else the built-in one)
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Only cases whose name or suite name matches this glob
    #[arg(short = 'f', long)]
    pub filter: Option<GlobPattern>,
}

pub fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let cfg = global_args.load_config()?;
    let mut catalog = match &args.catalog {
        Some(path) => Catalog::from_toml_file(path)?,
        None => cfg.harness.load_catalog()?,
    };
    if let Some(pat) = &args.filter {
        catalog = catalog.filter(pat);
    }

    for suite in catalog.suites() {
        println!("{}", suite.name.bold());
        for case in &suite.cases {
            println!(
                "  {:<24} {} | {}  {}",
                case.name.cyan(),
                case.server_args.join(" "),
                case.client_args.join(" "),
                format!(
                    "(expect {}/{})",
                    case.expected_server_exit, case.expected_client_exit
                )
                .dimmed(),
            );
        }
    }
    Ok(0)
}
