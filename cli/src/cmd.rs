pub mod init;
pub mod list;
pub mod run;

use std::path::PathBuf;

use anyhow::Context as _;
use twt_core::Config;

use crate::util;

#[derive(Debug, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub struct GlobalArgs {
    #[command(subcommand)]
    pub subcmd: Subcommand,

    /// Config file (default: nearest `twt.toml` in the current or an ancestor dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    #[command(alias("r"))]
    Run(run::Args),

    #[command(alias("ls"))]
    List(list::Args),

    Init(init::Args),
}

/// Process exit status on success.
pub type SubcmdResult = anyhow::Result<i32>;

impl GlobalArgs {
    pub async fn exec_subcmd(&self) -> SubcmdResult {
        use Subcommand::*;
        match &self.subcmd {
            Run(args) => run::exec(args, self).await,
            List(args) => list::exec(args, self),
            Init(args) => init::exec(args, self),
        }
    }

    pub fn load_config(&self) -> anyhow::Result<Config> {
        match &self.config {
            Some(path) => Config::from_toml_file(path.clone())
                .with_context(|| format!("Failed to load {}", path.to_string_lossy())),
            None => Config::from_file_finding_in_ancestors(util::current_dir()),
        }
    }
}
