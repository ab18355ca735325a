use std::path::{Path, PathBuf};
use std::result::Result as StdResult;

use anyhow::{ensure, Context as _};
use rust_embed::RustEmbed;
use serde::Deserialize;

use crate::catalog::Catalog;
use crate::serdable::GlobPattern;
use crate::testing::{PairingCoordinator, ProcessRunner, Readiness, Timeouts};

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(skip)]
    pub source_config_file: Option<PathBuf>,
    #[serde(default)]
    pub harness: HarnessConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub bin_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub catalog: Option<PathBuf>,
    pub jobs: usize,
    pub capture_max_bytes: usize,
    pub include: Option<GlobPattern>,
    pub timeout: Timeouts,
    pub readiness: Readiness,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            bin_dir: None,
            work_dir: None,
            log_dir: PathBuf::from("./log"),
            catalog: None,
            jobs: 1,
            capture_max_bytes: ProcessRunner::DEFAULT_CAPTURE_MAX_BYTES,
            include: None,
            timeout: Timeouts::default(),
            readiness: Readiness::default(),
        }
    }
}

#[derive(RustEmbed)]
#[folder = "assets/"]
pub(crate) struct Asset;

impl Asset {
    pub(crate) fn get_str(name: &str) -> Option<String> {
        let file = Self::get(name)?;
        std::str::from_utf8(file.data.as_ref()).ok().map(str::to_owned)
    }
}

impl Config {
    pub const FILENAME: &str = "twt.toml";

    pub fn example_toml() -> String {
        Asset::get_str(Self::FILENAME).unwrap_or_default()
    }

    pub fn from_toml(s: &str) -> StdResult<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_toml_file(filepath: PathBuf) -> anyhow::Result<Self> {
        let toml = fsutil::read_to_string(&filepath).context("Cannot read a file")?;
        let mut cfg = Self::from_toml(&toml)
            .with_context(|| format!("Invalid config TOML: {:?}", filepath))?;
        if let Some(dir) = filepath.parent() {
            cfg.harness.rebase(dir);
        }
        cfg.source_config_file = Some(filepath);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Find config file ancestor dirs, including current dir.
    pub fn find_file_in_ancestors(cur_dir: impl AsRef<Path>) -> Option<PathBuf> {
        cur_dir
            .as_ref()
            .ancestors()
            .map(|dir| dir.join(Self::FILENAME))
            .find(|path| path.is_file())
    }

    /// Loads the nearest `twt.toml`, or the defaults when there is none.
    pub fn from_file_finding_in_ancestors(cur_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        match Self::find_file_in_ancestors(cur_dir) {
            Some(path) => {
                log::debug!("Using config {}", path.to_string_lossy());
                Self::from_toml_file(path)
            }
            None => {
                log::debug!("No '{}' found; using defaults", Self::FILENAME);
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let h = &self.harness;
        ensure!(h.jobs >= 1, "harness.jobs must be at least 1");
        ensure!(
            h.capture_max_bytes > 0,
            "harness.capture_max_bytes must be positive"
        );
        h.readiness
            .probe()
            .context("Invalid harness.readiness")?;
        Ok(())
    }
}

impl HarnessConfig {
    /// Makes relative paths relative to `dir` instead of the cwd.
    pub fn rebase(&mut self, dir: impl AsRef<Path>) {
        let dir = dir.as_ref();
        let join = |p: &Path| {
            if p.is_absolute() {
                p.to_owned()
            } else {
                fsutil::normalize_path(dir.join(p))
            }
        };
        self.bin_dir = self.bin_dir.as_deref().map(join);
        self.work_dir = self.work_dir.as_deref().map(join);
        self.catalog = self.catalog.as_deref().map(join);
        self.log_dir = join(&self.log_dir);
        if let Readiness::File { path } = &mut self.readiness {
            *path = join(path.as_path());
        }
    }

    pub fn process_runner(&self) -> ProcessRunner {
        let mut runner = ProcessRunner::new().capture_max_bytes(self.capture_max_bytes);
        if let Some(dir) = &self.bin_dir {
            runner = runner.bin_dir(dir);
        }
        if let Some(dir) = &self.work_dir {
            runner = runner.work_dir(dir);
        }
        runner
    }

    pub fn coordinator(&self) -> PairingCoordinator {
        PairingCoordinator::new(self.process_runner())
            .readiness(self.readiness.clone())
            .timeouts(self.timeout)
    }

    /// The configured catalog (or the built-in one), narrowed by `include`.
    pub fn load_catalog(&self) -> anyhow::Result<Catalog> {
        let catalog = match &self.catalog {
            Some(path) => Catalog::from_toml_file(path)?,
            None => Catalog::builtin()?,
        };
        Ok(match &self.include {
            Some(pat) => catalog.filter(pat),
            None => catalog,
        })
    }
}
