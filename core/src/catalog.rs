use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::config::Asset;
use crate::serdable::GlobPattern;
use crate::testing::{tokenize_args, TestCase};

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Invalid catalog TOML ({0}): {1}")]
    Toml(String, #[source] toml::de::Error),

    #[error(transparent)]
    Read(#[from] fsutil::Error),

    #[error("Built-in catalog '{0}' is missing")]
    MissingBuiltin(&'static str),

    #[error("Duplicate suite name '{0}'")]
    DuplicateSuite(String),

    #[error("Duplicate case name '{0}'")]
    DuplicateCase(String),

    #[error("No {role} program for case '{case}' (set `{role}` on the case or its suite)")]
    MissingProgram { case: String, role: &'static str },
}

/// Args written either as one string (split on whitespace) or as a token list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum RawArgs {
    Line(String),
    Tokens(Vec<String>),
}

impl Default for RawArgs {
    fn default() -> Self {
        RawArgs::Tokens(Vec::new())
    }
}

impl From<RawArgs> for Vec<String> {
    fn from(args: RawArgs) -> Self {
        match args {
            RawArgs::Line(line) => tokenize_args(&line),
            RawArgs::Tokens(tokens) => tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCatalog {
    #[serde(default, rename = "suite")]
    suites: Vec<RawSuite>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSuite {
    name: String,
    server: Option<String>,
    client: Option<String>,
    #[serde(default, rename = "case")]
    cases: Vec<RawCase>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCase {
    name: Option<String>,
    server: Option<String>,
    client: Option<String>,
    #[serde(default)]
    server_args: RawArgs,
    #[serde(default)]
    client_args: RawArgs,
    #[serde(default)]
    expect_server: i32,
    #[serde(default)]
    expect_client: i32,
}

/// Cases of one test module; results of a suite share one log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suite {
    pub name: String,
    pub cases: Vec<TestCase>,
}

/// Immutable table of test cases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    suites: Vec<Suite>,
}

impl Catalog {
    pub const BUILTIN_FILENAME: &str = "cases.toml";

    pub fn new(suites: Vec<Suite>) -> Result<Self> {
        let mut suite_names = HashSet::new();
        let mut case_names = HashSet::new();
        for suite in &suites {
            if !suite_names.insert(suite.name.as_str()) {
                return Err(CatalogError::DuplicateSuite(suite.name.clone()));
            }
            for case in &suite.cases {
                if !case_names.insert(case.name.as_str()) {
                    return Err(CatalogError::DuplicateCase(case.name.clone()));
                }
            }
        }
        Ok(Self { suites })
    }

    pub fn builtin() -> Result<Self> {
        let toml = Asset::get_str(Self::BUILTIN_FILENAME)
            .ok_or(CatalogError::MissingBuiltin(Self::BUILTIN_FILENAME))?;
        Self::parse(&toml, "built-in")
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        Self::parse(s, "<string>")
    }

    pub fn from_toml_file(filepath: impl AsRef<Path>) -> Result<Self> {
        let filepath = filepath.as_ref();
        let toml = fsutil::read_to_string(filepath)?;
        Self::parse(&toml, &filepath.to_string_lossy())
    }

    fn parse(s: &str, origin: &str) -> Result<Self> {
        let raw: RawCatalog =
            toml::from_str(s).map_err(|e| CatalogError::Toml(origin.to_owned(), e))?;

        let mut suites = Vec::with_capacity(raw.suites.len());
        for raw_suite in raw.suites {
            let mut cases = Vec::with_capacity(raw_suite.cases.len());
            for (i, raw_case) in raw_suite.cases.into_iter().enumerate() {
                let name = raw_case
                    .name
                    .map(|n| n.trim().to_owned())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| format!("{}#{}", raw_suite.name, i + 1));
                let program = |own: Option<String>, fallback: &Option<String>, role| {
                    own.or_else(|| fallback.clone())
                        .filter(|p| !p.trim().is_empty())
                        .ok_or_else(|| CatalogError::MissingProgram {
                            case: name.clone(),
                            role,
                        })
                };
                let server = program(raw_case.server, &raw_suite.server, "server")?;
                let client = program(raw_case.client, &raw_suite.client, "client")?;

                cases.push(TestCase {
                    name: name.clone(),
                    suite: raw_suite.name.clone(),
                    server_program: server,
                    client_program: client,
                    server_args: raw_case.server_args.into(),
                    client_args: raw_case.client_args.into(),
                    expected_server_exit: raw_case.expect_server,
                    expected_client_exit: raw_case.expect_client,
                });
            }
            suites.push(Suite {
                name: raw_suite.name,
                cases,
            });
        }
        Self::new(suites)
    }

    pub fn suites(&self) -> &[Suite] {
        &self.suites
    }

    /// All cases in catalog order. Every call starts over from the first case.
    pub fn cases(&self) -> impl Iterator<Item = &TestCase> + Clone + '_ {
        self.suites.iter().flat_map(|s| s.cases.iter())
    }

    pub fn len(&self) -> usize {
        self.suites.iter().map(|s| s.cases.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, case_name: &str) -> Option<&TestCase> {
        self.cases().find(|c| c.name == case_name)
    }

    /// Keeps cases whose name, or whose suite name, matches `pattern`.
    /// Suites left without cases are dropped.
    pub fn filter(&self, pattern: &GlobPattern) -> Self {
        let suites = self
            .suites
            .iter()
            .filter_map(|suite| {
                let cases: Vec<_> = if pattern.matches(&suite.name) {
                    suite.cases.clone()
                } else {
                    suite
                        .cases
                        .iter()
                        .filter(|c| pattern.matches(&c.name))
                        .cloned()
                        .collect()
                };
                (!cases.is_empty()).then(|| Suite {
                    name: suite.name.clone(),
                    cases,
                })
            })
            .collect();
        Self { suites }
    }
}
