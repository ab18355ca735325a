use std::fmt;

use serde::Serialize;

/// One server/client pairing to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestCase {
    pub name: String,
    pub suite: String,
    pub server_program: String,
    pub client_program: String,
    pub server_args: Vec<String>,
    pub client_args: Vec<String>,
    pub expected_server_exit: i32,
    pub expected_client_exit: i32,
}

/// Splits a command-line argument string on whitespace.
/// ```
/// use twt_core::testing::tokenize_args;
///
/// assert_eq!(tokenize_args(" -S -b 1 "), vec!["-S", "-b", "1"]);
/// assert!(tokenize_args(" ").is_empty());
/// ```
pub fn tokenize_args(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_owned).collect()
}

impl TestCase {
    pub fn new(
        suite: impl Into<String>,
        name: impl Into<String>,
        server_program: impl Into<String>,
        client_program: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            suite: suite.into(),
            server_program: server_program.into(),
            client_program: client_program.into(),
            server_args: Vec::new(),
            client_args: Vec::new(),
            expected_server_exit: 0,
            expected_client_exit: 0,
        }
    }

    pub fn server_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.server_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn client_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn expect(mut self, server_exit: i32, client_exit: i32) -> Self {
        self.expected_server_exit = server_exit;
        self.expected_client_exit = client_exit;
        self
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{} {} | {} {}] expect=({}, {})",
            self.name,
            self.server_program,
            self.server_args.join(" "),
            self.client_program,
            self.client_args.join(" "),
            self.expected_server_exit,
            self.expected_client_exit,
        )
    }
}
