use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::readiness::{await_ready, Readiness, ReadyOutcome};
use super::result::{judge, ExitCode, Failure, FailureKind, ProcessOutput, RunResult, Verdict};
use super::runner::{LaunchError, ProcessHandle, ProcessRunner, WaitError};
use super::testcase::TestCase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// Upper bound for the server to become ready.
    #[serde(rename = "ready_ms", with = "crate::serdable::duration_ms")]
    pub ready: Duration,
    /// Upper bound for the client run.
    #[serde(rename = "client_ms", with = "crate::serdable::duration_ms")]
    pub client: Duration,
    /// Upper bound for the server to exit once the client is done.
    #[serde(rename = "server_ms", with = "crate::serdable::duration_ms")]
    pub server: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ready: Duration::from_secs(5),
            client: Duration::from_secs(10),
            server: Duration::from_secs(5),
        }
    }
}

/// Handles of the case currently running. Whatever is left here gets killed.
#[derive(Debug, Default)]
struct Pair {
    server: Option<ProcessHandle>,
    client: Option<ProcessHandle>,
}

impl Pair {
    async fn teardown(self) -> (Option<ProcessOutput>, Option<ProcessOutput>) {
        async fn reap(handle: Option<ProcessHandle>) -> Option<ProcessOutput> {
            let mut h = handle?;
            if let Err(e) = h.kill().await {
                log::warn!("Failed to kill '{}': {:#}", h.program(), e);
            }
            Some(h.finish().await)
        }
        // client first: server teardown never precedes client completion
        let client = reap(self.client).await;
        let server = reap(self.server).await;
        (server, client)
    }
}

fn launch_failure(role: &str, e: LaunchError) -> Failure {
    Failure::new(FailureKind::LaunchError, format!("{} not launched: {}", role, e))
}

fn internal(e: impl std::fmt::Display) -> Failure {
    Failure::new(FailureKind::Internal, e.to_string())
}

/// Runs one server/client pair: server first, client once the server is
/// ready, then judges both exit codes.
#[derive(Debug, Clone)]
pub struct PairingCoordinator {
    runner: ProcessRunner,
    readiness: Readiness,
    timeouts: Timeouts,
}

impl PairingCoordinator {
    pub fn new(runner: ProcessRunner) -> Self {
        Self {
            runner,
            readiness: Readiness::default(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Always yields exactly one result; failures are part of the result.
    pub async fn run(&self, case: &TestCase) -> RunResult {
        let started_at = Local::now();
        let clock = Instant::now();
        log::debug!("Running {}", case);

        let mut pair = Pair::default();
        let outcome = self.drive(case, &mut pair).await;
        let (server_output, client_output) = pair.teardown().await;

        let (verdict, failure) = match outcome {
            Ok(()) => (Verdict::Pass, None),
            Err(f) => {
                log::debug!("{}: {}", case.name, f);
                (f.kind.verdict(), Some(f))
            }
        };

        RunResult {
            case_name: case.name.clone(),
            suite: case.suite.clone(),
            server_exit: server_output.as_ref().and_then(|o| o.exit),
            client_exit: client_output.as_ref().and_then(|o| o.exit),
            expected_server_exit: case.expected_server_exit,
            expected_client_exit: case.expected_client_exit,
            verdict,
            failure,
            started_at,
            finished_at: Local::now(),
            duration: clock.elapsed(),
            server_output,
            client_output,
        }
    }

    async fn drive(&self, case: &TestCase, pair: &mut Pair) -> Result<(), Failure> {
        let probe = self.readiness.probe().map_err(internal)?;
        probe
            .prepare()
            .await
            .map_err(|e| Failure::new(FailureKind::LaunchError, format!("server not launched: {}", e)))?;

        let server = self
            .runner
            .spawn(&case.server_program, &case.server_args)
            .map_err(|e| launch_failure("server", e))?;
        let server = pair.server.insert(server);

        match await_ready(server, probe.as_ref(), self.timeouts.ready)
            .await
            .map_err(internal)?
        {
            ReadyOutcome::Ready(waited) => {
                log::debug!("Server ready after {}ms", waited.as_millis())
            }
            ReadyOutcome::Died(code) => return Err(died_early(code)),
            ReadyOutcome::NotReady => {
                return Err(Failure::new(FailureKind::Timeout, "server not ready"))
            }
        }
        if let Some(code) = server.try_exit().map_err(internal)? {
            return Err(died_early(code));
        }

        let client = self
            .runner
            .spawn(&case.client_program, &case.client_args)
            .map_err(|e| launch_failure("client", e))?;
        let client = pair.client.insert(client);

        let client_exit = match client.wait(self.timeouts.client).await {
            Ok(code) => code,
            Err(WaitError::Timeout(_, limit)) => {
                return Err(Failure::new(
                    FailureKind::Timeout,
                    format!("client timed out after {}ms", limit.as_millis()),
                ))
            }
            Err(e) => return Err(internal(e)),
        };

        let server_exit = match server.wait(self.timeouts.server).await {
            Ok(code) => code,
            Err(WaitError::Timeout(_, limit)) => {
                return Err(Failure::new(
                    FailureKind::Timeout,
                    format!(
                        "server did not exit within {}ms after the client (client exit {})",
                        limit.as_millis(),
                        client_exit
                    ),
                ))
            }
            Err(e) => return Err(internal(e)),
        };

        judge(case, Some(server_exit), Some(client_exit))
    }
}

fn died_early(code: ExitCode) -> Failure {
    Failure::new(
        FailureKind::EarlyExit,
        format!("server died early (exit code {})", code),
    )
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;

    const READY_LINE: &str = "ready";

    fn coordinator(timeouts: Timeouts) -> PairingCoordinator {
        PairingCoordinator::new(ProcessRunner::new())
            .readiness(Readiness::LogLine {
                pattern: READY_LINE.into(),
            })
            .timeouts(timeouts)
    }

    fn short_timeouts() -> Timeouts {
        Timeouts {
            ready: Duration::from_millis(300),
            client: Duration::from_millis(300),
            server: Duration::from_millis(300),
        }
    }

    fn sh_case(server: &str, client: &str) -> TestCase {
        TestCase::new("pairing", "case", "sh", "sh")
            .server_args(["-c", server])
            .client_args(["-c", client])
    }

    #[tokio::test]
    async fn both_zero_is_pass() {
        let case = sh_case("echo ready; sleep 0.3", "exit 0");
        let res = dbg!(coordinator(Timeouts::default()).run(&case).await);
        assert_eq!(res.verdict, Verdict::Pass);
        assert_eq!(res.failure, None);
        assert_eq!(res.server_exit, Some(ExitCode(0)));
        assert_eq!(res.client_exit, Some(ExitCode(0)));
        assert_eq!(res.server_output.unwrap().stdout, "ready\n");
    }

    #[tokio::test]
    async fn expected_nonzero_codes_can_pass() {
        let case = sh_case("echo ready; sleep 0.3; exit 2", "exit 1").expect(2, 1);
        let res = coordinator(Timeouts::default()).run(&case).await;
        assert_eq!(res.verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn client_mismatch_is_fail() {
        let case = sh_case("echo ready; sleep 0.3", "exit 1");
        let res = coordinator(Timeouts::default()).run(&case).await;
        assert_eq!(res.verdict, Verdict::Fail);
        let failure = res.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::ExitMismatch);
        assert!(failure.reason.contains("client exit 1 (expected 0)"), "{}", failure.reason);
    }

    #[tokio::test]
    async fn server_never_ready_is_timeout_and_client_not_started() {
        let case = sh_case("exec sleep 5", "exit 0");
        let res = coordinator(short_timeouts()).run(&case).await;
        assert_eq!(res.verdict, Verdict::Timeout);
        assert_eq!(res.reason(), Some("server not ready"));
        assert!(res.client_output.is_none());
        assert!(res.server_exit.unwrap().is_signaled());
    }

    #[tokio::test]
    async fn server_crash_before_client_is_early_exit() {
        let case = sh_case("exit 3", "exit 0");
        let res = coordinator(Timeouts::default()).run(&case).await;
        assert_eq!(res.verdict, Verdict::Fail);
        let failure = res.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::EarlyExit);
        assert_eq!(failure.reason, "server died early (exit code 3)");
        assert_eq!(res.client_exit, None);
        assert!(res.client_output.is_none());
    }

    #[tokio::test]
    async fn client_timeout_kills_both() {
        let case = sh_case("echo ready; exec sleep 5", "exec sleep 5");
        let res = coordinator(short_timeouts()).run(&case).await;
        assert_eq!(res.verdict, Verdict::Timeout);
        assert_eq!(res.reason(), Some("client timed out after 300ms"));
        assert_eq!(res.client_exit, Some(ExitCode(-9)));
        assert_eq!(res.server_exit, Some(ExitCode(-9)));
    }

    #[tokio::test]
    async fn lingering_server_is_killed() {
        let case = sh_case("echo ready; exec sleep 5", "exit 0");
        let res = coordinator(short_timeouts()).run(&case).await;
        assert_eq!(res.verdict, Verdict::Timeout);
        assert!(res.reason().unwrap().starts_with("server did not exit within 300ms"));
        assert_eq!(res.client_exit, Some(ExitCode(0)));
        assert_eq!(res.server_exit, Some(ExitCode(-9)));
    }

    #[tokio::test]
    async fn missing_server_binary_is_error() {
        let case = TestCase::new("pairing", "case", "twt-no-such-server", "sh");
        let res = coordinator(Timeouts::default()).run(&case).await;
        assert_eq!(res.verdict, Verdict::Error);
        assert_eq!(res.failure.as_ref().unwrap().kind, FailureKind::LaunchError);
        assert!(res.server_output.is_none());
    }

    #[tokio::test]
    async fn missing_client_binary_is_error_and_server_killed() {
        let case = TestCase::new("pairing", "case", "sh", "twt-no-such-client")
            .server_args(["-c", "echo ready; exec sleep 5"]);
        let res = coordinator(Timeouts::default()).run(&case).await;
        assert_eq!(res.verdict, Verdict::Error);
        assert!(res.reason().unwrap().starts_with("client not launched"));
        assert_eq!(res.server_exit, Some(ExitCode(-9)));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn no_process_survives_a_timeout() {
        let case = sh_case("echo ready; echo $$; exec sleep 5", "echo $$; exec sleep 5");
        let res = coordinator(short_timeouts()).run(&case).await;
        assert_eq!(res.verdict, Verdict::Timeout);

        let pid_of = |out: &Option<ProcessOutput>| -> String {
            let stdout = &out.as_ref().unwrap().stdout;
            stdout.lines().last().unwrap().trim().to_owned()
        };
        for pid in [pid_of(&res.server_output), pid_of(&res.client_output)] {
            assert!(
                !std::path::Path::new("/proc").join(&pid).exists(),
                "pid {} still alive",
                pid
            );
        }
    }

    /// A fake `test_openssl` that only fails the client side on `-V 13`.
    #[cfg(unix)]
    fn fake_openssl_bin_dir() -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("twt-pairing-bin-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("test_openssl");
        std::fs::write(
            &script,
            r#"#!/bin/sh
case " $* " in
  *" -S "*) echo ready; sleep 0.3; exit 0 ;;
  *" -V 13 "*) exit 1 ;;
  *) exit 0 ;;
esac
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        dir
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn release_buf_cases_through_fake_binary() {
        use crate::testing::tokenize_args;

        let coord = PairingCoordinator::new(ProcessRunner::new().bin_dir(fake_openssl_bin_dir()))
            .readiness(Readiness::LogLine {
                pattern: READY_LINE.into(),
            });

        let plain = TestCase::new("release_buf", "a", "test_openssl", "test_openssl")
            .server_args(tokenize_args(" -S -b 1 "))
            .client_args(tokenize_args(" "));
        assert_eq!(coord.run(&plain).await.verdict, Verdict::Pass);

        let tls13 = TestCase::new("release_buf", "b", "test_openssl", "test_openssl")
            .server_args(tokenize_args(" -S -b 1 -V 13"))
            .client_args(tokenize_args(" -b 1 -V 13 "));
        let res = coord.run(&tls13).await;
        assert_eq!(res.verdict, Verdict::Fail);
        assert_eq!(res.failure.unwrap().kind, FailureKind::ExitMismatch);
        assert_eq!(res.client_exit, Some(ExitCode(1)));
    }

    fn python3_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    /// A server that really listens on `port` and serves one connection.
    fn listening_case(port: u16) -> TestCase {
        let server = format!(
            "import socket\n\
             s = socket.socket()\n\
             s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)\n\
             s.bind(('127.0.0.1', {port}))\n\
             s.listen(1)\n\
             s.settimeout(5)\n\
             c, _ = s.accept()\n\
             c.close()\n"
        );
        let client = format!("import socket; socket.create_connection(('127.0.0.1', {port}), 5).close()");
        TestCase::new("pairing", "listening", "python3", "python3")
            .server_args(["-c", server.as_str()])
            .client_args(["-c", client.as_str()])
    }

    fn port_bind_coordinator(port: u16) -> PairingCoordinator {
        PairingCoordinator::new(ProcessRunner::new())
            .readiness(Readiness::PortBind {
                addr: std::net::SocketAddr::from(([127, 0, 0, 1], port)),
            })
            .timeouts(Timeouts {
                ready: Duration::from_secs(5),
                client: Duration::from_secs(5),
                server: Duration::from_secs(5),
            })
    }

    #[tokio::test]
    async fn port_bind_readiness_with_a_listening_server() {
        if !python3_available() {
            eprintln!("python3 not found; skipping");
            return;
        }
        let port = free_port();
        let res = dbg!(port_bind_coordinator(port).run(&listening_case(port)).await);
        assert_eq!(res.verdict, Verdict::Pass, "{:?}", res.failure);
        assert_eq!(res.server_exit, Some(ExitCode(0)));
        assert_eq!(res.client_exit, Some(ExitCode(0)));
    }

    #[tokio::test]
    async fn port_taken_before_launch_is_launch_error() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let case = sh_case("echo ready; sleep 0.3", "exit 0");
        let res = port_bind_coordinator(port).run(&case).await;
        assert_eq!(res.verdict, Verdict::Error);
        let failure = res.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::LaunchError);
        assert!(failure.reason.starts_with("server not launched"), "{}", failure.reason);
        assert!(res.server_output.is_none());
        assert!(res.client_output.is_none());
    }

    #[test]
    fn unknown_timeout_keys_are_rejected() {
        let res = toml::from_str::<Timeouts>("client_timeout = 300\n");
        assert!(dbg!(res).is_err());
        let ok: Timeouts = toml::from_str("client_ms = 300\n").unwrap();
        assert_eq!(ok.client, Duration::from_millis(300));
    }

    #[tokio::test]
    async fn rerun_gives_same_verdict() {
        let coord = coordinator(Timeouts::default());
        let case = sh_case("echo ready; sleep 0.3", "exit 0");
        let first = coord.run(&case).await;
        let second = coord.run(&case).await;
        assert_eq!(first.verdict, second.verdict);
        assert_eq!(first.server_exit, second.server_exit);
        assert_eq!(first.client_exit, second.client_exit);
    }
}
