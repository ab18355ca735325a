use std::{io, net::SocketAddr, path::PathBuf, time::Duration};

use async_trait::async_trait;
use lazy_regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::Instant;

use super::result::ExitCode;
use super::runner::ProcessHandle;

#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("Readiness address {0} is already in use before the server started")]
    AddrInUse(SocketAddr),

    #[error("Invalid readiness pattern '{0}': {1}")]
    InvalidPattern(String, String),

    #[error("Cannot remove stale readiness marker: {0}")]
    StaleMarker(#[source] fsutil::Error),

    #[error("Readiness probe failed: {0}")]
    Io(#[from] io::Error),
}

/// How the harness learns that a server accepts connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Readiness {
    /// Binding `addr` fails because the server holds it.
    /// Leaves the server's accept queue untouched.
    PortBind { addr: SocketAddr },
    /// A TCP connect to `addr` succeeds. Uses up one accept on the server.
    Connect { addr: SocketAddr },
    /// `pattern` matches the server's captured output.
    LogLine { pattern: String },
    /// The server created `path`.
    File { path: PathBuf },
    /// Fixed delay after spawning.
    Settle {
        #[serde(rename = "delay_ms", with = "crate::serdable::duration_ms")]
        delay: Duration,
    },
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::PortBind {
            addr: SocketAddr::from(([127, 0, 0, 1], 7788)),
        }
    }
}

impl Readiness {
    pub fn probe(&self) -> Result<Box<dyn ReadinessProbe>, ReadinessError> {
        use Readiness::*;
        Ok(match self {
            PortBind { addr } => Box::new(PortBindProbe { addr: *addr }),
            Connect { addr } => Box::new(ConnectProbe { addr: *addr }),
            LogLine { pattern } => Box::new(LogLineProbe {
                regex: RegexBuilder::new(pattern)
                    .multi_line(true)
                    .build()
                    .map_err(|e| ReadinessError::InvalidPattern(pattern.clone(), e.to_string()))?,
            }),
            File { path } => Box::new(FileProbe { path: path.clone() }),
            Settle { delay } => Box::new(SettleProbe { delay: *delay }),
        })
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync + std::fmt::Debug {
    /// Runs before the server is launched.
    async fn prepare(&self) -> Result<(), ReadinessError> {
        Ok(())
    }

    async fn is_ready(&self, server: &ProcessHandle) -> Result<bool, ReadinessError>;
}

#[derive(Debug)]
pub struct PortBindProbe {
    addr: SocketAddr,
}

impl PortBindProbe {
    /// Binds with SO_REUSEADDR and never listens. Such a socket cannot be
    /// bound next to a listener, but it does not stop the server's own
    /// bind + listen from succeeding while we hold it.
    fn is_bound(&self) -> io::Result<bool> {
        let socket = if self.addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        match socket.bind(self.addr) {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => Ok(true),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ReadinessProbe for PortBindProbe {
    async fn prepare(&self) -> Result<(), ReadinessError> {
        if self.is_bound()? {
            return Err(ReadinessError::AddrInUse(self.addr));
        }
        Ok(())
    }

    async fn is_ready(&self, _server: &ProcessHandle) -> Result<bool, ReadinessError> {
        Ok(self.is_bound()?)
    }
}

#[derive(Debug)]
pub struct ConnectProbe {
    addr: SocketAddr,
}

#[async_trait]
impl ReadinessProbe for ConnectProbe {
    async fn is_ready(&self, _server: &ProcessHandle) -> Result<bool, ReadinessError> {
        Ok(TcpStream::connect(self.addr).await.is_ok())
    }
}

/// Matches `^`/`$` at line boundaries of the server's captured output.
#[derive(Debug)]
pub struct LogLineProbe {
    regex: Regex,
}

#[async_trait]
impl ReadinessProbe for LogLineProbe {
    async fn is_ready(&self, server: &ProcessHandle) -> Result<bool, ReadinessError> {
        Ok(self.regex.is_match(&server.captured_text().await))
    }
}

#[derive(Debug)]
pub struct FileProbe {
    path: PathBuf,
}

#[async_trait]
impl ReadinessProbe for FileProbe {
    async fn prepare(&self) -> Result<(), ReadinessError> {
        fsutil::remove_file_if_exists(&self.path).map_err(ReadinessError::StaleMarker)
    }

    async fn is_ready(&self, _server: &ProcessHandle) -> Result<bool, ReadinessError> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }
}

#[derive(Debug)]
pub struct SettleProbe {
    delay: Duration,
}

#[async_trait]
impl ReadinessProbe for SettleProbe {
    async fn is_ready(&self, server: &ProcessHandle) -> Result<bool, ReadinessError> {
        Ok(server.elapsed() >= self.delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    Ready(Duration),
    Died(ExitCode),
    NotReady,
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Polls `probe` with exponential backoff until it reports ready, the server
/// exits, or `max_wait` elapses.
pub async fn await_ready(
    server: &mut ProcessHandle,
    probe: &dyn ReadinessProbe,
    max_wait: Duration,
) -> Result<ReadyOutcome, ReadinessError> {
    let start = Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if let Some(code) = server.try_exit()? {
            return Ok(ReadyOutcome::Died(code));
        }
        if probe.is_ready(server).await? {
            return Ok(ReadyOutcome::Ready(start.elapsed()));
        }

        let elapsed = start.elapsed();
        if elapsed >= max_wait {
            return Ok(ReadyOutcome::NotReady);
        }
        tokio::time::sleep(backoff.min(max_wait - elapsed)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::runner::ProcessRunner;

    fn spawn_sh(script: &str) -> ProcessHandle {
        ProcessRunner::new()
            .spawn("sh", &["-c".to_owned(), script.to_owned()])
            .unwrap()
    }

    async fn wait_for(readiness: Readiness, script: &str, max_wait_ms: u64) -> ReadyOutcome {
        let probe = readiness.probe().unwrap();
        probe.prepare().await.unwrap();
        let mut server = spawn_sh(script);
        let res = await_ready(&mut server, probe.as_ref(), Duration::from_millis(max_wait_ms))
            .await
            .unwrap();
        server.kill().await.unwrap();
        res
    }

    #[tokio::test]
    async fn log_line_marker_is_detected() {
        let res = wait_for(
            Readiness::LogLine {
                pattern: "^listening on \\d+".into(),
            },
            "sleep 0.05; echo 'listening on 7788'; exec sleep 5",
            2000,
        )
        .await;
        assert!(matches!(dbg!(res), ReadyOutcome::Ready(_)));
    }

    #[tokio::test]
    async fn server_without_marker_is_not_ready() {
        let res = wait_for(
            Readiness::LogLine {
                pattern: "ready".into(),
            },
            "exec sleep 5",
            150,
        )
        .await;
        assert_eq!(res, ReadyOutcome::NotReady);
    }

    #[tokio::test]
    async fn early_death_is_reported_with_exit_code() {
        let res = wait_for(
            Readiness::Settle {
                delay: Duration::from_millis(500),
            },
            "exit 3",
            2000,
        )
        .await;
        assert_eq!(res, ReadyOutcome::Died(ExitCode(3)));
    }

    #[tokio::test]
    async fn settle_waits_for_the_delay() {
        let res = wait_for(
            Readiness::Settle {
                delay: Duration::from_millis(100),
            },
            "exec sleep 5",
            2000,
        )
        .await;
        let ReadyOutcome::Ready(waited) = res else {
            panic!("expected ready, got {:?}", res)
        };
        assert!(waited >= Duration::from_millis(90), "{:?}", waited);
    }

    #[tokio::test]
    async fn marker_file_is_detected_and_stale_one_removed() {
        let path = std::env::temp_dir().join(format!("twt-ready-{}.marker", std::process::id()));
        std::fs::write(&path, "stale").unwrap();

        let readiness = Readiness::File { path: path.clone() };
        let script = format!("sleep 0.05; touch '{}'; exec sleep 5", path.to_string_lossy());
        let res = wait_for(readiness, &script, 2000).await;
        assert!(matches!(res, ReadyOutcome::Ready(_)));

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn port_bind_probe_sees_a_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let probe = PortBindProbe { addr };
        let server = spawn_sh("exec sleep 5");

        assert!(probe.is_ready(&server).await.unwrap());
        assert!(matches!(
            probe.prepare().await,
            Err(ReadinessError::AddrInUse(a)) if a == addr
        ));

        drop(listener);
        assert!(!probe.is_ready(&server).await.unwrap());
        assert!(probe.prepare().await.is_ok());
    }

    #[tokio::test]
    async fn polling_never_blocks_the_server_bind() {
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let probe = PortBindProbe { addr };

        // std sets SO_REUSEADDR on unix listeners, like the TLS test servers do.
        let server = std::thread::spawn(move || {
            (0..2000)
                .filter(|_| std::net::TcpListener::bind(addr).is_err())
                .count()
        });

        while !server.is_finished() {
            let _ = probe.is_bound();
        }
        assert_eq!(server.join().unwrap(), 0);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = Readiness::LogLine {
            pattern: "(unclosed".into(),
        }
        .probe()
        .unwrap_err();
        assert!(matches!(err, ReadinessError::InvalidPattern(..)));
    }

    #[test]
    fn readiness_from_toml() {
        #[derive(Deserialize)]
        struct T {
            readiness: Readiness,
        }
        let t: T = toml::from_str(
            r#"
            [readiness]
            kind = "settle"
            delay_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(
            t.readiness,
            Readiness::Settle {
                delay: Duration::from_millis(250)
            }
        );
    }
}
