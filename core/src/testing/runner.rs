use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::Mutex,
    task::JoinHandle,
    time::Instant,
};

use super::result::{ExitCode, ProcessOutput};

#[derive(Debug, thiserror::Error)]
#[error("Failed to launch '{program}' (resolved to '{}'): {source}", .path.to_string_lossy())]
pub struct LaunchError {
    pub program: String,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("'{0}' still running after {}ms", .1.as_millis())]
    Timeout(String, Duration),

    #[error("Failed to wait for '{0}': {1}")]
    Io(String, #[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Return a handle right after spawning.
    Background,
    /// Wait for the process; kill it if it outlives `timeout`.
    Blocking { timeout: Duration },
}

#[derive(Debug)]
pub enum Started {
    Background(ProcessHandle),
    Finished(ProcessOutput),
    TimedOut(ProcessOutput),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Running,
    Exited(ExitCode),
    Killed(ExitCode),
}

impl ProcState {
    pub fn exit_code(self) -> Option<ExitCode> {
        match self {
            ProcState::Running => None,
            ProcState::Exited(code) | ProcState::Killed(code) => Some(code),
        }
    }
}

#[derive(Debug, Default)]
struct Capture {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

type SharedCapture = Arc<Mutex<Capture>>;

/// A spawned process. Its state only ever moves from `Running` to
/// `Exited`/`Killed`, and [`ProcessHandle::finish`] consumes it.
#[derive(Debug)]
pub struct ProcessHandle {
    program: String,
    pid: Option<u32>,
    spawned_at: Instant,
    child: Child,
    state: ProcState,
    stdout: SharedCapture,
    stderr: SharedCapture,
    drains: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// How long `finish()` waits for the output pipes to close.
    /// A grandchild that inherited the pipe may keep it open forever.
    const DRAIN_GRACE: Duration = Duration::from_millis(500);

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Time since the process was spawned.
    pub fn elapsed(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcState::Running
    }

    /// Non-blocking exit check.
    pub fn try_exit(&mut self) -> io::Result<Option<ExitCode>> {
        if let Some(code) = self.state.exit_code() {
            return Ok(Some(code));
        }
        let Some(status) = self.child.try_wait()? else {
            return Ok(None)
        };
        let code = ExitCode::from_status(status);
        self.state = ProcState::Exited(code);
        Ok(Some(code))
    }

    /// Waits up to `timeout` for the process to exit.
    /// On timeout the process is left running.
    pub async fn wait(&mut self, timeout: Duration) -> Result<ExitCode, WaitError> {
        if let Some(code) = self.state.exit_code() {
            return Ok(code);
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Err(_) => Err(WaitError::Timeout(self.program.clone(), timeout)),
            Ok(Err(e)) => Err(WaitError::Io(self.program.clone(), e)),
            Ok(Ok(status)) => {
                let code = ExitCode::from_status(status);
                log::debug!("'{}' (pid {:?}) exited: {}", self.program, self.pid, code);
                self.state = ProcState::Exited(code);
                Ok(code)
            }
        }
    }

    /// Forcibly terminates the process and anything it started in its process
    /// group. Returns the final exit code; a process that already exited keeps
    /// its own.
    pub async fn kill(&mut self) -> io::Result<ExitCode> {
        if let Some(code) = self.try_exit()? {
            self.kill_group();
            return Ok(code);
        }
        self.kill_group();
        self.child.start_kill()?;
        let status = self.child.wait().await?;
        let code = ExitCode::from_status(status);
        log::debug!("Killed '{}' (pid {:?}): {}", self.program, self.pid, code);
        self.state = ProcState::Killed(code);
        Ok(code)
    }

    /// SIGKILLs the process group led by the child, if any member is left.
    #[cfg(unix)]
    fn kill_group(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else { return };
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => log::debug!("killpg({}) for '{}': {}", pid, self.program, e),
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}

    /// Everything written to stdout and stderr so far.
    pub async fn captured_text(&self) -> String {
        let out = self.stdout.lock().await;
        let err = self.stderr.lock().await;
        let mut s = String::from_utf8_lossy(&out.buf).into_owned();
        s.push_str(&String::from_utf8_lossy(&err.buf));
        s
    }

    /// Consumes the handle and collects the captured output.
    /// A still-running process is killed on drop.
    pub async fn finish(self) -> ProcessOutput {
        let Self {
            program,
            child,
            state,
            stdout,
            stderr,
            drains,
            ..
        } = self;

        // Killing on drop closes our end of the pipes if the process is still there.
        drop(child);

        for mut drain in drains {
            if tokio::time::timeout(Self::DRAIN_GRACE, &mut drain)
                .await
                .is_err()
            {
                log::warn!("Output of '{}' still open after exit; detaching", program);
                drain.abort();
            }
        }

        let stdout = stdout.lock().await;
        let stderr = stderr.lock().await;
        ProcessOutput {
            exit: state.exit_code(),
            stdout: String::from_utf8_lossy(&stdout.buf).into(),
            stderr: String::from_utf8_lossy(&stderr.buf).into(),
            truncated: stdout.truncated || stderr.truncated,
        }
    }
}

fn spawn_drain<R>(mut reader: R, capture: SharedCapture, label: String) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                // Keep reading past the limit so the child never blocks on a full pipe.
                Ok(n) => capture.lock().await.push(&chunk[..n]),
                Err(e) => {
                    log::debug!("Stopped reading {}: {}", label, e);
                    break;
                }
            }
        }
    })
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    bin_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    capture_max_bytes: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub const DEFAULT_CAPTURE_MAX_BYTES: usize = 64 * 1024;

    pub fn new() -> Self {
        Self {
            bin_dir: None,
            work_dir: None,
            capture_max_bytes: Self::DEFAULT_CAPTURE_MAX_BYTES,
        }
    }

    /// Directory searched for program names before `$PATH`.
    pub fn bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn capture_max_bytes(mut self, n: usize) -> Self {
        self.capture_max_bytes = n;
        self
    }

    /// Resolves a program name to what gets exec'd.
    /// Paths are made absolute since the child may run in another `work_dir`.
    pub fn resolve_program(&self, program: &str) -> PathBuf {
        if let Some(dir) = &self.bin_dir {
            let candidate = dir.join(program);
            if candidate.is_file() {
                return candidate.canonicalize().unwrap_or(candidate);
            }
        }
        let path = Path::new(program);
        if path.components().count() > 1 {
            return path.canonicalize().unwrap_or_else(|_| path.to_owned());
        }
        path.to_owned()
    }

    pub async fn start(
        &self,
        program: &str,
        args: &[String],
        mode: LaunchMode,
    ) -> Result<Started, LaunchError> {
        let mut handle = self.spawn(program, args)?;
        let LaunchMode::Blocking { timeout } = mode else {
            return Ok(Started::Background(handle))
        };

        match handle.wait(timeout).await {
            Ok(_) => Ok(Started::Finished(handle.finish().await)),
            Err(e) => {
                log::debug!("{}", e);
                if let Err(e) = handle.kill().await {
                    log::warn!("Failed to kill '{}': {:#}", program, e);
                }
                Ok(Started::TimedOut(handle.finish().await))
            }
        }
    }

    /// Launches `program` in the background with piped, captured output.
    pub fn spawn(&self, program: &str, args: &[String]) -> Result<ProcessHandle, LaunchError> {
        let path = self.resolve_program(program);

        let mut cmd = Command::new(&path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group, so `kill` also reaches whatever a wrapper script forked.
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError {
            program: program.to_owned(),
            path: path.clone(),
            source,
        })?;
        let pid = child.id();
        log::debug!("Spawned '{} {}' (pid {:?})", program, args.join(" "), pid);

        let stdout: SharedCapture = Arc::new(Mutex::new(Capture::new(self.capture_max_bytes)));
        let stderr: SharedCapture = Arc::new(Mutex::new(Capture::new(self.capture_max_bytes)));
        let mut drains = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            drains.push(spawn_drain(out, stdout.clone(), format!("{} stdout", program)));
        }
        if let Some(err) = child.stderr.take() {
            drains.push(spawn_drain(err, stderr.clone(), format!("{} stderr", program)));
        }

        Ok(ProcessHandle {
            program: program.to_owned(),
            pid,
            spawned_at: Instant::now(),
            child,
            state: ProcState::Running,
            stdout,
            stderr,
            drains,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_owned(), script.to_owned()]
    }

    async fn run_blocking(script: &str, timeout_ms: u64) -> Started {
        ProcessRunner::new()
            .start(
                "sh",
                &sh(script),
                LaunchMode::Blocking {
                    timeout: Duration::from_millis(timeout_ms),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn blocking_returns_exit_code_and_output() {
        let Started::Finished(out) = run_blocking("echo hello; echo oops >&2; exit 3", 2000).await else {
            panic!("expected the process to finish")
        };
        assert_eq!(
            out,
            ProcessOutput {
                exit: Some(ExitCode(3)),
                stdout: "hello\n".into(),
                stderr: "oops\n".into(),
                truncated: false,
            }
        );
    }

    #[tokio::test]
    async fn blocking_kills_on_timeout() {
        let res = run_blocking("exec sleep 5", 200).await;
        let Started::TimedOut(out) = dbg!(res) else {
            panic!("expected a timeout")
        };
        let code = out.exit.unwrap();
        assert!(code.is_signaled(), "{}", code);
    }

    #[tokio::test]
    async fn background_handle_can_be_waited() {
        let runner = ProcessRunner::new();
        let Started::Background(mut h) = runner
            .start("sh", &sh("exec sleep 0.1"), LaunchMode::Background)
            .await
            .unwrap()
        else {
            panic!("expected a background handle")
        };
        assert!(h.is_running());
        assert!(h.pid().is_some());

        let code = h.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(code, ExitCode(0));
        assert_eq!(h.state(), ProcState::Exited(ExitCode(0)));
    }

    #[tokio::test]
    async fn wait_timeout_leaves_process_running_until_killed() {
        let mut h = ProcessRunner::new()
            .spawn("sh", &sh("exec sleep 5"))
            .unwrap();

        let err = h.wait(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, WaitError::Timeout(..)));
        assert!(h.is_running());

        let code = h.kill().await.unwrap();
        assert_eq!(code, ExitCode(-9));
        assert_eq!(h.state(), ProcState::Killed(ExitCode(-9)));

        // killing twice keeps the first result
        assert_eq!(h.kill().await.unwrap(), ExitCode(-9));
        assert_eq!(h.finish().await.exit, Some(ExitCode(-9)));
    }

    #[tokio::test]
    async fn kill_after_natural_exit_keeps_exit_code() {
        let mut h = ProcessRunner::new().spawn("sh", &sh("exit 4")).unwrap();
        h.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(h.kill().await.unwrap(), ExitCode(4));
        assert_eq!(h.state(), ProcState::Exited(ExitCode(4)));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn kill_reaches_processes_forked_by_a_wrapper() {
        let mut h = ProcessRunner::new()
            .spawn("sh", &sh("sleep 5 & echo $!; wait"))
            .unwrap();

        let mut grandchild = String::new();
        for _ in 0..200 {
            if let Some(line) = h.captured_text().await.lines().next() {
                grandchild = line.trim().to_owned();
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!grandchild.is_empty(), "wrapper never reported its child");

        assert_eq!(h.kill().await.unwrap(), ExitCode(-9));
        h.finish().await;

        // Gone, or a zombie waiting for its new parent to reap it.
        let stat = std::path::Path::new("/proc").join(&grandchild).join("stat");
        let mut alive = true;
        for _ in 0..100 {
            alive = match std::fs::read_to_string(&stat) {
                Ok(s) => !s.contains(") Z "),
                Err(_) => false,
            };
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!alive, "pid {} survived the kill", grandchild);
    }

    #[tokio::test]
    async fn signal_exit_maps_to_negative_sentinel() {
        let Started::Finished(out) = run_blocking("kill -TERM $$", 2000).await else {
            panic!("expected the process to finish")
        };
        assert_eq!(out.exit, Some(ExitCode(-15)));
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let err = ProcessRunner::new()
            .spawn("twt-no-such-program-here", &[])
            .unwrap_err();
        assert_eq!(dbg!(&err).source.kind(), io::ErrorKind::NotFound);
        assert_eq!(err.program, "twt-no-such-program-here");
    }

    #[tokio::test]
    async fn capture_is_truncated_at_limit() {
        let runner = ProcessRunner::new().capture_max_bytes(4);
        let Started::Finished(out) = runner
            .start(
                "sh",
                &sh("echo 0123456789"),
                LaunchMode::Blocking {
                    timeout: Duration::from_secs(2),
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected the process to finish")
        };
        assert_eq!(out.stdout, "0123");
        assert!(out.truncated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bin_dir_is_searched_first() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("twt-runner-bin-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("fake_tls_app");
        std::fs::write(&script, "#!/bin/sh\necho \"args: $*\"\nexit 7\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = ProcessRunner::new().bin_dir(&dir);
        let Started::Finished(out) = runner
            .start(
                "fake_tls_app",
                &["-S".to_owned(), "-b".to_owned(), "1".to_owned()],
                LaunchMode::Blocking {
                    timeout: Duration::from_secs(2),
                },
            )
            .await
            .unwrap()
        else {
            panic!("expected the process to finish")
        };
        assert_eq!(out.exit, Some(ExitCode(7)));
        assert_eq!(out.stdout, "args: -S -b 1\n");

        std::fs::remove_dir_all(dir).unwrap();
    }
}
