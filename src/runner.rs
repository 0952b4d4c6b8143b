use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::models::{CancelReason, normalize_file_path};
use crate::monitor::{ResourceMonitor, UsageSnapshot};
use crate::sandbox::{EnvironmentHandle, signal_group};

const READ_CHUNK: usize = 8 * 1024;
/// How long to wait for the pipes to close after the process group is gone
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Cancellation switch for one run
///
/// The first `cancel` wins and fixes the reason reported on the record.
#[derive(Debug, Default)]
pub struct RunControl {
    token: CancellationToken,
    reason: Mutex<Option<CancelReason>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation, returning false if it was already requested
    pub fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut current = self.reason.lock();
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Bounded stdout/stderr capture, readable while the process still runs
#[derive(Debug)]
pub struct OutputBuffer {
    limit: usize,
    stdout: Mutex<Capture>,
    stderr: Mutex<Capture>,
}

impl OutputBuffer {
    /// `limit` is per stream, in bytes
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            stdout: Mutex::new(Capture::default()),
            stderr: Mutex::new(Capture::default()),
        }
    }

    fn capture(&self, stream: Stream) -> &Mutex<Capture> {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }

    /// Appends `chunk`, dropping whatever does not fit under the limit
    ///
    /// Once the limit is hit the stream stays closed, and a character split by
    /// the cut is dropped whole.
    pub fn append(&self, stream: Stream, chunk: &[u8]) {
        let mut capture = self.capture(stream).lock();
        if capture.truncated {
            return;
        }
        let room = self.limit.saturating_sub(capture.bytes.len());
        if chunk.len() <= room {
            capture.bytes.extend_from_slice(chunk);
            return;
        }

        capture.truncated = true;
        capture.bytes.extend_from_slice(&chunk[..room]);
        let keep = complete_utf8_len(&capture.bytes);
        capture.bytes.truncate(keep);
    }

    pub fn is_truncated(&self, stream: Stream) -> bool {
        self.capture(stream).lock().truncated
    }

    fn render(&self, stream: Stream) -> String {
        let capture = self.capture(stream).lock();
        let mut text = String::from_utf8_lossy(&capture.bytes).into_owned();
        if capture.truncated {
            text.push_str(&format!(
                "\n[output truncated: limit of {} bytes reached]\n",
                self.limit
            ));
        }
        text
    }

    pub fn stdout(&self) -> String {
        self.render(Stream::Stdout)
    }

    pub fn stderr(&self) -> String {
        self.render(Stream::Stderr)
    }
}

/// Length of `bytes` without a trailing incomplete UTF-8 sequence
fn complete_utf8_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for start in (len.saturating_sub(3)..len).rev() {
        let width = match bytes[start] {
            0x80..=0xBF => continue,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if start + width > len { start } else { len };
    }
    len
}

/// How the entry process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(i32),
    Signaled(i32),
    TimedOut(Duration),
    Cancelled(CancelReason),
}

#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub usage: UsageSnapshot,
    pub elapsed: Duration,
}

/// Launches entry files inside provisioned sandboxes
#[derive(Clone)]
pub struct Runner {
    grace_period: Duration,
    monitor: ResourceMonitor,
}

impl Runner {
    pub fn new(grace_period: Duration, monitor: ResourceMonitor) -> Self {
        Self {
            grace_period,
            monitor,
        }
    }

    /// Runs `entry_file` to completion, timeout or cancellation
    ///
    /// Output is appended to `output` as it arrives. Only failures to start or
    /// wait for the process are errors; every way the process can end is a
    /// `RunOutcome`.
    pub async fn run(
        &self,
        handle: &Arc<EnvironmentHandle>,
        entry_file: &str,
        timeout: Duration,
        control: &RunControl,
        output: &Arc<OutputBuffer>,
    ) -> Result<RunReport, RunnerError> {
        if handle.is_torn_down() {
            return Err(RunnerError::SandboxGone);
        }
        let entry = normalize_file_path(entry_file)
            .filter(|p| handle.root().join(p).is_file())
            .ok_or_else(|| RunnerError::EntryNotFound(entry_file.to_string()))?;

        if let Some(reason) = control.reason() {
            return Ok(RunReport {
                outcome: RunOutcome::Cancelled(reason),
                usage: UsageSnapshot::default(),
                elapsed: Duration::ZERO,
            });
        }

        let argv = handle.command_for(&entry);
        let mut child = spawn(handle, &argv)?;
        let started = Instant::now();

        let pgid = child.id().map(|pid| pid as i32);
        handle.set_process_group(pgid);
        let monitor = self.monitor.attach(handle);
        log::debug!(
            "Sandbox {} launched {:?} as group {:?} ({} project {})",
            handle.id(),
            argv,
            pgid,
            handle.language(),
            handle.project_id()
        );

        let pumps = [
            child
                .stdout
                .take()
                .map(|pipe| spawn_pump(pipe, output.clone(), Stream::Stdout)),
            child
                .stderr
                .take()
                .map(|pipe| spawn_pump(pipe, output.clone(), Stream::Stderr)),
        ];

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let waited = tokio::select! {
            status = child.wait() => status.map(outcome_of),
            _ = &mut deadline => {
                log::info!("Sandbox {} exceeded its time limit of {timeout:?}", handle.id());
                self.terminate(&mut child, pgid).await;
                Ok(RunOutcome::TimedOut(timeout))
            }
            _ = control.cancelled() => {
                let reason = control.reason().unwrap_or(CancelReason::Operator);
                log::info!("Cancelling run in sandbox {}: {reason}", handle.id());
                self.terminate(&mut child, pgid).await;
                Ok(RunOutcome::Cancelled(reason))
            }
        };
        let elapsed = started.elapsed();

        if pgid.is_some_and(|pgid| signal_group(pgid, libc::SIGKILL)) {
            log::debug!("Killed stray processes of group {pgid:?}");
        }
        if waited.is_err() {
            let _ = child.kill().await;
        }

        for pump in pumps.into_iter().flatten() {
            drain(pump).await;
        }
        let usage = monitor.detach().await;
        handle.set_process_group(None);

        let outcome = waited.map_err(RunnerError::Wait)?;
        log::debug!(
            "Sandbox {} finished with {outcome:?} after {elapsed:?}",
            handle.id()
        );
        Ok(RunReport {
            outcome,
            usage,
            elapsed,
        })
    }

    /// Asks the group to exit, then kills it once the grace period is over
    async fn terminate(&self, child: &mut Child, pgid: Option<i32>) {
        let Some(pgid) = pgid else {
            let _ = child.kill().await;
            return;
        };

        signal_group(pgid, libc::SIGTERM);
        if tokio::time::timeout(self.grace_period, child.wait())
            .await
            .is_err()
        {
            log::warn!("Group {pgid} ignored SIGTERM, sending SIGKILL");
            signal_group(pgid, libc::SIGKILL);
            let _ = child.wait().await;
        }
    }
}

fn spawn(handle: &EnvironmentHandle, argv: &[String]) -> Result<Child, RunnerError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| RunnerError::Launch {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

    let mut std_cmd = std::process::Command::new(program);
    std_cmd
        .args(args)
        .current_dir(handle.root())
        .env_clear()
        .envs(handle.env().iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let limits = handle.limits();
    if !limits.is_empty() {
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe
        unsafe {
            std_cmd.pre_exec(move || limits.apply());
        }
    }

    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(true);
    cmd.spawn().map_err(|source| RunnerError::Launch {
        program: program.clone(),
        source,
    })
}

fn spawn_pump<R>(mut pipe: R, output: Arc<OutputBuffer>, stream: Stream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                // Keep reading past the limit so the process never blocks on a full pipe
                Ok(n) => output.append(stream, &buf[..n]),
                Err(e) => {
                    log::warn!("Reading {stream:?} failed: {e}");
                    break;
                }
            }
        }
    })
}

async fn drain(mut pump: JoinHandle<()>) {
    if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut pump)
        .await
        .is_err()
    {
        log::warn!("Output pipe still open after the process group exited, abandoning it");
        pump.abort();
    }
}

fn outcome_of(status: ExitStatus) -> RunOutcome {
    match (status.code(), status.signal()) {
        (Some(code), _) => RunOutcome::Exited(code),
        (None, Some(signal)) => RunOutcome::Signaled(signal),
        (None, None) => RunOutcome::Exited(-1),
    }
}

pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Language;
    use crate::sandbox::ProcessLimits;
    use pretty_assertions::assert_eq;

    struct Fixture {
        _dir: tempfile::TempDir,
        handle: Arc<EnvironmentHandle>,
    }

    fn fixture(script: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.sh"), script).unwrap();
        let env = vec![(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()),
        )];
        let handle = Arc::new(EnvironmentHandle::new(
            uuid::Uuid::new_v4(),
            uuid::Uuid::new_v4(),
            Language::Python,
            dir.path().to_path_buf(),
            vec!["/bin/sh".to_string(), "%ENTRY%".to_string()],
            Vec::new(),
            env,
            ProcessLimits::default(),
        ));
        Fixture { _dir: dir, handle }
    }

    fn runner() -> Runner {
        Runner::new(
            Duration::from_millis(300),
            ResourceMonitor::procfs(Duration::from_millis(10)),
        )
    }

    async fn run(fixture: &Fixture, timeout: Duration) -> (RunReport, Arc<OutputBuffer>) {
        let output = Arc::new(OutputBuffer::new(1024));
        let report = runner()
            .run(&fixture.handle, "main.sh", timeout, &RunControl::new(), &output)
            .await
            .unwrap();
        (report, output)
    }

    #[test]
    fn test_output_buffer_truncates_with_marker() {
        let buffer = OutputBuffer::new(5);
        buffer.append(Stream::Stdout, b"abc");
        buffer.append(Stream::Stdout, b"defgh");
        buffer.append(Stream::Stderr, b"ok");

        assert!(buffer.is_truncated(Stream::Stdout));
        assert_eq!(
            buffer.stdout(),
            "abcde\n[output truncated: limit of 5 bytes reached]\n"
        );
        assert_eq!(buffer.stderr(), "ok");
    }

    #[test]
    fn test_truncation_keeps_characters_whole() {
        let buffer = OutputBuffer::new(5);
        // "é" is two bytes and would straddle the limit
        buffer.append(Stream::Stdout, "abcdé".as_bytes());
        buffer.append(Stream::Stdout, b"more");
        assert_eq!(
            buffer.stdout(),
            "abcd\n[output truncated: limit of 5 bytes reached]\n"
        );

        let buffer = OutputBuffer::new(7);
        buffer.append(Stream::Stderr, "ab€".as_bytes());
        buffer.append(Stream::Stderr, "€".as_bytes());
        assert_eq!(
            buffer.stderr(),
            "ab€\n[output truncated: limit of 7 bytes reached]\n"
        );
        assert!(!buffer.stderr().contains('\u{FFFD}'));
    }

    #[test]
    fn test_first_cancel_wins() {
        let control = RunControl::new();
        assert!(control.cancel(CancelReason::ProjectDeleted));
        assert!(!control.cancel(CancelReason::Operator));
        assert_eq!(control.reason(), Some(CancelReason::ProjectDeleted));
        assert!(control.is_cancelled());
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let fixture = fixture("echo out\necho err >&2\nexit 3\n");
        let (report, output) = run(&fixture, Duration::from_secs(5)).await;
        assert_eq!(report.outcome, RunOutcome::Exited(3));
        assert_eq!(output.stdout(), "out\n");
        assert_eq!(output.stderr(), "err\n");
        assert!(fixture.handle.process_group().is_none());
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        let fixture = fixture("echo \"[$HOME]\"\npwd\n");
        let (_, output) = run(&fixture, Duration::from_secs(5)).await;
        let root = fixture.handle.root().canonicalize().unwrap();
        assert_eq!(output.stdout(), format!("[]\n{}\n", root.display()));
    }

    #[tokio::test]
    async fn test_timeout_terminates_group() {
        let fixture = fixture("sleep 30\n");
        let started = Instant::now();
        let (report, _) = run(&fixture, Duration::from_millis(200)).await;
        let elapsed = started.elapsed();

        assert_eq!(report.outcome, RunOutcome::TimedOut(Duration::from_millis(200)));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(200 + 300 + 1500), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_kill() {
        let fixture = fixture("trap '' TERM\nwhile :; do sleep 0.05; done\n");
        let started = Instant::now();
        let (report, _) = run(&fixture, Duration::from_millis(100)).await;

        assert!(matches!(report.outcome, RunOutcome::TimedOut(_)));
        assert!(started.elapsed() >= Duration::from_millis(100 + 300));
    }

    #[tokio::test]
    async fn test_cancel_stops_run() {
        let fixture = fixture("echo started\nsleep 30\n");
        let output = Arc::new(OutputBuffer::new(1024));
        let control = Arc::new(RunControl::new());

        let canceller = {
            let control = control.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                control.cancel(CancelReason::Operator);
            })
        };
        let report = runner()
            .run(&fixture.handle, "main.sh", Duration::from_secs(30), &control, &output)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled(CancelReason::Operator));
        assert_eq!(output.stdout(), "started\n");
    }

    #[tokio::test]
    async fn test_stray_background_process_is_killed() {
        let fixture = fixture("sleep 30 &\necho $! > child.pid\n");
        let (report, _) = run(&fixture, Duration::from_secs(5)).await;
        assert_eq!(report.outcome, RunOutcome::Exited(0));

        let pid: i32 = std::fs::read_to_string(fixture.handle.root().join("child.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap_or_default();
        // Either reaped already or left as a zombie
        assert!(stat.is_empty() || stat.contains(") Z "), "{stat}");
    }

    #[tokio::test]
    async fn test_missing_entry_and_torn_down_sandbox() {
        let fixture = fixture("true\n");
        let output = Arc::new(OutputBuffer::new(16));
        let err = runner()
            .run(
                &fixture.handle,
                "nope.sh",
                Duration::from_secs(1),
                &RunControl::new(),
                &output,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::EntryNotFound(_)));

        fixture.handle.mark_torn_down();
        let err = runner()
            .run(
                &fixture.handle,
                "main.sh",
                Duration::from_secs(1),
                &RunControl::new(),
                &output,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::SandboxGone));
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
        assert_eq!(signal_name(200), "unknown");
    }
}
