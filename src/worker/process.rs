use std::{
    ffi::OsString,
    fmt,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::watch,
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    error::{SpawnError, WorkerError},
    protocol::{FailureKind, Operation, Outcome, WorkerEvent, WorkerReply, WorkerRequest},
};

/// How long a crash report waits for the exit status after the pipe closed.
const EXIT_STATUS_GRACE: Duration = Duration::from_millis(100);
const PREVIEW_CHARS: usize = 160;

/// Program, arguments and extra environment used to launch a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("exit status unknown"),
        }
    }
}

/// Kill switch and exit observer for one worker process.
///
/// Cloned into the pool's handle so the process can be killed while a lease
/// holds the [`WorkerProcess`] itself.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    pid: u32,
    kill: CancellationToken,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessControl {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Ask the supervisor to kill the process. Idempotent.
    pub fn terminate(&self) {
        self.kill.cancel();
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Resolve once the process has been reaped.
    pub async fn wait_exit(&self) -> Option<ExitInfo> {
        let mut exit = self.exit.clone();
        let info = exit.wait_for(Option::is_some).await.ok().and_then(|info| *info);
        info
    }
}

/// Handle to an open document inside a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub handle: u32,
    pub page_count: u32,
}

/// JPEG bytes produced by the worker for one page.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
}

/// A running `rasterd-worker` child and its stdio channel.
///
/// Dropping the value terminates the process.
pub struct WorkerProcess {
    generation: u64,
    spawned_at: Instant,
    control: ProcessControl,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_request: u64,
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("generation", &self.generation)
            .field("pid", &self.control.pid)
            .field("exited", &self.control.exit_info())
            .finish()
    }
}

impl WorkerProcess {
    /// Launch a worker and wait for its readiness announcement.
    pub async fn spawn(
        command: &WorkerCommand,
        generation: u64,
        startup_timeout: Duration,
    ) -> Result<Self, SpawnError> {
        let started_at = Instant::now();
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Launch {
                program: command.program.display().to_string(),
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SpawnError::MissingPipe("stderr"))?;

        let control = supervise(child, pid, generation);
        forward_stderr(stderr, generation, pid);

        let mut stdout = BufReader::new(stdout).lines();
        if let Err(err) = await_ready(&mut stdout, startup_timeout).await {
            control.terminate();
            warn!(
                target = "rasterd::worker",
                op = "worker::spawn",
                result = "error",
                generation,
                pid,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                error = %err,
                "Worker failed to start"
            );
            return Err(err);
        }

        info!(
            target = "rasterd::worker",
            op = "worker::spawn",
            result = "ready",
            generation,
            pid,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Worker ready"
        );

        Ok(Self {
            generation,
            spawned_at: started_at,
            control,
            stdin,
            stdout,
            next_request: 1,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> u32 {
        self.control.pid
    }

    pub fn spawned_at(&self) -> Instant {
        self.spawned_at
    }

    pub fn control(&self) -> &ProcessControl {
        &self.control
    }

    pub fn has_exited(&self) -> bool {
        self.control.has_exited()
    }

    pub fn terminate(&self) {
        self.control.terminate();
    }

    /// Send one operation and wait up to `timeout` for its reply.
    ///
    /// A timeout leaves the process running; the caller decides whether the
    /// worker is still trustworthy.
    pub async fn call(
        &mut self,
        op: Operation,
        timeout: Duration,
    ) -> Result<Outcome, WorkerError> {
        let operation = op.name();
        if self.control.has_exited() {
            return Err(self.crash_report(operation, "worker process is not running").await);
        }

        let id = self.next_request;
        self.next_request += 1;

        let mut line = serde_json::to_vec(&WorkerRequest { id, op })
            .map_err(|err| WorkerError::protocol(operation, err.to_string()))?;
        line.push(b'\n');

        match tokio::time::timeout(timeout, self.exchange(operation, id, &line)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    target = "rasterd::worker",
                    op = operation,
                    result = "timeout",
                    generation = self.generation,
                    pid = self.control.pid,
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker call timed out"
                );
                Err(WorkerError::Timeout { operation, timeout })
            }
        }
    }

    pub async fn open_document(
        &mut self,
        document: &[u8],
        timeout: Duration,
    ) -> Result<DocumentRef, WorkerError> {
        match self.call(Operation::open_document(document), timeout).await? {
            Outcome::DocumentOpened {
                document,
                page_count,
            } => Ok(DocumentRef {
                handle: document,
                page_count,
            }),
            Outcome::Failed {
                kind: FailureKind::Open,
                message,
            } => Err(WorkerError::Open(message)),
            other => Err(unexpected("open_document", &other)),
        }
    }

    pub async fn render_page(
        &mut self,
        document: &DocumentRef,
        page_index: u32,
        dpi: u32,
        quality: u8,
        timeout: Duration,
    ) -> Result<RenderedPage, WorkerError> {
        if page_index >= document.page_count {
            return Err(WorkerError::Render(format!(
                "page {} does not exist, document has {} page(s)",
                u64::from(page_index) + 1,
                document.page_count
            )));
        }

        let op = Operation::RenderPage {
            document: document.handle,
            page_index,
            dpi,
            quality,
        };
        match self.call(op, timeout).await? {
            Outcome::PageRendered {
                image,
                width,
                height,
            } => {
                let jpeg = super::protocol::decode_payload(&image).map_err(|err| {
                    WorkerError::protocol("render_page", format!("invalid image payload: {err}"))
                })?;
                Ok(RenderedPage {
                    jpeg: Bytes::from(jpeg),
                    width,
                    height,
                })
            }
            Outcome::Failed {
                kind: FailureKind::Render,
                message,
            } => Err(WorkerError::Render(message)),
            other => Err(unexpected("render_page", &other)),
        }
    }

    pub async fn close_document(
        &mut self,
        document: &DocumentRef,
        timeout: Duration,
    ) -> Result<(), WorkerError> {
        let op = Operation::CloseDocument {
            document: document.handle,
        };
        match self.call(op, timeout).await? {
            Outcome::DocumentClosed => Ok(()),
            other => Err(unexpected("close_document", &other)),
        }
    }

    async fn exchange(
        &mut self,
        operation: &'static str,
        id: u64,
        line: &[u8],
    ) -> Result<Outcome, WorkerError> {
        if let Err(err) = self.stdin.write_all(line).await {
            return Err(self.crash_report(operation, format!("write failed: {err}")).await);
        }
        if let Err(err) = self.stdin.flush().await {
            return Err(self.crash_report(operation, format!("flush failed: {err}")).await);
        }

        loop {
            let raw = match self.stdout.next_line().await {
                Ok(Some(raw)) => raw,
                Ok(None) => return Err(self.crash_report(operation, "output channel closed").await),
                Err(err) => {
                    return Err(self.crash_report(operation, format!("read failed: {err}")).await);
                }
            };

            let reply: WorkerReply = serde_json::from_str(&raw).map_err(|err| {
                WorkerError::protocol(
                    operation,
                    format!("undecodable reply `{}`: {err}", preview(&raw)),
                )
            })?;

            if reply.id < id {
                // Reply to a call that was abandoned after a timeout.
                debug!(
                    target = "rasterd::worker",
                    op = operation,
                    result = "stale_reply_skipped",
                    generation = self.generation,
                    stale_id = reply.id,
                    expected_id = id,
                    "Skipping stale worker reply"
                );
                continue;
            }
            if reply.id != id {
                return Err(WorkerError::protocol(
                    operation,
                    format!("reply id {} does not match request id {id}", reply.id),
                ));
            }
            return Ok(reply.outcome);
        }
    }

    async fn crash_report(&self, operation: &'static str, detail: impl Into<String>) -> WorkerError {
        let detail = detail.into();
        let exit = timeout(EXIT_STATUS_GRACE, self.control.wait_exit())
            .await
            .ok()
            .flatten();
        let detail = match exit {
            Some(info) => format!("{detail} ({info})"),
            None => detail,
        };
        warn!(
            target = "rasterd::worker",
            op = operation,
            result = "crashed",
            generation = self.generation,
            pid = self.control.pid,
            detail = %detail,
            "Worker crashed"
        );
        WorkerError::crashed(operation, detail)
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.control.terminate();
    }
}

async fn await_ready(
    stdout: &mut Lines<BufReader<ChildStdout>>,
    startup_timeout: Duration,
) -> Result<(), SpawnError> {
    let line = match timeout(startup_timeout, stdout.next_line()).await {
        Err(_) => return Err(SpawnError::StartupTimeout(startup_timeout)),
        Ok(Err(err)) => return Err(SpawnError::Handshake(err.to_string())),
        Ok(Ok(None)) => return Err(SpawnError::Exited),
        Ok(Ok(Some(line))) => line,
    };

    match serde_json::from_str::<WorkerEvent>(&line) {
        Ok(WorkerEvent::Ready { .. }) => Ok(()),
        Ok(WorkerEvent::StartupFailed { message }) => Err(SpawnError::StartupFailed(message)),
        Err(err) => Err(SpawnError::Handshake(format!("`{}`: {err}", preview(&line)))),
    }
}

fn supervise(mut child: Child, pid: u32, generation: u64) -> ProcessControl {
    let kill = CancellationToken::new();
    let (exit_tx, exit_rx) = watch::channel(None);
    let token = kill.clone();

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            () = token.cancelled() => {
                if let Err(err) = child.start_kill() {
                    debug!(
                        target = "rasterd::worker",
                        generation,
                        pid,
                        error = %err,
                        "Kill request found the worker already gone"
                    );
                }
                child.wait().await
            }
        };

        let info = match status {
            Ok(status) => ExitInfo::from_status(status),
            Err(err) => {
                warn!(
                    target = "rasterd::worker",
                    generation,
                    pid,
                    error = %err,
                    "Failed to reap worker process"
                );
                ExitInfo::unknown()
            }
        };
        debug!(
            target = "rasterd::worker",
            generation,
            pid,
            exit = %info,
            "Worker process exited"
        );
        exit_tx.send_replace(Some(info));
    });

    ProcessControl {
        pid,
        kill,
        exit: exit_rx,
    }
}

fn forward_stderr(stderr: ChildStderr, generation: u64, pid: u32) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(
                target = "rasterd::worker::stderr",
                generation,
                pid,
                line = %line,
                "worker stderr"
            );
        }
    });
}

fn unexpected(operation: &'static str, outcome: &Outcome) -> WorkerError {
    let detail = match outcome {
        Outcome::Failed { kind, message } => format!("worker rejected request ({kind:?}): {message}"),
        other => format!("unexpected `{}` reply", other.name()),
    };
    WorkerError::protocol(operation, detail)
}

fn preview(raw: &str) -> String {
    if raw.chars().count() <= PREVIEW_CHARS {
        return raw.to_string();
    }
    let head: String = raw.chars().take(PREVIEW_CHARS).collect();
    format!("{head}…")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt, path::Path};
    use tempfile::TempDir;

    const ECHO_WORKER: &str = r#"#!/bin/sh
echo '{"event":"ready","pid":'$$'}'
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"type":"open_document"'*)
      case "$line" in
        *Y29ycnVwdA*) printf '{"id":%s,"outcome":{"status":"failed","kind":"open","message":"invalid xref table"}}\n' "$id" ;;
        *Y3Jhc2gh*) exit 3 ;;
        *aGFuZw*) exec sleep 30 ;;
        *) printf '{"id":%s,"outcome":{"status":"document_opened","document":1,"page_count":1}}\n' "$id" ;;
      esac
      ;;
    *'"type":"render_page"'*)
      printf '{"id":%s,"outcome":{"status":"page_rendered","image":"/9j/4A==","width":8,"height":11}}\n' "$id"
      ;;
    *'"type":"close_document"'*)
      printf '{"id":%s,"outcome":{"status":"document_closed"}}\n' "$id"
      ;;
  esac
done
"#;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("set perms");
        path
    }

    async fn spawn_echo(dir: &TempDir) -> WorkerProcess {
        let script = write_script(dir.path(), "echo-worker", ECHO_WORKER);
        WorkerProcess::spawn(&WorkerCommand::new(script), 1, Duration::from_secs(5))
            .await
            .expect("worker spawned")
    }

    #[tokio::test]
    async fn opens_and_renders_through_the_pipe() {
        let dir = TempDir::new().expect("temp dir");
        let mut worker = spawn_echo(&dir).await;

        let document = worker
            .open_document(b"%PDF-1.7 fake", Duration::from_secs(5))
            .await
            .expect("document opened");
        assert_eq!(document.page_count, 1);

        let page = worker
            .render_page(&document, 0, 150, 85, Duration::from_secs(5))
            .await
            .expect("page rendered");
        assert_eq!(&page.jpeg[..3], &[0xFF, 0xD8, 0xFF]);
        assert_eq!((page.width, page.height), (8, 11));

        worker
            .close_document(&document, Duration::from_secs(5))
            .await
            .expect("document closed");
    }

    #[tokio::test]
    async fn engine_rejections_surface_as_open_errors() {
        let dir = TempDir::new().expect("temp dir");
        let mut worker = spawn_echo(&dir).await;

        let err = worker
            .open_document(b"corrupt", Duration::from_secs(5))
            .await
            .expect_err("corrupt document");
        assert!(matches!(err, WorkerError::Open(ref message) if message.contains("xref")));
        assert!(err.is_document_error());
    }

    #[tokio::test]
    async fn out_of_range_pages_are_rejected_without_a_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let mut worker = spawn_echo(&dir).await;
        let document = DocumentRef {
            handle: 1,
            page_count: 1,
        };

        let err = worker
            .render_page(&document, 1, 150, 85, Duration::from_secs(5))
            .await
            .expect_err("page 2 of a 1-page document");
        assert!(matches!(err, WorkerError::Render(ref message) if message.contains("page 2")));
    }

    #[tokio::test]
    async fn silent_death_is_reported_as_crash() {
        let dir = TempDir::new().expect("temp dir");
        let mut worker = spawn_echo(&dir).await;

        let err = worker
            .open_document(b"crash!", Duration::from_secs(5))
            .await
            .expect_err("worker exits mid-call");
        match err {
            WorkerError::Crashed { operation, .. } => assert_eq!(operation, "open_document"),
            other => panic!("unexpected error variant: {other:?}"),
        }

        worker.control().wait_exit().await;
        assert!(worker.has_exited());
        assert_eq!(
            worker.control().exit_info().and_then(|info| info.code),
            Some(3)
        );
    }

    #[tokio::test]
    async fn call_timeout_does_not_kill_the_worker() {
        let dir = TempDir::new().expect("temp dir");
        let mut worker = spawn_echo(&dir).await;

        let started = Instant::now();
        let err = worker
            .open_document(b"hang", Duration::from_millis(200))
            .await
            .expect_err("hung call");
        assert!(matches!(err, WorkerError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(200));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!worker.has_exited(), "timeout must not kill the worker");

        worker.terminate();
        let exit = worker.control().wait_exit().await.expect("exit observed");
        assert_eq!(exit.signal, Some(9));
    }

    #[tokio::test]
    async fn startup_failure_is_a_spawn_error() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(
            dir.path(),
            "broken-worker",
            "#!/bin/sh\necho '{\"event\":\"startup_failed\",\"message\":\"libpdfium.so not found\"}'\n",
        );

        let err = WorkerProcess::spawn(&WorkerCommand::new(script), 1, Duration::from_secs(5))
            .await
            .expect_err("startup failure");
        assert!(matches!(err, SpawnError::StartupFailed(ref message) if message.contains("libpdfium")));
    }

    #[tokio::test]
    async fn slow_startup_exceeds_the_window() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(dir.path(), "slow-worker", "#!/bin/sh\nexec sleep 30\n");

        let err = WorkerProcess::spawn(&WorkerCommand::new(script), 1, Duration::from_millis(150))
            .await
            .expect_err("startup timeout");
        assert!(matches!(err, SpawnError::StartupTimeout(_)));
    }

    #[tokio::test]
    async fn missing_program_fails_to_launch() {
        let err = WorkerProcess::spawn(
            &WorkerCommand::new("/nonexistent/rasterd-worker"),
            1,
            Duration::from_secs(1),
        )
        .await
        .expect_err("launch failure");
        assert!(matches!(err, SpawnError::Launch { .. }));
    }

    #[tokio::test]
    async fn early_exit_is_reported() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(dir.path(), "quitter", "#!/bin/sh\nexit 0\n");

        let err = WorkerProcess::spawn(&WorkerCommand::new(script), 1, Duration::from_secs(5))
            .await
            .expect_err("exited before ready");
        assert!(matches!(err, SpawnError::Exited));
    }
}
