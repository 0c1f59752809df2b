use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time;
use tracing::{debug, warn};

use crate::error::Error;
use crate::Result;

const SANDBOX_PY: &str = include_str!("python/sandbox.py");
const DRIVER_PY: &str = include_str!("python/driver.py");

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct WireRequest<'a> {
    code: &'a str,
}

/// One reply frame from the worker. A stream field is `None` when that
/// request produced no bytes on it.
#[derive(Debug, Deserialize)]
pub(crate) struct WireReply {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

#[derive(Deserialize)]
struct WireHello {
    ready: bool,
}

/// Handle to one child interpreter process. The interpreter applies the
/// sandbox at startup and then serves `{code}` frames against a persistent
/// namespace for its whole lifetime; it is never recycled across sessions.
pub(crate) struct Worker {
    child: Child,
    stdin: ChildStdin,
    replies: Lines<BufReader<ChildStdout>>,
    pid: u32,
}

impl Worker {
    pub(crate) async fn spawn(python: &Path) -> Result<Self> {
        let program = format!("{SANDBOX_PY}\n{DRIVER_PY}");
        let mut command = Command::new(python);
        command
            .args(["-u", "-B", "-c", &program])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so teardown takes down anything the worker forked.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(io::Error::from)?;
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(Error::Spawn)?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Startup("worker exited during spawn".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Startup("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Startup("worker stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Startup("worker stderr not captured".to_string()))?;

        let mut worker = Self {
            child,
            stdin,
            replies: BufReader::new(stdout).lines(),
            pid,
        };

        // The driver announces itself once the sandbox is installed; nothing
        // is submitted before that.
        match time::timeout(STARTUP_TIMEOUT, worker.replies.next_line()).await {
            Ok(Ok(Some(line)))
                if serde_json::from_str::<WireHello>(&line)
                    .map(|hello| hello.ready)
                    .unwrap_or(false) => {}
            Ok(Ok(Some(line))) => {
                worker.shutdown().await;
                return Err(Error::Startup(format!("unexpected readiness frame: {line}")));
            }
            Ok(Ok(None)) => {
                let diagnostics = drain_stderr(stderr).await;
                worker.shutdown().await;
                return Err(Error::Startup(format!(
                    "worker exited before becoming ready: {diagnostics}"
                )));
            }
            Ok(Err(e)) => {
                worker.shutdown().await;
                return Err(Error::Startup(format!("readiness read failed: {e}")));
            }
            Err(_) => {
                worker.shutdown().await;
                return Err(Error::Startup("timed out waiting for readiness".to_string()));
            }
        }

        // Anything the interpreter writes to its real stderr after startup is
        // operator diagnostics; forward it to the log.
        let mut diagnostics = BufReader::new(stderr).lines();
        tokio::spawn(async move {
            while let Ok(Some(line)) = diagnostics.next_line().await {
                warn!(pid, line = %line, "worker stderr");
            }
        });

        debug!(pid, "worker ready");
        Ok(worker)
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Frame a request and hand it to the worker.
    pub(crate) async fn send(&mut self, code: &str) -> Result<()> {
        let mut frame = serde_json::to_string(&WireRequest { code })?;
        frame.push('\n');
        self.stdin.write_all(frame.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Next reply frame. `None` means the worker closed its pipe.
    pub(crate) async fn recv(&mut self) -> Result<Option<WireReply>> {
        match self.replies.next_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }

    /// Kill the worker's process group and reap the child. Idempotent.
    pub(crate) async fn shutdown(&mut self) {
        let _ = killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
        let _ = self.child.kill().await;
    }
}

async fn drain_stderr(stderr: ChildStderr) -> String {
    let mut buf = String::new();
    let mut reader = BufReader::new(stderr);
    let _ = time::timeout(Duration::from_millis(200), reader.read_to_string(&mut buf)).await;
    buf.trim().to_string()
}
