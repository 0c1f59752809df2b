use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::Result;

/// OS-level probe for the resident set size of a child process.
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// Current RSS of `pid` in bytes. Errors once the process is gone.
    async fn rss_bytes(&self, pid: u32) -> Result<u64>;
}

/// Reads `VmRSS` out of the process-information pseudo-filesystem.
pub struct ProcfsInspector;

#[async_trait]
impl ProcessInspector for ProcfsInspector {
    async fn rss_bytes(&self, pid: u32) -> Result<u64> {
        let status = tokio::fs::read_to_string(format!("/proc/{pid}/status")).await?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kib: u64 = rest
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidData, "malformed VmRSS line")
                    })?;
                return Ok(kib * 1024);
            }
        }
        // A kernel thread or a zombie has no VmRSS; treat it as unmeterable.
        Err(io::Error::new(io::ErrorKind::NotFound, "no VmRSS for process").into())
    }
}

/// Portable fallback: queries `ps` for the resident set size.
pub struct PsInspector;

#[async_trait]
impl ProcessInspector for PsInspector {
    async fn rss_bytes(&self, pid: u32) -> Result<u64> {
        let output = tokio::process::Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", "rss="])
            .output()
            .await?;
        if !output.status.success() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "process has exited").into());
        }
        let kib: u64 = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed ps output"))?;
        Ok(kib * 1024)
    }
}

/// The inspector native to this platform.
pub fn platform_inspector() -> Arc<dyn ProcessInspector> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcfsInspector)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(PsInspector)
    }
}

/// Per-execution metering task. Samples the worker's RSS on a fixed cadence
/// and fires `violation` once it observes a sample above the ceiling.
pub(crate) struct MemoryMonitor {
    handle: JoinHandle<()>,
    pub(crate) violation: oneshot::Receiver<u64>,
}

impl MemoryMonitor {
    pub(crate) fn spawn(
        inspector: Arc<dyn ProcessInspector>,
        pid: u32,
        limit: u64,
        every: Duration,
    ) -> Self {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match inspector.rss_bytes(pid).await {
                    Ok(rss) if rss > limit => {
                        debug!(pid, rss, limit, "memory ceiling exceeded");
                        let _ = tx.send(rss);
                        break;
                    }
                    Ok(_) => {}
                    // Process vanished; the reply path reports what happened.
                    Err(_) => break,
                }
            }
        });
        Self {
            handle,
            violation: rx,
        }
    }

    /// Stop sampling and join the task.
    pub(crate) async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inspector_meters_own_process() -> crate::Result<()> {
        let rss = platform_inspector().rss_bytes(std::process::id()).await?;
        assert!(rss > 0);
        Ok(())
    }

    #[tokio::test]
    async fn inspector_errors_for_dead_pid() {
        // Spawn and reap a short-lived child so its pid is no longer live.
        let mut child = tokio::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id().expect("child pid");
        child.wait().await.expect("wait");
        // The pid may be recycled in theory, but not within a test run.
        assert!(platform_inspector().rss_bytes(pid).await.is_err());
    }

    #[tokio::test]
    async fn monitor_fires_on_tiny_limit() {
        let monitor = MemoryMonitor::spawn(
            platform_inspector(),
            std::process::id(),
            1, // anything live is over this
            Duration::from_millis(10),
        );
        let rss = tokio::time::timeout(Duration::from_secs(1), monitor.violation)
            .await
            .expect("monitor should fire")
            .expect("sender kept alive until violation");
        assert!(rss > 1);
    }
}
