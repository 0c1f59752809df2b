use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::warn;

use crate::meter::{MemoryMonitor, ProcessInspector};
use crate::types::{ErrorKind, Limits, SessionId};
use crate::worker::{WireReply, Worker};

const STATE_IDLE: u8 = 0;
const STATE_BUSY: u8 = 1;
const STATE_DEAD: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    Busy,
    Dead,
}

/// What one submission produced. `Fatal` outcomes mean the worker was killed
/// and the session must leave the registry before anyone else can see it.
pub(crate) enum SubmitOutcome {
    Reply {
        stdout: Option<String>,
        stderr: Option<String>,
    },
    Fatal(ErrorKind),
}

/// One live interpreter session. The worker handle sits behind an async
/// mutex which doubles as the single-flight lock: overlapping submissions on
/// the same id queue up behind it.
pub(crate) struct Session {
    id: SessionId,
    worker: Mutex<Worker>,
    state: AtomicU8,
    /// Milliseconds since `epoch`; monotonic, updated when a submission starts.
    last_active: AtomicU64,
    epoch: Instant,
    limits: Limits,
    inspector: Arc<dyn ProcessInspector>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        worker: Worker,
        limits: Limits,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Self {
        Self {
            id,
            worker: Mutex::new(worker),
            state: AtomicU8::new(STATE_IDLE),
            last_active: AtomicU64::new(0),
            epoch: Instant::now(),
            limits,
            inspector,
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            STATE_BUSY => SessionState::Busy,
            STATE_DEAD => SessionState::Dead,
            _ => SessionState::Idle,
        }
    }

    fn set_state(&self, state: SessionState) {
        let raw = match state {
            SessionState::Idle => STATE_IDLE,
            SessionState::Busy => STATE_BUSY,
            SessionState::Dead => STATE_DEAD,
        };
        self.state.store(raw, Ordering::SeqCst);
    }

    pub(crate) fn last_active_ms(&self) -> u64 {
        self.last_active.load(Ordering::SeqCst)
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now_ms.saturating_sub(self.last_active_ms()))
    }

    fn touch(&self) {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.last_active.fetch_max(now_ms, Ordering::SeqCst);
    }

    /// Run one code fragment to completion under the wall-clock and memory
    /// budgets. Holds the per-session lock for the whole execution.
    pub(crate) async fn submit(&self, code: &str) -> SubmitOutcome {
        let mut worker = self.worker.lock().await;
        self.set_state(SessionState::Busy);
        self.touch();

        if let Err(e) = worker.send(code).await {
            warn!(session = %self.id, error = %e, "worker rejected submission");
            return self.fail(&mut worker, ErrorKind::ExecutionTimeout).await;
        }

        let mut monitor = MemoryMonitor::spawn(
            self.inspector.clone(),
            worker.pid(),
            self.limits.memory_limit,
            self.limits.poll_interval,
        );

        enum Event {
            Reply(crate::Result<Option<WireReply>>),
            OverLimit,
            TimedOut,
        }

        // Biased: a limit violation observed in the same wake-up as a reply
        // wins, and timeout loses to both.
        let event = tokio::select! {
            biased;
            Ok(_) = &mut monitor.violation => Event::OverLimit,
            reply = worker.recv() => Event::Reply(reply),
            _ = time::sleep(self.limits.exec_timeout) => Event::TimedOut,
        };

        let outcome = match event {
            Event::OverLimit => self.fail(&mut worker, ErrorKind::MemoryLimitExceeded).await,
            Event::TimedOut => self.fail(&mut worker, ErrorKind::ExecutionTimeout).await,
            Event::Reply(Ok(Some(reply))) => {
                // The allocation may still be resident when the reply lands
                // inside one poll window; one final sample settles the race.
                if self.over_limit(worker.pid()).await {
                    self.fail(&mut worker, ErrorKind::MemoryLimitExceeded).await
                } else {
                    self.set_state(SessionState::Idle);
                    SubmitOutcome::Reply {
                        stdout: reply.stdout,
                        stderr: reply.stderr,
                    }
                }
            }
            Event::Reply(Ok(None)) => {
                // Indistinguishable from a hang at this layer.
                warn!(session = %self.id, "worker exited mid-execution");
                self.fail(&mut worker, ErrorKind::ExecutionTimeout).await
            }
            Event::Reply(Err(e)) => {
                warn!(session = %self.id, error = %e, "worker reply unreadable");
                self.fail(&mut worker, ErrorKind::ExecutionTimeout).await
            }
        };

        monitor.stop().await;
        outcome
    }

    /// Kill the worker and terminate the session (eviction or shutdown).
    pub(crate) async fn teardown(&self) {
        let mut worker = self.worker.lock().await;
        self.set_state(SessionState::Dead);
        worker.shutdown().await;
    }

    async fn fail(&self, worker: &mut Worker, kind: ErrorKind) -> SubmitOutcome {
        self.set_state(SessionState::Dead);
        worker.shutdown().await;
        SubmitOutcome::Fatal(kind)
    }

    async fn over_limit(&self, pid: u32) -> bool {
        match self.inspector.rss_bytes(pid).await {
            Ok(rss) => rss > self.limits.memory_limit,
            Err(_) => false,
        }
    }
}
