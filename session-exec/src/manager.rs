use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};

use crate::meter::{platform_inspector, ProcessInspector};
use crate::session::{Session, SubmitOutcome};
use crate::types::{ErrorKind, Limits, Outcome, SessionId};
use crate::worker::Worker;
use crate::{Error, Result};

/// Process-wide supervisor. Owns the registry of live sessions, the global
/// session cap and the background reaper; every execution is routed through
/// [`SessionManager::execute`].
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    limits: Limits,
    python: PathBuf,
    inspector: Arc<dyn ProcessInspector>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub async fn new(limits: Limits) -> Result<Arc<Self>> {
        Self::with_inspector(limits, platform_inspector()).await
    }

    pub async fn with_inspector(
        limits: Limits,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Result<Arc<Self>> {
        let python = which::which("python3")?;
        let manager = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            limits: limits.clone(),
            python,
            inspector,
            reaper: Mutex::new(None),
        });
        let handle = tokio::spawn(reap_loop(Arc::downgrade(&manager), limits.reap_interval));
        *manager.reaper.lock().await = Some(handle);
        Ok(manager)
    }

    /// Route one execution: create-or-lookup the session, dispatch, render
    /// the outcome. Never fails; internal faults degrade to domain outcomes.
    pub async fn execute(&self, session_id: Option<&str>, code: &str) -> Outcome {
        match session_id {
            Some(raw) => {
                let session = match raw.parse::<SessionId>() {
                    Ok(id) => self.sessions.lock().await.get(&id).cloned(),
                    Err(_) => None,
                };
                match session {
                    Some(session) => self.dispatch(session, code).await,
                    None => Outcome::failure(raw, ErrorKind::SessionNotFound),
                }
            }
            None => match self.create_session().await {
                Ok(session) => self.dispatch(session, code).await,
                Err(e) => {
                    if !matches!(e, Error::Capacity) {
                        error!(error = %e, "session creation failed");
                    }
                    // The fresh id is informational; no session is retained.
                    Outcome::failure(SessionId::new().to_string(), ErrorKind::MaxSessionsReached)
                }
            },
        }
    }

    /// Registry cardinality.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Evict every session whose idle time has crossed the threshold.
    /// Snapshot-then-verify: sessions touched between the snapshot and the
    /// removal pass are spared. Returns the number evicted.
    pub async fn reap_idle(&self) -> usize {
        let snapshot: Vec<(SessionId, u64, Duration)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(id, s)| (*id, s.last_active_ms(), s.idle_for()))
                .collect()
        };

        let expired = snapshot
            .into_iter()
            .filter(|(_, _, idle)| *idle >= self.limits.idle_timeout);

        let victims: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            let mut victims = Vec::new();
            for (id, seen_ms, _) in expired {
                let untouched = sessions
                    .get(&id)
                    .map(|s| s.last_active_ms() == seen_ms)
                    .unwrap_or(false);
                if untouched {
                    if let Some(session) = sessions.remove(&id) {
                        victims.push(session);
                    }
                }
            }
            victims
        };

        // Teardown happens outside the registry lock.
        for session in &victims {
            info!(session = %session.id(), "session reaped after idle timeout");
            session.teardown().await;
        }
        victims.len()
    }

    /// Terminate every worker and clear the registry. Called at shutdown.
    pub async fn close_all(&self) {
        if let Some(handle) = self.reaper.lock().await.take() {
            handle.abort();
        }
        let victims: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in &victims {
            session.teardown().await;
        }
        info!(closed = victims.len(), "all sessions closed");
    }

    async fn create_session(&self) -> Result<Arc<Session>> {
        // Capacity check and insertion resolve under one lock acquisition so
        // concurrent creations cannot overshoot the cap.
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.limits.max_sessions {
            return Err(Error::Capacity);
        }
        let worker = Worker::spawn(&self.python).await?;
        let id = SessionId::new();
        let session = Arc::new(Session::new(
            id,
            worker,
            self.limits.clone(),
            self.inspector.clone(),
        ));
        sessions.insert(id, session.clone());
        info!(session = %id, live = sessions.len(), "session created");
        Ok(session)
    }

    async fn dispatch(&self, session: Arc<Session>, code: &str) -> Outcome {
        let id = session.id();
        debug!(session = %id, state = ?session.state(), "dispatching execution");
        match session.submit(code).await {
            SubmitOutcome::Reply { stdout, stderr } => Outcome::success(id, stdout, stderr),
            SubmitOutcome::Fatal(kind) => {
                // The worker is already dead; release the registry slot
                // before anyone else can observe the session.
                self.sessions.lock().await.remove(&id);
                info!(session = %id, error = %kind, "session destroyed by limit");
                Outcome::failure(id.to_string(), kind)
            }
        }
    }
}

async fn reap_loop(manager: Weak<SessionManager>, every: Duration) {
    loop {
        time::sleep(every).await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        let reaped = manager.reap_idle().await;
        if reaped > 0 {
            debug!(reaped, "idle sessions evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_limits() -> Limits {
        Limits {
            max_sessions: 3,
            exec_timeout: Duration::from_millis(800),
            poll_interval: Duration::from_millis(25),
            // Long cadence; tests drive reaping by hand.
            reap_interval: Duration::from_secs(3600),
            ..Limits::default()
        }
    }

    async fn test_manager(limits: Limits) -> Arc<SessionManager> {
        SessionManager::new(limits).await.expect("manager builds")
    }

    #[tokio::test]
    async fn unknown_id_is_echoed_back() {
        let manager = test_manager(test_limits()).await;
        let ghost = "00000000-0000-0000-0000-000000000000";
        let outcome = manager.execute(Some(ghost), "x = 1").await;
        assert_eq!(outcome.error, Some(ErrorKind::SessionNotFound));
        assert_eq!(outcome.id, ghost);
        assert_eq!(manager.session_count().await, 0);
        manager.close_all().await;
    }

    #[tokio::test]
    async fn malformed_id_is_treated_as_unknown() {
        let manager = test_manager(test_limits()).await;
        let outcome = manager.execute(Some("not-a-session"), "x = 1").await;
        assert_eq!(outcome.error, Some(ErrorKind::SessionNotFound));
        assert_eq!(outcome.id, "not-a-session");
        manager.close_all().await;
    }

    #[tokio::test]
    async fn capacity_is_a_hard_cap() {
        let limits = Limits {
            max_sessions: 2,
            ..test_limits()
        };
        let manager = test_manager(limits).await;

        let first = manager.execute(None, "x = 1").await;
        let second = manager.execute(None, "x = 2").await;
        assert!(!first.is_error());
        assert!(!second.is_error());

        let third = manager.execute(None, "x = 3").await;
        assert_eq!(third.error, Some(ErrorKind::MaxSessionsReached));
        // The refused request still carries an informational id.
        assert!(!third.id.is_empty());
        assert_eq!(manager.session_count().await, 2);
        manager.close_all().await;
    }

    #[tokio::test]
    async fn namespace_persists_within_a_session() {
        let manager = test_manager(test_limits()).await;
        let first = manager.execute(None, "x = 5").await;
        assert!(!first.is_error());

        let second = manager.execute(Some(&first.id), "print(x)").await;
        assert_eq!(second.stdout.as_deref(), Some("5\n"));
        assert_eq!(second.id, first.id);
        manager.close_all().await;
    }

    #[tokio::test]
    async fn sessions_are_isolated_from_each_other() {
        let manager = test_manager(test_limits()).await;
        let a = manager.execute(None, "secret = 'a'").await;
        let b = manager.execute(None, "print(secret)").await;
        assert_ne!(a.id, b.id);
        assert!(b.stderr.expect("NameError captured").contains("NameError"));
        manager.close_all().await;
    }

    #[tokio::test]
    async fn limit_violation_destroys_the_session() {
        let manager = test_manager(test_limits()).await;
        let created = manager.execute(None, "x = 1").await;
        assert!(!created.is_error());

        let timed_out = manager
            .execute(Some(&created.id), "while True: pass")
            .await;
        assert_eq!(timed_out.error, Some(ErrorKind::ExecutionTimeout));
        assert_eq!(timed_out.id, created.id);
        assert_eq!(manager.session_count().await, 0);

        // The id is gone for good.
        let after = manager.execute(Some(&created.id), "x = 1").await;
        assert_eq!(after.error, Some(ErrorKind::SessionNotFound));
        manager.close_all().await;
    }

    #[tokio::test]
    async fn reaper_evicts_only_idle_sessions() {
        let limits = Limits {
            idle_timeout: Duration::from_millis(400),
            ..test_limits()
        };
        let manager = test_manager(limits).await;

        let stale = manager.execute(None, "x = 1").await;
        time::sleep(Duration::from_millis(250)).await;
        let fresh = manager.execute(None, "y = 1").await;

        time::sleep(Duration::from_millis(250)).await;
        // `stale` has been quiet past the threshold, `fresh` has not.
        assert_eq!(manager.reap_idle().await, 1);
        assert_eq!(manager.session_count().await, 1);

        let gone = manager.execute(Some(&stale.id), "x").await;
        assert_eq!(gone.error, Some(ErrorKind::SessionNotFound));
        let alive = manager.execute(Some(&fresh.id), "print(y)").await;
        assert_eq!(alive.stdout.as_deref(), Some("1\n"));
        manager.close_all().await;
    }

    #[tokio::test]
    async fn close_all_empties_the_registry() {
        let manager = test_manager(test_limits()).await;
        manager.execute(None, "x = 1").await;
        manager.execute(None, "y = 1").await;
        assert_eq!(manager.session_count().await, 2);

        manager.close_all().await;
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_creations_respect_the_cap() {
        let limits = Limits {
            max_sessions: 2,
            ..test_limits()
        };
        let manager = test_manager(limits).await;

        let mut handles = vec![];
        for _ in 0..5 {
            let manager = manager.clone();
            handles.push(tokio::spawn(
                async move { manager.execute(None, "x = 1").await },
            ));
        }

        let mut refused = 0;
        for handle in handles {
            let outcome = handle.await.expect("task joins");
            if outcome.error == Some(ErrorKind::MaxSessionsReached) {
                refused += 1;
            }
        }
        assert_eq!(refused, 3);
        assert_eq!(manager.session_count().await, 2);
        manager.close_all().await;
    }
}
