pub mod defaults {
    use crate::{Limits, SessionManager};
    use std::sync::Arc;
    use std::time::Duration;

    pub fn default_test_limits() -> Limits {
        Limits {
            max_sessions: 4,
            exec_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(25),
            // Tests drive reaping by hand.
            reap_interval: Duration::from_secs(3600),
            ..Limits::default()
        }
    }

    pub async fn setup_test_manager() -> Arc<SessionManager> {
        SessionManager::new(default_test_limits())
            .await
            .expect("manager builds")
    }
}
