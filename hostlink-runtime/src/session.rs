use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use hostlink_core::compilation::CompilationState;
use hostlink_core::config::SessionsConfig;
use hostlink_core::error::HostlinkError;
use hostlink_core::session::{Session, SessionStartReason};
use hostlink_store::CoordinationStore;

use crate::capture::LogCapture;

/// Opens and closes sessions in response to host lifecycle events.
pub struct SessionManager {
    store: CoordinationStore,
    capture: Arc<LogCapture>,
    config: SessionsConfig,
    current: Mutex<Option<Session>>,
    /// Last visible console count seen by the clear heuristic.
    observed: Mutex<Option<u64>>,
}

impl SessionManager {
    pub fn new(store: CoordinationStore, capture: Arc<LogCapture>, config: SessionsConfig) -> Self {
        Self {
            store,
            capture,
            config,
            current: Mutex::new(None),
            observed: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionsConfig {
        &self.config
    }

    pub fn current(&self) -> Option<Session> {
        self.current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Close the active session and open a new one. Capture switches to the
    /// new session before this returns.
    pub async fn start_session(&self, reason: SessionStartReason) -> Result<Session, HostlinkError> {
        let session = self.store.open_session(reason).await?;
        self.capture.begin_session(session.id);
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(session.clone());
        *self.observed.lock().unwrap_or_else(|p| p.into_inner()) = None;
        Ok(session)
    }

    /// A clean compile clears prior diagnostic history.
    pub async fn on_compile_finished(
        &self,
        state: &CompilationState,
    ) -> Result<Option<Session>, HostlinkError> {
        if !state.is_clean() {
            debug!(errors = state.error_count, "session_kept_after_failed_compile");
            return Ok(None);
        }
        self.start_session(SessionStartReason::CleanCompile)
            .await
            .map(Some)
    }

    pub async fn on_run_mode_changed(&self, entered: bool) -> Result<Option<Session>, HostlinkError> {
        if !entered || !self.config.new_session_on_run_mode {
            return Ok(None);
        }
        self.start_session(SessionStartReason::RunModeEntered)
            .await
            .map(Some)
    }

    pub async fn on_console_cleared(&self) -> Result<Session, HostlinkError> {
        self.start_session(SessionStartReason::ManualClear).await
    }

    pub async fn on_reload(&self) -> Result<Session, HostlinkError> {
        self.start_session(SessionStartReason::Reload).await
    }

    /// Feed the host's visible console count. A drop from a positive count to
    /// zero means something cleared the console without firing a hook.
    pub async fn observe_console_count(&self, count: u64) -> Result<Option<Session>, HostlinkError> {
        let previous = {
            let mut observed = self.observed.lock().unwrap_or_else(|p| p.into_inner());
            observed.replace(count)
        };
        match previous {
            Some(previous) if previous > 0 && count == 0 => {
                info!(previous, "external_clear_detected");
                self.start_session(SessionStartReason::ExternalClear)
                    .await
                    .map(Some)
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_core::compilation::Diagnostic;
    use hostlink_core::config::CaptureConfig;
    use hostlink_store::SideChannel;

    use crate::compilation::CompilationTracker;

    async fn manager(run_mode: bool) -> (tempfile::TempDir, CoordinationStore, SessionManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CoordinationStore::in_memory().await.expect("store");
        let tracker = Arc::new(CompilationTracker::new());
        tracker.set_store_ready(true);
        let capture = Arc::new(LogCapture::new(
            &CaptureConfig::default(),
            store.clone(),
            Arc::new(SideChannel::new(dir.path().join("side_channel.jsonl"))),
            tracker,
        ));
        let config = SessionsConfig {
            new_session_on_run_mode: run_mode,
            ..SessionsConfig::default()
        };
        let manager = SessionManager::new(store.clone(), capture, config);
        (dir, store, manager)
    }

    #[tokio::test]
    async fn failed_compile_keeps_session() {
        let (_dir, _store, manager) = manager(false).await;
        let first = manager
            .start_session(SessionStartReason::HostStart)
            .await
            .expect("start");

        let mut failed = CompilationState::default();
        failed.finish(chrono::Utc::now(), &[Diagnostic::error("broken")]);
        assert!(manager.on_compile_finished(&failed).await.expect("hook").is_none());
        assert_eq!(manager.current().map(|s| s.id), Some(first.id));

        let clean = CompilationState::default();
        let next = manager
            .on_compile_finished(&clean)
            .await
            .expect("hook")
            .expect("new session");
        assert_eq!(next.start_reason, SessionStartReason::CleanCompile);
        assert_ne!(next.id, first.id);
    }

    #[tokio::test]
    async fn run_mode_session_is_opt_in() {
        let (_dir, _store, off) = manager(false).await;
        assert!(off.on_run_mode_changed(true).await.expect("hook").is_none());

        let (_dir, _store, on) = manager(true).await;
        assert!(on.on_run_mode_changed(false).await.expect("hook").is_none());
        let session = on
            .on_run_mode_changed(true)
            .await
            .expect("hook")
            .expect("session");
        assert_eq!(session.start_reason, SessionStartReason::RunModeEntered);
    }

    #[tokio::test]
    async fn counter_drop_to_zero_starts_external_clear() {
        let (_dir, store, manager) = manager(false).await;
        let first = manager
            .start_session(SessionStartReason::HostStart)
            .await
            .expect("start");

        // The first observation only sets a baseline.
        assert!(manager.observe_console_count(0).await.expect("observe").is_none());
        assert!(manager.observe_console_count(120).await.expect("observe").is_none());
        let cleared = manager
            .observe_console_count(0)
            .await
            .expect("observe")
            .expect("session");
        assert_eq!(cleared.start_reason, SessionStartReason::ExternalClear);
        assert!(manager.observe_console_count(0).await.expect("observe").is_none());

        let closed = store
            .get_session(first.id)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(closed.end_time, Some(cleared.start_time));
    }

    #[tokio::test]
    async fn hook_resets_clear_heuristic() {
        let (_dir, _store, manager) = manager(false).await;
        manager
            .start_session(SessionStartReason::HostStart)
            .await
            .expect("start");
        manager.observe_console_count(40).await.expect("observe");
        manager.on_console_cleared().await.expect("clear");
        assert!(manager.observe_console_count(0).await.expect("observe").is_none());
    }
}
