//! Composition root for the host side.
//!
//! `HostRuntime` wires store, capture, sessions, the state machine and the
//! poller together once, from one `HostlinkConfig`, and translates host
//! lifecycle events into calls on them. Nothing here is global: a host that
//! wants two runtimes builds two.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use hostlink_core::config::HostlinkConfig;
use hostlink_core::error::HostlinkError;
use hostlink_core::host::{ConsoleCounter, HostEvent, HostStatus};
use hostlink_core::session::{Session, SessionStartReason};
use hostlink_store::{CoordinationStore, SideChannel};

use crate::capture::{CaptureSlot, DrainReport, LogCapture};
use crate::compilation::CompilationTracker;
use crate::dispatch::MainContextHandle;
use crate::handler::{HandlerRegistry, RequestHandler};
use crate::machine::RequestStateMachine;
use crate::poller::Poller;
use crate::session::SessionManager;

pub struct HostRuntimeBuilder {
    config: HostlinkConfig,
    store: CoordinationStore,
    side_channel: Arc<SideChannel>,
    main: MainContextHandle,
    handlers: HandlerRegistry,
    console_counter: Option<Arc<dyn ConsoleCounter>>,
    capture_slot: Option<CaptureSlot>,
}

impl HostRuntimeBuilder {
    pub fn handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handlers.register(handler);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn console_counter(mut self, counter: Arc<dyn ConsoleCounter>) -> Self {
        self.console_counter = Some(counter);
        self
    }

    /// Attach the built capture to a `CaptureLayer` installed earlier.
    pub fn capture_slot(mut self, slot: CaptureSlot) -> Self {
        self.capture_slot = Some(slot);
        self
    }

    pub fn build(self) -> HostRuntime {
        let tracker = Arc::new(CompilationTracker::new());
        let capture = Arc::new(LogCapture::new(
            &self.config.capture,
            self.store.clone(),
            Arc::clone(&self.side_channel),
            Arc::clone(&tracker),
        ));
        if let Some(slot) = &self.capture_slot
            && !slot.attach(Arc::clone(&capture))
        {
            warn!("capture_slot_already_attached");
        }
        let sessions = Arc::new(SessionManager::new(
            self.store.clone(),
            Arc::clone(&capture),
            self.config.sessions.clone(),
        ));
        let machine = Arc::new(
            RequestStateMachine::new(self.store.clone(), Arc::new(self.handlers))
                .with_capture(Arc::clone(&capture)),
        );
        let poller = Poller::new(
            self.store.clone(),
            machine,
            self.main,
            Arc::clone(&tracker),
            self.config.poller.interval,
        );

        HostRuntime {
            shared: Arc::new(Shared {
                instance_id: self.config.global.instance_id.clone(),
                store: self.store,
                tracker,
                capture,
                sessions,
                in_run_mode: AtomicBool::new(false),
            }),
            poller,
            console_counter: self.console_counter,
            config: self.config,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// State shared with the background housekeeping tasks.
struct Shared {
    instance_id: String,
    store: CoordinationStore,
    tracker: Arc<CompilationTracker>,
    capture: Arc<LogCapture>,
    sessions: Arc<SessionManager>,
    in_run_mode: AtomicBool,
}

pub struct HostRuntime {
    shared: Arc<Shared>,
    poller: Poller,
    console_counter: Option<Arc<dyn ConsoleCounter>>,
    config: HostlinkConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HostRuntime {
    pub fn builder(
        config: HostlinkConfig,
        store: CoordinationStore,
        side_channel: Arc<SideChannel>,
        main: MainContextHandle,
    ) -> HostRuntimeBuilder {
        HostRuntimeBuilder {
            config,
            store,
            side_channel,
            main,
            handlers: HandlerRegistry::new(),
            console_counter: None,
            capture_slot: None,
        }
    }

    /// Bring the host side up: recover interrupted work, restore buffered
    /// logs, open a session, flush, publish status and arm the poller.
    pub async fn start(&self, reason: SessionStartReason) -> Result<Session, HostlinkError> {
        if let Err(err) = self.shared.store.ping().await {
            self.shared.tracker.set_store_ready(false);
            return Err(err);
        }
        self.shared.tracker.set_store_ready(true);

        self.shared.store.recover_interrupted().await?;
        if let Err(err) = self.shared.capture.rehydrate() {
            warn!(error = %err, "side_channel_rehydrate_failed");
        }
        let session = self.shared.sessions.start_session(reason).await?;
        self.shared.capture.drain().await?;
        self.shared.publish_status().await;
        self.poller.arm();
        self.spawn_background();

        info!(
            instance_id = %self.shared.instance_id,
            session_id = %session.id,
            "host_runtime_started"
        );
        Ok(session)
    }

    fn spawn_background(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }

        let shared = Arc::clone(&self.shared);
        let every = self.config.poller.interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                shared.housekeeping().await;
            }
        }));

        if let Some(counter) = self.console_counter.clone() {
            let sessions = Arc::clone(&self.shared.sessions);
            let every = self.config.sessions.clear_check_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(every);
                loop {
                    ticker.tick().await;
                    if let Err(err) = sessions.observe_console_count(counter.visible_count()).await {
                        warn!(error = %err, "console_clear_check_failed");
                    }
                }
            }));
        }
    }

    pub async fn handle_event(&self, event: HostEvent) -> Result<(), HostlinkError> {
        debug!(event = event.name(), "host_event");
        match event {
            HostEvent::CompileStarted => {
                self.shared.tracker.start();
                self.shared.publish_status().await;
            }
            HostEvent::CompileFinished { diagnostics } => {
                let state = self.shared.tracker.finish(&diagnostics);
                // Logs emitted during the compile belong to the session that
                // was active then, not the one a clean compile opens.
                self.shared.capture.drain().await?;
                self.shared.sessions.on_compile_finished(&state).await?;
                for diagnostic in &diagnostics {
                    self.shared.capture.record_diagnostic(diagnostic);
                }
                self.shared.capture.drain().await?;
                self.shared.publish_status().await;
            }
            HostEvent::LogEmitted(raw) => {
                self.shared.capture.record(raw);
            }
            HostEvent::RunModeChanged { entered } => {
                self.shared.in_run_mode.store(entered, Ordering::SeqCst);
                self.shared.sessions.on_run_mode_changed(entered).await?;
                self.shared.publish_status().await;
            }
            HostEvent::ConsoleCleared => {
                self.shared.sessions.on_console_cleared().await?;
                self.shared.publish_status().await;
            }
            HostEvent::Reloaded => {
                self.shared.sessions.on_reload().await?;
                self.shared.capture.drain().await?;
                self.poller.arm();
                self.shared.publish_status().await;
            }
        }
        Ok(())
    }

    /// Teardown ahead of a reload: stop polling and stage buffered logs in
    /// the side-channel. A `Reloaded` event re-arms.
    pub fn suspend(&self) -> Result<usize, HostlinkError> {
        self.poller.disarm();
        self.shared.capture.persist_buffer()
    }

    pub async fn shutdown(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            task.abort();
        }
        self.poller.disarm();
        if let Err(err) = self.shared.capture.drain().await {
            warn!(error = %err, "final_log_drain_failed");
        }
        if let Err(err) = self.shared.capture.persist_buffer() {
            warn!(error = %err, "log_buffer_persist_failed");
        }
        self.shared.publish_status().await;
        info!(instance_id = %self.shared.instance_id, "host_runtime_stopped");
    }

    pub async fn drain(&self) -> Result<DrainReport, HostlinkError> {
        self.shared.capture.drain().await
    }

    pub async fn publish_status(&self) {
        self.shared.publish_status().await;
    }

    pub fn status(&self) -> HostStatus {
        self.shared.status()
    }

    pub fn config(&self) -> &HostlinkConfig {
        &self.config
    }

    pub fn store(&self) -> &CoordinationStore {
        &self.shared.store
    }

    pub fn capture(&self) -> &Arc<LogCapture> {
        &self.shared.capture
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.shared.sessions
    }

    pub fn tracker(&self) -> &Arc<CompilationTracker> {
        &self.shared.tracker
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }
}

impl Shared {
    fn status(&self) -> HostStatus {
        HostStatus {
            instance_id: self.instance_id.clone(),
            compilation: self.tracker.snapshot(),
            in_run_mode: self.in_run_mode.load(Ordering::SeqCst),
            active_session: self.sessions.current().map(|session| session.id),
            heartbeat: Utc::now(),
        }
    }

    async fn publish_status(&self) {
        if !self.tracker.store_ready() {
            return;
        }
        if let Err(err) = self.store.record_host_status(&self.status()).await {
            warn!(error = %err, "host_status_publish_failed");
        }
    }

    /// Periodic store ping, log drain and heartbeat.
    async fn housekeeping(&self) {
        match self.store.ping().await {
            Ok(()) => {
                if !self.tracker.set_store_ready(true) {
                    info!("store_ready");
                }
            }
            Err(err) => {
                if self.tracker.set_store_ready(false) {
                    warn!(error = %err, "store_unavailable");
                }
                return;
            }
        }
        if let Err(err) = self.capture.drain().await {
            debug!(error = %err, "log_drain_failed");
        }
        self.publish_status().await;
    }
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}
