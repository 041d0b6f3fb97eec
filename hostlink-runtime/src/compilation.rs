use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::info;

use hostlink_core::compilation::{CompilationState, Diagnostic};

/// Why the host cannot take store writes right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blackout {
    Compiling,
    StoreNotReady,
}

impl Blackout {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Compiling => "compiling",
            Self::StoreNotReady => "store_not_ready",
        }
    }
}

/// Shared view of compilation and store readiness. Capture and the poller
/// consult it before touching the store.
#[derive(Debug)]
pub struct CompilationTracker {
    state: Mutex<CompilationState>,
    store_ready: AtomicBool,
}

impl Default for CompilationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilationTracker {
    /// Starts blacked out until the store has been reached once.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CompilationState::default()),
            store_ready: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.start(Utc::now());
        info!("compilation_started");
    }

    pub fn finish(&self, diagnostics: &[Diagnostic]) -> CompilationState {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.finish(Utc::now(), diagnostics);
        info!(
            errors = state.error_count,
            warnings = state.warning_count,
            "compilation_finished"
        );
        state.clone()
    }

    pub fn snapshot(&self) -> CompilationState {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_compiling(&self) -> bool {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).is_compiling
    }

    /// Returns the previous readiness.
    pub fn set_store_ready(&self, ready: bool) -> bool {
        self.store_ready.swap(ready, Ordering::SeqCst)
    }

    pub fn store_ready(&self) -> bool {
        self.store_ready.load(Ordering::SeqCst)
    }

    pub fn blackout(&self) -> Option<Blackout> {
        if self.is_compiling() {
            Some(Blackout::Compiling)
        } else if !self.store_ready() {
            Some(Blackout::StoreNotReady)
        } else {
            None
        }
    }
}
