use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::Duration;

use futures::FutureExt;
use tracing::{error, info, warn};

use hostlink_core::error::{HostlinkError, RequestError};
use hostlink_core::request::{CoordinationRequest, RequestFinish, RequestId, RequestSnapshot};
use hostlink_store::CoordinationStore;

use crate::capture::LogCapture;
use crate::handler::{HandlerOutcome, HandlerRegistry};

/// How hard `run_next` tries to write a terminal state before giving up
/// until the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishRetry {
    pub attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub backoff: Duration,
}

impl Default for FinishRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Claims, executes and finishes requests. Runs on the main context.
pub struct RequestStateMachine {
    store: CoordinationStore,
    handlers: Arc<HandlerRegistry>,
    capture: Option<Arc<LogCapture>>,
    finish_retry: FinishRetry,
    /// Outcomes whose terminal write failed, by kind. Written again before
    /// anything else of that kind is claimed.
    unfinished: Mutex<HashMap<String, (RequestId, RequestFinish)>>,
}

impl RequestStateMachine {
    pub fn new(store: CoordinationStore, handlers: Arc<HandlerRegistry>) -> Self {
        install_panic_hook();
        Self {
            store,
            handlers,
            capture: None,
            finish_retry: FinishRetry::default(),
            unfinished: Mutex::new(HashMap::new()),
        }
    }

    /// Tag log entries emitted while a request runs with its id.
    pub fn with_capture(mut self, capture: Arc<LogCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_finish_retry(mut self, retry: FinishRetry) -> Self {
        self.finish_retry = retry;
        self
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Kinds holding an outcome that still has to be written.
    pub fn unfinished_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.unfinished().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    fn unfinished(&self) -> MutexGuard<'_, HashMap<String, (RequestId, RequestFinish)>> {
        self.unfinished.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claim the next Pending request of `kind` and run it to a terminal
    /// state. Returns `None` when there was nothing to claim.
    ///
    /// An outcome left over from a failed terminal write is written first;
    /// nothing new is claimed for the kind until that succeeds.
    pub async fn run_next(&self, kind: &str) -> Result<Option<RequestSnapshot>, HostlinkError> {
        let leftover = self.unfinished().remove(kind);
        if let Some((id, finish)) = leftover {
            info!(request_id = id, kind, "request_finish_resumed");
            return self.finish(kind, id, finish).await.map(Some);
        }

        let Some(request) = self.store.claim_next(kind).await? else {
            return Ok(None);
        };

        if let Some(capture) = &self.capture {
            capture.set_running_request(Some(request.id));
        }
        let finish = self.execute(&request).await;
        if let Some(capture) = &self.capture {
            capture.set_running_request(None);
        }

        self.finish(kind, request.id, finish).await.map(Some)
    }

    /// Write the terminal state, retrying infra failures with backoff. When
    /// every attempt fails the outcome is kept for the next `run_next`.
    async fn finish(
        &self,
        kind: &str,
        id: RequestId,
        finish: RequestFinish,
    ) -> Result<RequestSnapshot, HostlinkError> {
        let attempts = self.finish_retry.attempts.max(1);
        let mut delay = self.finish_retry.backoff;
        let mut attempt = 1;
        loop {
            match self.store.finish(id, finish.clone()).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(err @ HostlinkError::Infra(_)) if attempt < attempts => {
                    warn!(request_id = id, attempt, error = %err, "request_finish_retry");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(err @ HostlinkError::Infra(_)) => {
                    error!(request_id = id, attempts, error = %err, "request_finish_failed");
                    self.unfinished().insert(kind.to_string(), (id, finish));
                    return Err(err);
                }
                Err(err) => {
                    error!(request_id = id, error = %err, "request_finish_rejected");
                    return Err(err);
                }
            }
        }
    }

    async fn execute(&self, request: &CoordinationRequest) -> RequestFinish {
        let Some(handler) = self.handlers.get(&request.kind) else {
            let err = RequestError::UnknownKind(request.kind.clone());
            warn!(request_id = request.id, kind = %request.kind, "request_kind_unhandled");
            return RequestFinish::failed(err.to_string(), None);
        };

        // Drop anything left by a panic caught outside the machine.
        take_panic_stack();
        match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
            Ok(Ok(HandlerOutcome::Completed { summary, data })) => {
                RequestFinish::completed(summary, data)
            }
            Ok(Ok(HandlerOutcome::Inconclusive(reason))) => {
                info!(request_id = request.id, reason = %reason, "request_inconclusive");
                RequestFinish::inconclusive(reason)
            }
            Ok(Err(err)) => {
                warn!(request_id = request.id, error = %format!("{err:#}"), "request_handler_failed");
                RequestFinish::failed(format!("{err:#}"), Some(error_stack(&err)))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(request_id = request.id, panic = %message, "request_handler_panicked");
                RequestFinish::failed(format!("handler panicked: {message}"), take_panic_stack())
            }
        }
    }
}

thread_local! {
    /// Stack recorded by the panic hook for the panic currently unwinding on
    /// this thread.
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook that records where a panic happened. The unwind is caught
/// on the thread that panicked, so the thread-local is read back there.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let mut stack = String::new();
            if let Some(location) = info.location() {
                let _ = writeln!(stack, "panicked at {location}");
            }
            let _ = write!(stack, "{}", Backtrace::force_capture());
            PANIC_STACK.with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    *slot = Some(stack.trim_end().to_string());
                }
            });
            previous(info);
        }));
    });
}

fn take_panic_stack() -> Option<String> {
    PANIC_STACK.with(|slot| slot.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
}

/// Cause chain, one frame per line, followed by a backtrace. anyhow only
/// captures one when `RUST_BACKTRACE` is set, so fall back to the frames
/// at the point the failure was observed.
fn error_stack(err: &anyhow::Error) -> String {
    let mut stack = String::new();
    for (depth, cause) in err.chain().enumerate() {
        let _ = writeln!(stack, "{depth}: {cause}");
    }
    if err.backtrace().status() == BacktraceStatus::Captured {
        let _ = write!(stack, "{}", err.backtrace());
    } else {
        let _ = write!(stack, "{}", Backtrace::force_capture());
    }
    stack.trim_end().to_string()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
