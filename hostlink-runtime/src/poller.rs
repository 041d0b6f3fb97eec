//! Background poller: finds Pending work and queues it on the main context.
//!
//! The poller never executes anything itself. Each tick looks at the store,
//! and for every kind with Pending rows (or an outcome still to be written)
//! that is not already in flight it dispatches one job that claims and runs
//! requests of that kind.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use hostlink_core::error::HostlinkError;
use hostlink_store::CoordinationStore;

use crate::compilation::{Blackout, CompilationTracker};
use crate::dispatch::MainContextHandle;
use crate::machine::RequestStateMachine;

/// Requests one dispatched job may run before yielding back to the poller.
const MAX_BATCH: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: Vec<String>,
    pub skipped: Option<Blackout>,
}

pub struct Poller {
    inner: Arc<PollerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct PollerInner {
    store: CoordinationStore,
    machine: Arc<RequestStateMachine>,
    main: MainContextHandle,
    tracker: Arc<CompilationTracker>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    interval: Duration,
}

/// Clears a kind's in-flight flag when the dispatched job ends or is dropped
/// without running.
struct InFlightGuard {
    kind: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl InFlightGuard {
    fn acquire(in_flight: &Arc<Mutex<HashSet<String>>>, kind: &str) -> Option<Self> {
        let mut set = in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(kind.to_string()) {
            return None;
        }
        Some(Self {
            kind: kind.to_string(),
            in_flight: Arc::clone(in_flight),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.kind);
    }
}

impl Poller {
    pub fn new(
        store: CoordinationStore,
        machine: Arc<RequestStateMachine>,
        main: MainContextHandle,
        tracker: Arc<CompilationTracker>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                store,
                machine,
                main,
                tracker,
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                interval,
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the timer. The first tick fires immediately, so anything that
    /// became Pending while the poller was down is picked up at once.
    pub fn arm(&self) {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = task.take() {
            existing.abort();
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = inner.tick().await {
                    warn!(error = %err, "poller_tick_failed");
                }
            }
        }));
        info!(interval_ms = self.inner.interval.as_millis() as u64, "poller_armed");
    }

    pub fn disarm(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
            info!("poller_disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub async fn tick(&self) -> Result<TickReport, HostlinkError> {
        self.inner.tick().await
    }

    pub fn in_flight(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl PollerInner {
    async fn tick(&self) -> Result<TickReport, HostlinkError> {
        if let Some(blackout) = self.tracker.blackout() {
            debug!(reason = blackout.label(), "poller_tick_skipped");
            return Ok(TickReport {
                dispatched: Vec::new(),
                skipped: Some(blackout),
            });
        }

        let mut kinds = self.store.pending_kinds().await?;
        for kind in self.machine.unfinished_kinds() {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }

        let mut report = TickReport::default();
        for kind in kinds {
            let Some(guard) = InFlightGuard::acquire(&self.in_flight, &kind) else {
                continue;
            };
            let machine = Arc::clone(&self.machine);
            let tracker = Arc::clone(&self.tracker);
            let job_kind = kind.clone();
            self.main.dispatch(async move {
                let _guard = guard;
                for _ in 0..MAX_BATCH {
                    if let Some(blackout) = tracker.blackout() {
                        debug!(kind = %job_kind, reason = blackout.label(), "dispatch_deferred");
                        break;
                    }
                    match machine.run_next(&job_kind).await {
                        Ok(Some(_)) => continue,
                        Ok(None) => break,
                        Err(err) => {
                            warn!(kind = %job_kind, error = %err, "request_run_failed");
                            break;
                        }
                    }
                }
            })?;
            debug!(kind = %kind, "request_kind_dispatched");
            report.dispatched.push(kind);
        }
        Ok(report)
    }
}
