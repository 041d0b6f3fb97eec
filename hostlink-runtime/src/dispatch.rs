//! Marshalling work onto the host's main context.
//!
//! The host owns a [`MainContext`] and drives it from its main loop; any
//! thread can enqueue jobs through a cloned [`MainContextHandle`]. Jobs run
//! one at a time, in the order they were dispatched.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use hostlink_core::error::HostlinkError;

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct MainContext {
    tx: mpsc::UnboundedSender<Job>,
    rx: mpsc::UnboundedReceiver<Job>,
}

#[derive(Clone)]
pub struct MainContextHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MainContext {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn handle(&self) -> MainContextHandle {
        MainContextHandle {
            tx: self.tx.clone(),
        }
    }

    /// Run jobs until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!("main_context_running");
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                job = self.rx.recv() => {
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
            }
        }
        debug!("main_context_stopped");
    }

    /// Run every job queued right now, for hosts that drive the context from
    /// their own update loop. Returns how many jobs ran.
    pub async fn pump(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job.await;
            ran += 1;
        }
        ran
    }
}

impl MainContextHandle {
    /// Enqueue a job without waiting for it. Fails once the context is gone.
    pub fn dispatch<F>(&self, job: F) -> Result<(), HostlinkError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx
            .send(Box::pin(job))
            .map_err(|_| HostlinkError::Unavailable("main context has shut down".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn jobs_run_in_dispatch_order() {
        let mut context = MainContext::new();
        let handle = context.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let seen = Arc::clone(&seen);
            handle
                .dispatch(async move {
                    tokio::task::yield_now().await;
                    seen.lock().expect("lock").push(n);
                })
                .expect("dispatch");
        }
        assert_eq!(context.pump().await, 3);
        assert_eq!(*seen.lock().expect("lock"), vec![0, 1, 2]);
        assert_eq!(context.pump().await, 0);
    }

    #[tokio::test]
    async fn dispatch_fails_after_context_dropped() {
        let context = MainContext::new();
        let handle = context.handle();
        drop(context);
        let err = handle.dispatch(async {}).unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let context = MainContext::new();
        let handle = context.handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        handle
            .dispatch(async move {
                let _ = done_tx.send(());
            })
            .expect("dispatch");
        let task = tokio::spawn(context.run(shutdown_rx));
        done_rx.await.expect("job ran");
        shutdown_tx.send(true).expect("signal");
        task.await.expect("run exits");
    }
}
