//! Strand: exclusive execution of named units of work against shared state.
//!
//! A single background task owns the state `S` and receives closures over a
//! bounded queue. Each closure runs to completion before the next one is
//! received, so at most one unit of work touches the state at a time and
//! callers never take a lock themselves.
//!
//! Operational trouble is surfaced as log events rather than errors:
//! - a caller that cannot enqueue for [`ENQUEUE_WARN_THRESHOLD`] logs a
//!   warning and keeps waiting;
//! - a unit still running after [`SLOW_OPERATION_WARN`] logs a warning, and
//!   again after each tenfold longer interval.
//!
//! Once shutdown is triggered, pending calls resolve to `Ok(None)`. A unit
//! of work that panics takes the owning task down with it; its caller and
//! every later one also get `Ok(None)`, and each logs an error saying the
//! strand died.
//!
//! The peer list in `cairn-network` serializes its own operations behind a
//! single lock. `Strand` is the general form, provided for services whose
//! state is touched from many tasks and whose operations may run long enough
//! to be worth instrumenting.

use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::shutdown::ShutdownListener;

/// Default depth of the request queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// How long a caller waits on a full queue before logging a warning.
pub const ENQUEUE_WARN_THRESHOLD: Duration = Duration::from_secs(3);

/// How long a unit of work may run before the first slow-operation warning.
pub const SLOW_OPERATION_WARN: Duration = Duration::from_millis(100);

/// Growth factor between consecutive slow-operation warnings.
const SLOW_OPERATION_BACKOFF: u32 = 10;

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

struct Request<S> {
    name: String,
    job: Job<S>,
}

/// Handle for submitting work to a strand. Cheap to clone.
pub struct Strand<S> {
    name: Arc<str>,
    tx: mpsc::Sender<Request<S>>,
    quit: ShutdownListener,
}

impl<S> Clone for Strand<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            quit: self.quit.clone(),
        }
    }
}

impl<S: Send + 'static> Strand<S> {
    /// Spawn the task that owns `state`. The returned handle yields the state
    /// back once the strand stops (on shutdown, or when every handle is dropped).
    pub fn spawn(
        name: impl Into<Arc<str>>,
        state: S,
        capacity: usize,
        quit: ShutdownListener,
    ) -> (Self, JoinHandle<S>) {
        let name = name.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let server = tokio::spawn(serve(name.clone(), state, rx, quit.clone()));
        (Self { name, tx, quit }, server)
    }

    /// Run `f` against the shared state and return its result.
    ///
    /// Returns `Ok(None)` if the strand is shutting down before `f` ran.
    /// An error from `f` is logged by the strand and then returned here, so
    /// callers need not log it again.
    pub async fn call<T, E, F>(&self, op: &str, f: F) -> Result<Option<T>, E>
    where
        F: FnOnce(&mut S) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let strand = self.name.clone();
        let op_name = op.to_string();
        let job: Job<S> = Box::new(move |state: &mut S| {
            let result = f(state);
            if let Err(e) = &result {
                tracing::error!(strand = %strand, op = %op_name, error = %e, "strand operation failed");
            }
            let _ = result_tx.send(result);
        });
        let request = Request {
            name: op.to_string(),
            job,
        };

        let mut quit = self.quit.clone();
        let started = Instant::now();
        let permit = loop {
            tokio::select! {
                biased;
                _ = quit.wait() => return Ok(None),
                reserved = tokio::time::timeout(ENQUEUE_WARN_THRESHOLD, self.tx.reserve()) => {
                    match reserved {
                        Ok(Ok(permit)) => break permit,
                        Ok(Err(_)) => {
                            self.report_dead(op);
                            return Ok(None);
                        }
                        Err(_) => tracing::warn!(
                            strand = %self.name,
                            op,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "strand queue full, still waiting to enqueue"
                        ),
                    }
                }
            }
        };
        permit.send(request);

        match result_rx.await {
            Ok(result) => result.map(Some),
            // The strand stopped with this request still queued, or the
            // unit of work panicked.
            Err(_) => {
                self.report_dead(op);
                Ok(None)
            }
        }
    }

    /// The owning task is gone. Without a shutdown this means a unit of
    /// work panicked.
    fn report_dead(&self, op: &str) {
        if !self.quit.is_shutdown() {
            tracing::error!(
                strand = %self.name,
                op,
                "strand task died without a shutdown, a unit of work panicked"
            );
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the owning task has stopped accepting work.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn serve<S: Send + 'static>(
    name: Arc<str>,
    mut state: S,
    mut rx: mpsc::Receiver<Request<S>>,
    mut quit: ShutdownListener,
) -> S {
    let watcher_quit = quit.clone();
    loop {
        tokio::select! {
            biased;
            _ = quit.wait() => break,
            request = rx.recv() => match request {
                Some(request) => execute(&name, &mut state, request, &watcher_quit),
                None => break,
            },
        }
    }
    tracing::debug!(strand = %name, "strand stopped");
    state
}

fn execute<S>(name: &Arc<str>, state: &mut S, request: Request<S>, quit: &ShutdownListener) {
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(watch_slow(
        name.clone(),
        request.name,
        done_rx,
        quit.clone(),
    ));
    (request.job)(state);
    let _ = done_tx.send(());
}

async fn watch_slow(
    strand: Arc<str>,
    op: String,
    mut done: oneshot::Receiver<()>,
    mut quit: ShutdownListener,
) {
    let started = Instant::now();
    let mut threshold = SLOW_OPERATION_WARN;
    loop {
        tokio::select! {
            _ = &mut done => return,
            _ = quit.wait() => return,
            _ = tokio::time::sleep_until((started + threshold).into()) => {
                tracing::warn!(
                    strand = %strand,
                    op = %op,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "strand operation is taking a long time"
                );
                threshold = threshold.saturating_mul(SLOW_OPERATION_BACKOFF);
            }
        }
    }
}
