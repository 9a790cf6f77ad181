//! Write-back scheduler: a background thread that owns the flush cadence.
//!
//! Mutations call [`WriteBack::request_flush`]. The first request after a
//! flush arms a deadline `delay` in the future; requests that arrive while
//! a flush is pending are coalesced into it and do not move the deadline,
//! so a continuous stream of writes is still persisted at least once per
//! `delay`. A scheduled flush is never cancelled.
//!
//! Nobody awaits a scheduled flush, so its failures are logged, counted and
//! kept in [`WriteBackStats`] for the process health surface.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::engine::{Engine, FlushOutcome};
use crate::error::StoreError;

/// Something the scheduler can persist.
pub trait FlushTarget: Send + Sync + 'static {
    /// Persists the current state.
    fn flush(&self) -> Result<FlushOutcome, StoreError>;
}

impl FlushTarget for Engine {
    fn flush(&self) -> Result<FlushOutcome, StoreError> {
        Engine::flush(self)
    }
}

/// Counters describing the scheduler's history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBackStats {
    /// Flushes that wrote the image.
    pub flushes: u64,
    /// Flushes that failed.
    pub failures: u64,
    /// Message of the most recent failure, cleared by the next success.
    pub last_error: Option<String>,
}

enum Command {
    Request,
    FlushAndWait(Sender<Result<FlushOutcome, StoreError>>),
    Shutdown(Sender<Result<(), StoreError>>),
}

#[derive(Default)]
struct Shared {
    pending: AtomicBool,
    flushes: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn record(&self, result: &Result<FlushOutcome, StoreError>) {
        match result {
            Ok(FlushOutcome::Written { .. }) => {
                self.flushes.fetch_add(1, Ordering::SeqCst);
                *self.last_error.lock() = None;
            }
            Ok(_) => {}
            Err(e) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                *self.last_error.lock() = Some(e.to_string());
            }
        }
    }
}

/// Handle to the write-back thread.
pub struct WriteBack {
    tx: Mutex<Option<Sender<Command>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
    delay: Duration,
}

impl WriteBack {
    /// Starts the scheduler thread for `target`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Spawn` if the thread cannot be created.
    pub fn start<T: FlushTarget>(target: Arc<T>, delay: Duration) -> Result<Self, StoreError> {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared::default());

        let handle = thread::Builder::new()
            .name("tally-writeback".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || run(target.as_ref(), &rx, &shared, delay)
            })
            .map_err(StoreError::Spawn)?;

        tracing::debug!(delay_ms = delay.as_millis() as u64, "write-back scheduler started");

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            shared,
            delay,
        })
    }

    /// The debounce delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedules a flush unless one is already pending.
    pub fn request_flush(&self) {
        if self.shared.pending.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.send(Command::Request).is_err() {
            self.shared.pending.store(false, Ordering::SeqCst);
            tracing::warn!("write-back scheduler stopped, flush request dropped");
        }
    }

    /// Whether a flush is scheduled and has not run yet.
    pub fn is_pending(&self) -> bool {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Flushes on the scheduler thread now and waits for the result.
    ///
    /// Must not be called while the calling thread holds the engine lock;
    /// the scheduler thread would wait for it forever.
    ///
    /// # Errors
    ///
    /// Returns the flush error, or `StoreError::SchedulerStopped` if the
    /// thread is gone.
    pub fn flush_and_wait(&self) -> Result<FlushOutcome, StoreError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Command::FlushAndWait(reply_tx))?;
        reply_rx.recv().map_err(|_| StoreError::SchedulerStopped)?
    }

    /// Snapshot of the scheduler counters.
    pub fn stats(&self) -> WriteBackStats {
        WriteBackStats {
            flushes: self.shared.flushes.load(Ordering::SeqCst),
            failures: self.shared.failures.load(Ordering::SeqCst),
            last_error: self.shared.last_error.lock().clone(),
        }
    }

    /// Drains any pending flush, then stops and joins the thread.
    ///
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the error of the draining flush.
    pub fn shutdown(&self) -> Result<(), StoreError> {
        let Some(tx) = self.tx.lock().take() else {
            return Ok(());
        };

        let (reply_tx, reply_rx) = mpsc::channel();
        let result = match tx.send(Command::Shutdown(reply_tx)) {
            Ok(()) => reply_rx.recv().unwrap_or(Ok(())),
            Err(_) => Err(StoreError::SchedulerStopped),
        };
        drop(tx);

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("write-back thread panicked");
            }
        }

        result
    }

    fn send(&self, command: Command) -> Result<(), StoreError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(StoreError::SchedulerStopped)?;
        tx.send(command).map_err(|_| StoreError::SchedulerStopped)
    }
}

impl Drop for WriteBack {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("final write-back flush failed: {}", e);
        }
    }
}

fn run<T: FlushTarget + ?Sized>(
    target: &T,
    rx: &Receiver<Command>,
    shared: &Shared,
    delay: Duration,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => match rx.recv_timeout(at.saturating_duration_since(Instant::now())) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };

        match command {
            None => {
                deadline = None;
                if scheduled_flush(target, shared) == Some(FlushOutcome::Deferred) {
                    shared.pending.store(true, Ordering::SeqCst);
                    deadline = Some(Instant::now() + delay);
                }
            }
            Some(Command::Request) => {
                if deadline.is_none() {
                    deadline = Some(Instant::now() + delay);
                }
            }
            Some(Command::FlushAndWait(reply)) => {
                deadline = None;
                shared.pending.store(false, Ordering::SeqCst);
                let result = target.flush();
                shared.record(&result);
                if matches!(result, Ok(FlushOutcome::Deferred)) {
                    shared.pending.store(true, Ordering::SeqCst);
                    deadline = Some(Instant::now() + delay);
                }
                let _ = reply.send(result);
            }
            Some(Command::Shutdown(reply)) => {
                let result = if deadline.is_some() || shared.pending.load(Ordering::SeqCst) {
                    shared.pending.store(false, Ordering::SeqCst);
                    let result = target.flush();
                    shared.record(&result);
                    result.map(|_| ())
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
                break;
            }
        }
    }

    tracing::debug!("write-back scheduler stopped");
}

/// Runs a flush whose deadline elapsed. Failures are logged here because no
/// caller is waiting for them.
fn scheduled_flush<T: FlushTarget + ?Sized>(target: &T, shared: &Shared) -> Option<FlushOutcome> {
    shared.pending.store(false, Ordering::SeqCst);
    let result = target.flush();
    shared.record(&result);
    match result {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            tracing::error!("scheduled database flush failed: {}", e);
            None
        }
    }
}
