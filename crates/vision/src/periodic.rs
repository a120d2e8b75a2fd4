//! Fixed-cadence execution on a dedicated worker thread.

use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, warn};

use crate::pipeline::telemetry;

/// Upper bound on how long [`PeriodicTask::stop`] waits for the worker.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

type Body = Box<dyn FnMut() + Send>;

/// Runs a callback every `interval` on its own thread until stopped.
///
/// The callback runs first immediately after [`start`](Self::start), then the
/// worker waits up to `interval` on the cancel channel before the next
/// iteration. Iterations never overlap, even across a restart whose previous
/// worker has not finished yet.
///
/// A panic in the callback ends the worker (logged at error level) and the task
/// reports idle; calling `start` again restarts it.
pub struct PeriodicTask {
    name: String,
    interval: Duration,
    stop_timeout: Duration,
    body: Arc<Mutex<Body>>,
    worker: Mutex<Option<Worker>>,
}

struct Worker {
    cancel: Sender<()>,
    done: Receiver<()>,
    alive: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl PeriodicTask {
    pub fn new<F>(name: impl Into<String>, interval: Duration, body: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            body: Arc::new(Mutex::new(Box::new(body))),
            worker: Mutex::new(None),
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|worker| worker.alive.load(Ordering::SeqCst))
    }

    /// Spawn the worker thread. A no-op when already running.
    pub fn start(&self) -> io::Result<()> {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = slot.as_ref() {
            if worker.alive.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
        // A worker that died on a panic is already on its way out.
        if let Some(stale) = slot.take() {
            drop(stale.cancel);
            if stale.handle.is_finished() {
                let _ = stale.handle.join();
            }
        }

        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let alive = Arc::new(AtomicBool::new(true));

        let name = self.name.clone();
        let interval = self.interval;
        let body = self.body.clone();
        let worker_alive = alive.clone();
        let handle = telemetry::spawn_thread(self.name.clone(), move || {
            let _done = done_tx;
            run_worker(&name, interval, &body, &cancel_rx);
            worker_alive.store(false, Ordering::SeqCst);
        });
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                alive.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        debug!(task = %self.name, interval_ms = self.interval.as_millis() as u64, "periodic task started");
        *slot = Some(Worker {
            cancel: cancel_tx,
            done: done_rx,
            alive,
            handle,
        });
        Ok(())
    }

    /// Signal cancellation and wait (bounded) for the worker to exit.
    ///
    /// A no-op on an idle task. Concurrent callers all wait on the same
    /// worker. When the worker does not exit within the stop timeout it is
    /// detached with a warning.
    pub fn stop(&self) {
        let (done, alive, own_thread) = {
            let slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(worker) = slot.as_ref() else {
                return;
            };
            let _ = worker.cancel.try_send(());
            (
                worker.done.clone(),
                worker.alive.clone(),
                worker.handle.thread().id() == thread::current().id(),
            )
        };

        if own_thread {
            // Stopped from inside its own iteration; the loop exits after this body returns.
            self.retire(&alive);
            return;
        }

        match done.recv_timeout(self.stop_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                if self.retire(&alive).is_some() {
                    warn!(
                        task = %self.name,
                        timeout_ms = self.stop_timeout.as_millis() as u64,
                        "periodic task did not stop in time; detaching worker"
                    );
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(worker) = self.retire(&alive) {
                    if worker.handle.join().is_err() {
                        warn!(task = %self.name, "periodic worker terminated abnormally");
                    }
                    debug!(task = %self.name, "periodic task stopped");
                }
            }
        }
    }

    /// Take the worker out of the slot if it is still the one identified by
    /// `alive`. Only one stopper gets it back.
    fn retire(&self, alive: &Arc<AtomicBool>) -> Option<Worker> {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot
            .as_ref()
            .is_some_and(|worker| Arc::ptr_eq(&worker.alive, alive))
        {
            slot.take()
        } else {
            None
        }
    }

    /// [`stop`](Self::stop) for callers running on a tokio runtime.
    ///
    /// The blocking join runs on the runtime's blocking pool.
    pub async fn stop_async(self: Arc<Self>) {
        let name = self.name.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || self.stop()).await {
            warn!(task = %name, "async stop failed: {err}");
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(name: &str, interval: Duration, body: &Mutex<Body>, cancel: &Receiver<()>) {
    loop {
        let outcome = {
            let mut body = body.lock().unwrap_or_else(PoisonError::into_inner);
            panic::catch_unwind(AssertUnwindSafe(|| (*body)()))
        };
        if let Err(payload) = outcome {
            error!(task = %name, "periodic task iteration panicked: {}", panic_message(&*payload));
            metrics::counter!("periodic_task_panics_total", "task" => name.to_owned()).increment(1);
            return;
        }

        match cancel.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
