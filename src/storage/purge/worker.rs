use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::storage::engine::Engine;
use crate::storage::undo::HistoryQueue;

/// Background thread draining the history queue.
///
/// The thread holds only a weak reference to the engine and exits when the
/// engine is dropped, when stopped, or after a fatal purge error. It idles
/// while the queue is empty or nothing in it is eligible yet. Entries of a
/// batch interrupted by a stop are put back at the queue front.
pub struct PurgeWorker {
    shared: Arc<WorkerShared>,
    history: Arc<HistoryQueue>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct WorkerShared {
    stop: AtomicBool,
    parked: Mutex<()>,
    wakeup: Condvar,
}

impl WorkerShared {
    fn signal(&self) {
        self.stop.store(true, Ordering::Release);
        let _guard = self.parked.lock();
        self.wakeup.notify_all();
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl PurgeWorker {
    pub(crate) fn spawn(engine: &Arc<Engine>, idle: Duration) -> Self {
        let shared = Arc::new(WorkerShared::default());
        let weak = Arc::downgrade(engine);
        let thread_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || Self::worker_loop(weak, thread_shared, idle));
        debug!(idle_ms = idle.as_millis() as u64, "undo.purge.worker_start");
        Self {
            shared,
            history: Arc::clone(&engine.history),
            handle: Some(handle),
        }
    }

    fn worker_loop(engine: Weak<Engine>, shared: Arc<WorkerShared>, idle: Duration) {
        while !shared.stopped() {
            let Some(strong) = engine.upgrade() else {
                break;
            };
            let outcome = strong.purge_batch_until(&shared.stop);
            let history = Arc::clone(&strong.history);
            // The worker must not keep the engine alive while idle.
            drop(strong);
            match outcome {
                Ok(stats) if stats.records > 0 => continue,
                Ok(_) => {
                    if history.is_empty() {
                        history.wait_for_entries(idle);
                    } else {
                        // Entries exist but an open view still needs them.
                        let mut guard = shared.parked.lock();
                        if !shared.stopped() {
                            let _ = shared.wakeup.wait_for(&mut guard, idle);
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "undo.purge.worker_failed");
                    break;
                }
            }
        }
        debug!("undo.purge.worker_exit");
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(mut self) {
        self.shared.signal();
        self.history.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("undo.purge.worker_panicked");
            }
        }
    }

    /// Asks the thread to stop without waiting for it.
    pub fn signal_stop(mut self) {
        self.shared.signal();
        self.history.notify_all();
        self.handle.take();
    }
}
