//! Producer thread shared by the built-in sources.
//!
//! Wraps the spawn/stop/join bookkeeping every streaming device needs. The thread body
//! runs under `catch_unwind`: a panic inside a driver marks the producer as faulted
//! instead of tearing down the process, and whatever was already queued stays queued
//! for the MCA worker.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::queue::SpillQueue;
use crate::source::SpillSender;
use crate::spill::Spill;

/// Handle to a device's streaming thread.
#[derive(Debug, Default)]
pub(crate) struct Producer {
    stop: Arc<AtomicBool>,
    faulted: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Producer {
    /// Spawn `body` on a named thread. Returns false if a thread is already alive or the
    /// OS refused to spawn one.
    pub(crate) fn start<F>(&mut self, device: &str, queue: SpillSender, body: F) -> bool
    where
        F: FnOnce(&AtomicBool, &SpillQueue<Spill>) + Send + 'static,
    {
        if self.is_running() {
            return false;
        }
        // reap a thread that ended on its own
        self.join(device);

        self.stop.store(false, Ordering::SeqCst);
        self.faulted.store(false, Ordering::SeqCst);

        let stop = Arc::clone(&self.stop);
        let faulted = Arc::clone(&self.faulted);
        let name = device.to_string();

        let spawned = thread::Builder::new()
            .name(format!("{device}-producer"))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| body(&stop, &queue)));
                if let Err(payload) = result {
                    faulted.store(true, Ordering::SeqCst);
                    error!(
                        device = %name,
                        panic = %panic_message(payload.as_ref()),
                        "Producer thread panicked; device marked non-running"
                    );
                }
                debug!(device = %name, "Producer thread exiting");
            });

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                true
            }
            Err(e) => {
                error!(device, error = %e, "Failed to spawn producer thread");
                false
            }
        }
    }

    /// Signal the thread and wait for it. Returns false if nothing was running.
    pub(crate) fn stop(&mut self, device: &str) -> bool {
        if self.handle.is_none() {
            return false;
        }
        self.stop.store(true, Ordering::SeqCst);
        self.join(device);
        true
    }

    /// Thread exists and has not finished.
    pub(crate) fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Last run ended in a panic.
    pub(crate) fn faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Forget a previous fault (on re-boot).
    pub(crate) fn clear_fault(&self) {
        self.faulted.store(false, Ordering::SeqCst);
    }

    fn join(&mut self, device: &str) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(device, "Producer thread could not be joined cleanly");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stop_joins_thread() {
        let queue = Arc::new(SpillQueue::new());
        let mut producer = Producer::default();

        assert!(producer.start("dev", Arc::clone(&queue), |stop, queue| {
            let mut seq = 0;
            while !stop.load(Ordering::SeqCst) {
                queue.push(Spill::data("dev", seq, Vec::new()));
                seq += 1;
                thread::sleep(Duration::from_millis(1));
            }
        }));
        thread::sleep(Duration::from_millis(10));

        assert!(producer.stop("dev"));
        assert!(!producer.is_running());

        let settled = queue.len();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.len(), settled);
    }

    #[test]
    fn test_panic_marks_fault() {
        let queue = Arc::new(SpillQueue::new());
        let mut producer = Producer::default();

        assert!(producer.start("dev", Arc::clone(&queue), |_, queue| {
            queue.push(Spill::data("dev", 0, Vec::new()));
            panic!("lost sync with controller");
        }));
        producer.stop("dev");

        assert!(producer.faulted());
        assert_eq!(queue.len(), 1);
        producer.clear_fault();
        assert!(!producer.faulted());
    }
}
