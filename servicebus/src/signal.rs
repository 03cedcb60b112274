//! Cooperative stop signal: an exit flag plus a wake channel.
//!
//! Triggering sets the flag and drops the only wake sender, so every thread
//! parked in [`StopSignal::wait`] returns immediately instead of sleeping
//! out its timeout.

use {
    crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender},
    parking_lot::Mutex,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
};

#[derive(Debug, Clone)]
pub struct StopSignal {
    exit: Arc<AtomicBool>,
    wake_tx: Arc<Mutex<Option<Sender<()>>>>,
    wake_rx: Receiver<()>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(0);
        Self {
            exit: Arc::new(AtomicBool::new(false)),
            wake_tx: Arc::new(Mutex::new(Some(wake_tx))),
            wake_rx,
        }
    }

    pub fn trigger(&self) {
        self.exit.store(true, Ordering::SeqCst);
        self.wake_tx.lock().take();
    }

    pub fn is_triggered(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`.  Returns `true` if the signal fired.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        match self.wake_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_triggered(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    /// Receiver that disconnects when the signal fires.
    pub fn wake_receiver(&self) -> &Receiver<()> {
        &self.wake_rx
    }
}
