//! Root cancellation signal.
//!
//! One signal is created by the supervisor and cloned into every long-lived
//! component. Triggering it flips an atomic flag and closes a channel, so
//! both polling (`is_triggered`) and blocking (`subscribe` + select) callers
//! observe it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

struct Inner {
    triggered: AtomicBool,
    // Held only so that dropping it disconnects every subscribed receiver.
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                sender: Mutex::new(Some(tx)),
                receiver: rx,
            }),
        }
    }

    /// Fire the signal. Idempotent; every subscriber unblocks.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        // Dropping the sender disconnects all cloned receivers.
        self.inner.sender.lock().expect("shutdown sender poisoned").take();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// A receiver that errors out of `recv` once the signal fires. Intended
    /// for `crossbeam_channel::select!` arms.
    pub fn subscribe(&self) -> Receiver<()> {
        self.inner.receiver.clone()
    }

    /// Block up to `timeout`. Returns true if the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        // recv can only return on disconnect, which means trigger() ran.
        self.inner.receiver.recv_timeout(timeout).is_err() && self.is_triggered()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
