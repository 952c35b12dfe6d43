//! Thin re-export of `crossbeam_channel`, kept as its own crate so every
//! workspace member pins the same channel implementation without each one
//! repeating the dependency declaration.

pub use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

/// A one-shot gate: a lane's worker thread blocks on `wait` immediately
/// after being spawned, so OS-thread warm-up can overlap with the parent
/// finishing VM preparation (spec.md §4.8.2 step 2). The parent calls
/// `release` once preparation completes.
pub struct Latch {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Counts down the latch, letting the waiting thread proceed.
    pub fn release(&self) {
        // A full channel means release() was already called; that's fine,
        // the receiver only needs one token.
        let _ = self.tx.try_send(());
    }

    /// Blocks the calling thread until `release` is called.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
