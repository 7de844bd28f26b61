//! Cooperative shutdown
//!
//! A `ShutdownTrigger` owns the only sender of a zero-capacity channel. Every
//! loop holds a `Shutdown` and sees the channel disconnect once the trigger
//! fires or is dropped, so it can be used directly inside `select!`.

use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError};

pub struct ShutdownTrigger {
    tx: Option<Sender<()>>,
    rx: Receiver<()>,
}

#[derive(Clone)]
pub struct Shutdown {
    rx: Receiver<()>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self { tx: Some(tx), rx }
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown { rx: self.rx.clone() }
    }

    pub fn fire(&mut self) {
        self.tx.take();
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Receiver that becomes ready (disconnected) once shutdown fires
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}
