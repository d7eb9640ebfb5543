//! Cooperative run control.
//!
//! Signals are only observed between batches, never while a destination
//! transaction is open.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Requested state for a live run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    /// Finish the in-flight batch, checkpoint and stop.
    Pause,
    /// Stop like a pause. Unless `force` is set the run can't be resumed.
    Cancel { force: bool },
}

/// Sender side of a run's control channel.
#[derive(Debug, Clone)]
pub struct RunControl {
    tx: Arc<watch::Sender<ControlSignal>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ControlSignal::Run);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlSignal> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ControlSignal {
        *self.tx.borrow()
    }

    pub fn pause(&self) {
        self.send(ControlSignal::Pause);
    }

    pub fn cancel(&self, force: bool) {
        self.send(ControlSignal::Cancel { force });
    }

    // send_replace keeps working with no receivers alive.
    fn send(&self, signal: ControlSignal) {
        // A cancel is never downgraded to a pause.
        if matches!(self.current(), ControlSignal::Cancel { .. })
            && signal == ControlSignal::Pause
        {
            return;
        }
        self.tx.send_replace(signal);
    }

    /// Request a pause once `token` is cancelled (e.g. on SIGINT).
    pub fn pause_on(&self, token: CancellationToken) {
        let control = self.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            info!("Shutdown requested, pausing at the next batch boundary");
            control.pause();
        });
    }
}
