//! Stop signal
//!
//! Wraps the receiving end of the service's broadcast shutdown channel and
//! remembers that it fired, so every later wait returns immediately.

use tokio::sync::broadcast;

/// Listener for the process-wide stop signal.
#[derive(Debug)]
pub struct Shutdown {
    triggered: bool,
    rx: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(rx: broadcast::Receiver<()>) -> Self {
        Self {
            triggered: false,
            rx,
        }
    }

    /// Whether the signal has been observed.
    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// Check for a pending signal without waiting.
    pub fn poll(&mut self) -> bool {
        if !self.triggered {
            match self.rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => self.triggered = true,
                Err(broadcast::error::TryRecvError::Lagged(_)) => self.triggered = true,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }
        }
        self.triggered
    }

    /// Wait for the signal. A closed channel counts as a signal.
    pub async fn recv(&mut self) {
        if self.triggered {
            return;
        }
        let _ = self.rx.recv().await;
        self.triggered = true;
    }
}
