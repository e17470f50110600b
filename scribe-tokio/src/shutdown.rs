//! A multi-producer, multi-consumer one-shot signal, most commonly used to
//! propagate shutdown.

use std::sync::Arc;

use tokio::sync::watch;

/// Synchronization utility which broadcasts a signal to all consumers once.
///
/// Features:
///
/// - Multi-producer and multi-consumer - simply clone to get another handle.
/// - Consumers which subscribe *after* the signal was sent still observe it.
/// - It is safe to send the signal multiple times (e.g. by accident); only
///   the first send has any effect.
///
/// Internally this is a `watch` channel over a `bool` that only ever flips
/// `false` -> `true`. Every handle holds a sender (so the channel can never
/// close underneath a waiting receiver) and its own receiver.
#[derive(Clone, Debug)]
pub struct ShutdownChannel {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownChannel {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Send the signal, waking all actors currently waiting in [`recv`], as
    /// well as any which call [`recv`] later.
    ///
    /// [`recv`]: Self::recv
    pub fn send(&self) {
        self.tx.send_replace(true);
    }

    /// Wait for the signal. Returns immediately if it was already sent.
    pub async fn recv(&mut self) {
        // Can't return Err: every handle holds a sender.
        let _ = self.rx.wait_for(|sent| *sent).await;
    }

    /// Waits for the signal, taking ownership of the handle. Useful for
    /// graceful shutdown APIs which require `impl Future<Output = ()> +
    /// 'static`.
    pub async fn recv_owned(mut self) {
        self.recv().await
    }

    /// Immediately returns whether the signal has been sent.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        *self.rx.borrow()
    }
}
