//! Payload-free notification channels built on [`tokio::sync::watch`].

use tokio::sync::watch;

/// Sending half of a signal. Every receiver observes each send.
pub type SignalTx = watch::Sender<()>;

/// Receiving half of a signal.
pub type SignalRx = watch::Receiver<()>;

/// Creates a signal channel. Receivers see no change until the first send.
pub fn create_signal() -> (SignalTx, SignalRx) {
    watch::channel(())
}
