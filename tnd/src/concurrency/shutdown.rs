use std::future::pending;

use tokio::sync::watch;

use crate::concurrency::signal::{SignalRx, SignalTx, create_signal};

/// Requests cancellation of a running pass.
#[derive(Debug, Clone)]
pub struct ShutdownTx(SignalTx);

impl ShutdownTx {
    pub fn wrap(tx: SignalTx) -> Self {
        Self(tx)
    }

    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

pub type ShutdownRx = SignalRx;

/// Outcome of work raced against a shutdown request.
pub enum ShutdownResult<T, I> {
    Ok(T),
    Shutdown(I),
}

impl<T, I> ShutdownResult<T, I> {
    pub fn should_shutdown(&self) -> bool {
        matches!(self, ShutdownResult::Shutdown(_))
    }
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = create_signal();
    (ShutdownTx::wrap(tx), rx)
}

/// Whether a shutdown was requested and not yet observed by `rx`.
pub fn is_shutdown_requested(rx: &ShutdownRx) -> bool {
    rx.has_changed().unwrap_or(false)
}

/// Resolves once a shutdown is requested.
///
/// A dropped [`ShutdownTx`] can no longer request anything, so the future then
/// never resolves.
pub async fn wait_for_shutdown(rx: &mut ShutdownRx) {
    if rx.changed().await.is_err() {
        pending::<()>().await;
    }
}

/// Runs `future` unless a shutdown is requested first.
pub async fn run_until_shutdown<F, T>(rx: &mut ShutdownRx, future: F) -> ShutdownResult<T, ()>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;

        _ = wait_for_shutdown(rx) => ShutdownResult::Shutdown(()),
        output = future => ShutdownResult::Ok(output),
    }
}
