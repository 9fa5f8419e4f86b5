//! Process-wide interrupt capture.
//!
//! One `Interrupt` token is the only cancellation mechanism in the
//! pipeline. It is a `watch` channel, so a waiter that subscribes after
//! the signal fired still observes it.

use log::{error, info};
use std::sync::Arc;
use tokio::sync::watch;

/// Read side of the interrupt token. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

/// Write side of the interrupt token.
#[derive(Clone, Debug)]
pub struct InterruptTrigger {
    tx: Arc<watch::Sender<bool>>,
}

/// Creates an unconnected trigger/token pair.
pub fn channel() -> (InterruptTrigger, Interrupt) {
    let (tx, rx) = watch::channel(false);
    (InterruptTrigger { tx: Arc::new(tx) }, Interrupt { rx })
}

impl InterruptTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Interrupt {
    /// Registers SIGINT and SIGTERM handlers and returns a token that fires
    /// on the first of them.
    ///
    /// Registration happens before this function returns, so a signal
    /// received right after is never missed.
    ///
    /// Must be called from inside a tokio runtime.
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let (trigger, token) = channel();

        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => info!("SIGINT received"),
                _ = terminate.recv() => info!("SIGTERM received"),
            }
            trigger.trigger();
        });

        Ok(token)
    }

    #[cfg(not(unix))]
    pub fn install() -> std::io::Result<Self> {
        let (trigger, token) = channel();

        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {}", e);
                return;
            }
            info!("ctrl-c received");
            trigger.trigger();
        });

        Ok(token)
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the interrupt has fired.
    ///
    /// If every trigger is dropped without firing, this never resolves.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|fired| *fired).await.is_err() {
            error!("interrupt source went away; waiting forever");
            std::future::pending::<()>().await;
        }
    }
}
