//! Process-wide shutdown broadcast.
//!
//! Every background loop (registry watch, resolver trigger loop, admission
//! sweep) observes a [`Shutdown`] and exits once it fires. A signal may have a
//! parent: a resolver gets a child of the process signal so it can be closed
//! on its own while still following a process-wide shutdown.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    parent: Option<Arc<Shutdown>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            parent: None,
        }
    }

    /// Creates a signal that fires when either it or `self` is triggered.
    ///
    /// Triggering the child leaves the parent untouched.
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Fires the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow() || self.parent.as_ref().is_some_and(|p| p.is_triggered())
    }

    /// Resolves once this signal or any ancestor fires.
    pub fn wait(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut rx = self.tx.subscribe();
            match &self.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = wait_own(&mut rx) => {}
                        _ = parent.wait() => {}
                    }
                }
                None => wait_own(&mut rx).await,
            }
        })
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_own(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        // The sender lives as long as the `Shutdown` being awaited.
        if rx.changed().await.is_err() {
            return;
        }
    }
}
