//! Graceful shutdown handling.
//!
//! A `Shutdown` token is cloned into every part of the server that needs to
//! stop on request:
//! 1. The accept loop, woken through a registered `mio::Waker`
//! 2. Connection workers, which poll `is_triggered` between reads
//! 3. Control plane tasks, which await `wait`
//!
//! Signal delivery is one way to trigger it; tests trigger it directly.

use mio::Waker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

struct Inner {
    requested: AtomicBool,
    notify: watch::Sender<bool>,
    wakers: Mutex<Vec<Arc<Waker>>>,
}

/// Cloneable, process-local shutdown token.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                requested: AtomicBool::new(false),
                notify,
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Request shutdown. Calling this more than once has no further effect.
    pub fn trigger(&self) {
        if self.inner.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.notify.send_replace(true);

        let wakers = self
            .inner
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for waker in wakers.iter() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake poller for shutdown");
            }
        }
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Wake `waker` when shutdown is triggered, or right away if it already was.
    pub fn register_waker(&self, waker: Arc<Waker>) {
        let mut wakers = self
            .inner
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_triggered() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake poller for shutdown");
            }
        }
        wakers.push(waker);
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.inner.notify.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

/// SIGINT/SIGTERM listeners.
///
/// Created synchronously (inside a runtime context) so the handlers are in
/// place before the packet log exists. A signal that arrives before
/// [`Signals::forward`] runs is kept and acted on once it does.
pub struct Signals {
    listeners: Vec<(&'static str, Signal)>,
}

impl Signals {
    /// Must be called from within a tokio runtime context.
    pub fn install() -> std::io::Result<Self> {
        Self::listen(&[
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::interrupt(), "SIGINT"),
        ])
    }

    /// Listen for an explicit set of signals.
    pub fn listen(kinds: &[(SignalKind, &'static str)]) -> std::io::Result<Self> {
        let listeners = kinds
            .iter()
            .map(|&(kind, name)| Ok((name, signal(kind)?)))
            .collect::<std::io::Result<_>>()?;
        Ok(Self { listeners })
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.listeners.iter().map(|(name, _)| *name)
    }

    /// Trigger `shutdown` on the first signal. Returns once shutdown is
    /// triggered, whether by a signal or some other way.
    pub async fn forward(self, shutdown: Shutdown) {
        let mut tasks = JoinSet::new();
        for (name, mut signal) in self.listeners {
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                if signal.recv().await.is_some() {
                    info!(signal = name, "Signal received, initiating graceful shutdown");
                    shutdown.trigger();
                }
            });
        }

        shutdown.wait().await;
        tasks.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, Token};
    use std::time::Duration;

    #[test]
    fn test_trigger_is_idempotent() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        assert!(!clone.is_triggered());

        shutdown.trigger();
        shutdown.trigger();
        assert!(clone.is_triggered());
    }

    #[test]
    fn test_registered_waker_fires() {
        let mut poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(7)).unwrap());
        let shutdown = Shutdown::new();
        shutdown.register_waker(waker);

        shutdown.trigger();

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().any(|e| e.token() == Token(7)));
    }

    #[test]
    fn test_late_registration_wakes_immediately() {
        let mut poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(1)).unwrap());
        let shutdown = Shutdown::new();
        shutdown.trigger();

        shutdown.register_waker(waker);

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().any(|e| e.token() == Token(1)));
    }

    #[tokio::test]
    async fn test_wait_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_after_trigger_is_immediate() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_signals_forward_returns_on_trigger() {
        let shutdown = Shutdown::new();
        let signals = Signals::install().unwrap();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), signals.forward(shutdown.clone()))
            .await
            .unwrap();
    }

    #[test]
    fn test_install_listens_for_termination_signals() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let signals = Signals::install().unwrap();
        assert_eq!(signals.names().collect::<Vec<_>>(), ["SIGTERM", "SIGINT"]);
    }

    #[tokio::test]
    async fn test_signal_triggers_shutdown() {
        // SIGTERM would reach every server running in this test process, so
        // drive the same forwarding path with a signal nothing else watches
        let signals = Signals::listen(&[(SignalKind::window_change(), "SIGWINCH")]).unwrap();
        let shutdown = Shutdown::new();
        let forward = tokio::spawn(signals.forward(shutdown.clone()));

        tokio::task::yield_now().await;
        assert!(!shutdown.is_triggered());

        // SAFETY: a tokio handler for SIGWINCH is installed above
        assert_eq!(unsafe { libc::raise(libc::SIGWINCH) }, 0);

        tokio::time::timeout(Duration::from_secs(5), forward)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_triggered());
    }
}
