//! Control plane thread.
//!
//! A single-threaded tokio runtime on its own OS thread hosts the signal
//! listener and the timestamp ticker. Both finish once shutdown triggers,
//! so joining the thread guarantees no tick is still pending.
//!
//! Setup is split in two: [`Control::install`] builds the runtime and puts
//! the signal handlers in place, [`Control::start`] launches the thread once
//! the packet log exists.

use crate::log_store::LogStore;
use crate::runtime::ticker::{self, TickSchedule};
use crate::shutdown::{Shutdown, Signals};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::runtime::Runtime;
use tracing::{debug, error, info};

/// Control plane with its signal handlers installed but not yet running.
pub struct Control {
    runtime: Runtime,
    signals: Signals,
}

/// Running control plane thread.
pub struct ControlThread {
    thread: JoinHandle<()>,
}

impl Control {
    /// Build the runtime and install the SIGTERM/SIGINT handlers.
    pub fn install() -> io::Result<Self> {
        Self::build(Signals::install)
    }

    #[cfg(test)]
    pub fn with_signals(kinds: &[(tokio::signal::unix::SignalKind, &'static str)]) -> io::Result<Self> {
        Self::build(|| Signals::listen(kinds))
    }

    fn build(install: impl FnOnce() -> io::Result<Signals>) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        // Signal registration needs the runtime's driver
        let signals = {
            let _guard = runtime.enter();
            install()?
        };
        debug!(signals = ?signals.names().collect::<Vec<_>>(), "Installed signal handlers");

        Ok(Self { runtime, signals })
    }

    /// Start forwarding signals to `shutdown` and writing timestamps.
    pub fn start(
        self,
        store: Arc<LogStore>,
        shutdown: Shutdown,
        schedule: TickSchedule,
    ) -> io::Result<ControlThread> {
        let Control { runtime, signals } = self;

        let thread = thread::Builder::new()
            .name("control".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let ((), written) = tokio::join!(
                        signals.forward(shutdown.clone()),
                        ticker::run(store, shutdown, schedule),
                    );
                    info!(timestamps = written, "Control plane stopped");
                });
            })?;

        Ok(ControlThread { thread })
    }
}

impl ControlThread {
    /// Wait for the control plane to finish. Only returns promptly once
    /// shutdown has been triggered.
    pub fn join(self) {
        if self.thread.join().is_err() {
            error!("Control plane thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tokio::signal::unix::SignalKind;

    fn quiet_schedule() -> TickSchedule {
        TickSchedule {
            initial_delay: Duration::from_secs(3600),
            period: Duration::from_secs(3600),
        }
    }

    fn wait_for_trigger(shutdown: &Shutdown) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !shutdown.is_triggered() {
            assert!(Instant::now() < deadline, "signal did not trigger shutdown");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_join_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::create(dir.path().join("log")).unwrap();
        let shutdown = Shutdown::new();

        let control = Control::install()
            .unwrap()
            .start(
                Arc::clone(&store),
                shutdown.clone(),
                TickSchedule {
                    initial_delay: Duration::from_millis(10),
                    period: Duration::from_secs(3600),
                },
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        shutdown.trigger();
        control.join();

        let contents = String::from_utf8(store.contents().unwrap()).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.starts_with("timestamp:"));
    }

    #[test]
    fn test_signal_stops_control_plane() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::create(dir.path().join("log")).unwrap();
        let shutdown = Shutdown::new();

        let control = Control::with_signals(&[(SignalKind::user_defined1(), "SIGUSR1")])
            .unwrap()
            .start(store, shutdown.clone(), quiet_schedule())
            .unwrap();

        // SAFETY: a tokio handler for SIGUSR1 is installed above
        assert_eq!(unsafe { libc::raise(libc::SIGUSR1) }, 0);

        wait_for_trigger(&shutdown);
        control.join();
    }

    #[test]
    fn test_signal_before_start_is_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Shutdown::new();

        let control = Control::with_signals(&[(SignalKind::user_defined2(), "SIGUSR2")]).unwrap();

        // Delivered while nothing is running yet, and before the log exists.
        // Without the handler the default action would end the process.
        // SAFETY: a tokio handler for SIGUSR2 is installed above
        assert_eq!(unsafe { libc::raise(libc::SIGUSR2) }, 0);

        let store = LogStore::create(dir.path().join("log")).unwrap();
        let control = control
            .start(Arc::clone(&store), shutdown.clone(), quiet_schedule())
            .unwrap();

        wait_for_trigger(&shutdown);
        control.join();
        assert!(store.contents().unwrap().is_empty());
    }
}
