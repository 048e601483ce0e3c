//! Packet log server.
//!
//! Accepts connections, hands each one to its own worker thread, and on
//! shutdown drains every worker before deleting the packet log.

use crate::config::Config;
use crate::log_store::LogStore;
use crate::runtime::{
    ConnLimits, ConnectionRegistry, ConnectionTask, Control, Listener, TickSchedule, Worker,
};
use crate::shutdown::Shutdown;
use std::io;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

/// Server instance
pub struct Server {
    control: Control,
    store: Arc<LogStore>,
    shutdown: Shutdown,
    limits: ConnLimits,
    schedule: TickSchedule,
}

impl Server {
    /// Create a new server instance, truncating the packet log.
    ///
    /// Signal handlers go in first, so a SIGTERM from here on leads to a
    /// graceful shutdown that removes the log rather than killing the process.
    pub fn new(config: &Config) -> io::Result<Self> {
        let control = Control::install()?;

        Ok(Server {
            control,
            store: LogStore::create(&config.data_file)?,
            shutdown: Shutdown::new(),
            limits: ConnLimits {
                chunk_size: config.chunk_size,
                max_packet_size: config.max_packet_size,
                recv_poll: config.recv_poll(),
            },
            schedule: TickSchedule {
                initial_delay: config.timestamp_initial_delay(),
                period: config.timestamp_period(),
            },
        })
    }

    /// Token that stops `run` when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Serve until shutdown, then drain workers and delete the log.
    pub fn run(self, mut listener: Listener) -> io::Result<()> {
        let Server {
            control,
            store,
            shutdown,
            limits,
            schedule,
        } = self;

        shutdown.register_waker(listener.waker());

        let control = match control.start(Arc::clone(&store), shutdown.clone(), schedule) {
            Ok(control) => control,
            Err(e) => {
                remove_log(&store);
                return Err(e);
            }
        };

        info!(addr = %listener.local_addr(), "Accepting connections");
        let mut registry = ConnectionRegistry::new();
        let result = accept_loop(&mut listener, &mut registry, &store, &shutdown, limits);
        if let Err(ref e) = result {
            error!(error = %e, "Accept loop failed, shutting down");
            shutdown.trigger();
        }

        if !registry.is_empty() {
            info!(workers = registry.len(), "Draining connections");
        }
        let drained = registry.drain_all();
        control.join();
        drop(listener);
        remove_log(&store);
        info!(drained, "Server stopped");

        result
    }
}

fn accept_loop(
    listener: &mut Listener,
    registry: &mut ConnectionRegistry,
    store: &Arc<LogStore>,
    shutdown: &Shutdown,
    limits: ConnLimits,
) -> io::Result<()> {
    let mut next_id = 0;

    while let Some((stream, peer)) = listener.accept(shutdown)? {
        let id = next_id;
        next_id += 1;
        info!(id, %peer, "Accepted connection");

        let task = ConnectionTask::new(id, stream, peer);
        let completion = task.completion();
        let worker = Worker::new(task, Arc::clone(store), shutdown.clone(), limits);

        match thread::Builder::new()
            .name(format!("conn-{id}"))
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                registry.register(id, peer, completion, handle);
            }
            Err(e) => {
                error!(id, %peer, error = %e, "Failed to spawn connection worker");
            }
        }

        registry.reap();
    }

    Ok(())
}

fn remove_log(store: &LogStore) {
    if let Err(e) = store.remove() {
        error!(path = %store.path().display(), error = %e, "Failed to remove packet log");
    }
}
