//! Registry of live connection workers.
//!
//! Entries are kept in a slab and reclaimed two ways:
//! - `reap` joins only the workers that have raised their completion flag,
//!   and runs after every registration so the slab stays small
//! - `drain_all` joins everything, and runs once at shutdown

use crate::runtime::connection::ConnOutcome;
use slab::Slab;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

struct Entry {
    id: usize,
    peer: SocketAddr,
    completion: Arc<AtomicBool>,
    handle: JoinHandle<ConnOutcome>,
}

/// Tracks the join handle of every worker that has not been reclaimed yet.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Slab<Entry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly spawned worker.
    pub fn register(
        &mut self,
        id: usize,
        peer: SocketAddr,
        completion: Arc<AtomicBool>,
        handle: JoinHandle<ConnOutcome>,
    ) -> usize {
        self.entries.insert(Entry {
            id,
            peer,
            completion,
            handle,
        })
    }

    /// Join and drop every worker that has finished. Returns how many were
    /// reclaimed.
    pub fn reap(&mut self) -> usize {
        let finished: Vec<usize> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.completion.load(Ordering::Acquire))
            .map(|(key, _)| key)
            .collect();

        for &key in &finished {
            release(self.entries.remove(key));
        }
        finished.len()
    }

    /// Join every remaining worker, finished or not. Returns how many were
    /// reclaimed.
    pub fn drain_all(&mut self) -> usize {
        let drained = self.entries.len();
        for entry in self.entries.drain() {
            release(entry);
        }
        drained
    }

    /// Number of workers not yet reclaimed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn release(entry: Entry) {
    let Entry { id, peer, handle, .. } = entry;
    match handle.join() {
        Ok(ConnOutcome::Replied { packet, reply }) => {
            debug!(id, %peer, packet, reply, "Connection served");
        }
        Ok(ConnOutcome::Abandoned(e)) => {
            warn!(id, %peer, error = %e, "Connection abandoned");
        }
        Err(_) => {
            error!(id, %peer, "Connection worker panicked");
        }
    }
}
