//! Runtime pieces of the packet log server.
//!
//! Thread-per-connection model:
//! - `Listener`: bound socket with a shutdown-aware accept
//! - `Worker`: one OS thread per accepted connection
//! - `ConnectionRegistry`: reaps finished workers, drains the rest at shutdown
//! - `Control`: tokio thread running signal handling and the timestamp ticker

mod connection;
mod control;
mod listener;
mod registry;
mod ticker;

pub(crate) use connection::{ConnLimits, ConnectionTask, Worker};
pub(crate) use control::Control;
pub(crate) use listener::Listener;
pub(crate) use registry::ConnectionRegistry;
pub(crate) use ticker::TickSchedule;
