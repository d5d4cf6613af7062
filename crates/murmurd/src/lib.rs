//! murmurd: the Murmur mesh daemon.
//!
//! Owns the exchange state machine, the exchange scheduler, the
//! content-addressed message store, and the cross-transport peer registry.
//! See `daemon::Daemon` for how everything is wired together at startup.

pub mod adapters;
pub mod config;
pub mod daemon;
pub mod error;
pub mod exchange;
pub mod friends;
pub mod history;
pub mod scheduler;
pub mod storage;
pub mod store;

pub use config::{AppConfig, Config};
pub use daemon::{Daemon, DaemonError};
pub use error::{ExchangeError, StorageError};
pub use scheduler::{DispatchMode, Scheduler, SchedulerStats};
