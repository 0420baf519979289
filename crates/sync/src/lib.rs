// tether-sync: session sync engine library and `tetherd` daemon.

pub mod config;
pub mod engine;
pub mod error;
pub mod git;
pub mod lifecycle;
pub mod messenger;
pub mod persistence;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod security;
pub mod state;
pub mod sync;
pub mod task_data;
pub mod title;
pub mod token_cache;
pub mod transcript;
pub mod transport;
pub mod watcher;

pub use engine::{Engine, EngineBuilder};
pub use error::{SessionSyncError, SessionSyncResult};
