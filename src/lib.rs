//! Per-user session lifecycle and event fan-out for disposable cloud
//! desktops.
//!
//! The crate keeps one isolated session store per resource domain (desktop,
//! browser-use, computer-use, code-interpreter), routes events from
//! background tasks to WebSocket connections through a session-keyed
//! registry, and reclaims idle sessions with a periodic sweep.

pub mod actions;
pub mod config;
pub mod demo;
pub mod error;
pub mod event;
pub mod http_server;
pub mod notify;
pub mod provider;
pub mod registry;
pub mod session;
pub mod state;
pub mod store;
pub mod ws;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use state::{AppState, Domain};
