//! devsync - downstream half of a file sync engine for remote development
//! environments.
//!
//! A helper process runs next to the remote tree and serves three calls
//! over its stdio: how many changes are pending, what they are, and an
//! archive of requested paths.

pub mod archive;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod snapshot;
pub mod transport;

pub use client::{DownstreamClient, RemoteSession};
pub use config::DownstreamOptions;
pub use error::{Result, SyncError};
pub use server::{run_downstream, serve, Downstream};
