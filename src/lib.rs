//! remexec library
//!
//! Remote command execution over one persistent TCP session: file upload and
//! download, directory listing, host information and build-and-run of C
//! programs kept under the daemon root.

pub mod block;
pub mod build_cache;
pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod exec;
pub mod logger;
pub mod outbox;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod server;
pub mod shell;
pub mod transfer;
pub mod transport;
