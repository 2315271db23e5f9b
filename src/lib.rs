//! Keeps compiled objects of a decompilation project in sync with its sources
//!
//! A workspace daemon loads `objdiff.json`, rebuilds the selected unit when
//! watched files change and pushes the results to connected views over a
//! local socket.

pub mod broadcast;
pub mod build;
pub mod config;
pub mod constants;
pub mod error;
pub mod host;
pub mod ipc;
pub mod logging;
pub mod persistence;
pub mod protocol;
pub mod selection;
pub mod task;
pub mod watch;
pub mod workspace;
