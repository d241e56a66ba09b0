//! Persistent object store and its in-process change feed.

pub mod client;
pub mod locks;
pub mod watch;
