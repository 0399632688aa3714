//! Incremental local archive of a remote mailbox, with tabular export.

pub mod app;
pub mod audit;
pub mod cli;
pub mod config;
pub mod errors;
pub mod export;
pub mod imap;
pub mod sanitize;
pub mod source;
pub mod storage;
pub mod sync;
pub mod types;
