//! warpsend library
//!
//! Parallel file transfer over several TCP connections with shared rate
//! limiting, retries and byte accounting that separates wire traffic from
//! data that was actually delivered.

pub mod byte_source;
pub mod cli;
pub mod error;
pub mod fs_enum;
pub mod log;
pub mod logger;
pub mod options;
pub mod progress;
pub mod protocol;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod socket;
pub mod stats;
pub mod throttler;
