//! castrec - Scheduled live-stream recorder
//!
//! This library crate exposes the recording engine for the binary and for
//! integration testing.

pub mod config;
pub mod lifecycle;
pub mod resolver;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod title;
pub mod transport;
pub mod upload;
