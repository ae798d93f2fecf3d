//! Castrec-Common: Shared types, constants, and utilities.
//!
//! This crate provides common functionality used across castrec:
//!
//! - **Identifiers**: [`BroadcasterId`] and [`AuthToken`] newtypes
//! - **Core Types**: [`StreamMode`], the delivery variant picked by resolution
//! - **Path Utilities**: artifact layout and filename sanitisation
//! - **Error Handling**: Common error types and result aliases
//!
//! # Examples
//!
//! ```
//! use castrec_common::{BroadcasterId, StreamMode};
//! use castrec_common::paths::sanitize_component;
//!
//! let id = BroadcasterId::parse("some_caster").unwrap();
//! assert_eq!(id.as_str(), "some_caster");
//!
//! assert_eq!(StreamMode::Main.to_string(), "main");
//! assert_eq!(sanitize_component("live  tonight!"), "live_tonight");
//! ```

pub mod error;
pub mod ids;
pub mod paths;
pub mod types;

pub use error::{Error, Result};
pub use ids::*;
pub use types::*;
