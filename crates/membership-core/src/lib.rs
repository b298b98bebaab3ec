//! # membership-core
//!
//! Core types shared by the directory group-membership crates.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy for membership resolution
//! - [`id`] - Identity of cache configurations
//! - [`config`] - Cache, schema and resolver configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod id;

// Re-export commonly used types
pub use config::{CacheConfiguration, CacheSettings, GroupSchema, ResolverConfig};
pub use error::{Error, Result};
pub use id::CacheConfigId;
