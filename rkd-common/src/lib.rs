//! # Rookdash Common Library
//!
//! Shared code for the Rookdash sync engine and its drivers:
//! - Identity types (identifier normalization, variants, entity summaries)
//! - Event types (SyncEvent enum) and the EventBus
//! - Configuration loading and root folder resolution
//! - Common error types

pub mod config;
pub mod error;
pub mod events;
pub mod identity;

pub use error::{Error, Result};
pub use identity::{Identifier, RemoteEntitySummary, Variant};
