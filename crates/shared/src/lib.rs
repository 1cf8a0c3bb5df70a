//! Chatwire Shared Types and Utilities
//!
//! This crate contains the domain types, error taxonomy, and database
//! utilities shared across the chatwire platform.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
