//! FitDesk Shared Types and Utilities
//!
//! This crate contains identifiers, enums, errors, and database helpers shared
//! across the FitDesk billing workspace.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
