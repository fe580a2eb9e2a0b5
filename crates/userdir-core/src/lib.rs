//! # userdir-core
//!
//! Shared foundation for the userdir directory delegate crates.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy for directory operations
//! - [`identity`] - Caller identity collaborator interface

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod identity;

// Re-export commonly used types
pub use error::{Error, Result};
pub use identity::{AnonymousIdentity, IdentityProvider, Principal};
