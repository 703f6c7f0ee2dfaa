//! `layercache-core` — identifiers, configuration and the shared error type
//! used by every layercache crate.

pub mod config;
pub mod error;
pub mod types;

pub use error::{LayercacheError, Result};
pub use types::{JobId, LayerId};
