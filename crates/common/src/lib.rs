//! Common types for the campus portal workspace

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
