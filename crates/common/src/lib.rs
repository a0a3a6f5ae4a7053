//! Common types for the Boîte à Kiffs auth gateway

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
