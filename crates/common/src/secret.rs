//! Secret wrapper for sensitive values

use std::fmt;
use std::path::Path;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Resolve a string secret from an environment variable or a file.
    ///
    /// The env var wins when set. File contents are trimmed; an empty file
    /// counts as no secret. Returns `Ok(None)` when neither source is
    /// configured, and an error when the file is configured but unreadable.
    pub fn resolve(env_var: Option<&str>, file: Option<&Path>) -> Result<Option<Self>> {
        if let Some(name) = env_var {
            if let Ok(value) = std::env::var(name) {
                if !value.is_empty() {
                    return Ok(Some(Self::new(value)));
                }
            }
        }

        if let Some(path) = file {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                Error::MissingSecret(format!("failed to read {}: {e}", path.display()))
            })?;
            let value = contents.trim().to_owned();
            if !value.is_empty() {
                return Ok(Some(Self::new(value)));
            }
        }

        Ok(None)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
