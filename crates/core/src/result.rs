//! `Result` alias and logged fallbacks.

use crate::error::Error;

/// Result carrying a [`tether_core::Error`](crate::Error).
pub type Result<T> = std::result::Result<T, Error>;

/// Fallbacks that log the error they swallow.
pub trait ResultExt<T> {
    /// `Ok` value, or `fallback` after logging a warning.
    fn or_default_logged(self, fallback: T) -> T;
}

impl<T> ResultExt<T> for Result<T> {
    fn or_default_logged(self, fallback: T) -> T {
        self.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Falling back to default");
            fallback
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_value_passes_through() {
        let loaded: Result<u16> = Ok(7);
        assert_eq!(loaded.or_default_logged(1), 7);
    }

    #[test]
    fn invalid_config_falls_back() {
        let loaded: Result<u16> = Err(Error::invalid_config("buffer_size must be positive"));
        assert_eq!(loaded.or_default_logged(1), 1);
    }
}
