//! Error types shared by the deskbridge crates.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by configuration loading and the pure models.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    ConfigValidation(Vec<String>),

    #[error("invalid Bluetooth address '{0}'")]
    InvalidAddress(String),

    #[error("transfer failed: {0}")]
    Transfer(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_every_entry() {
        let err = Error::ConfigValidation(vec!["a: bad".into(), "b: worse".into()]);
        let text = err.to_string();
        assert!(text.contains("a: bad"));
        assert!(text.contains("b: worse"));
    }

    #[test]
    fn test_not_found_mentions_path() {
        let err = Error::ConfigNotFound(PathBuf::from("/nope/config.toml"));
        assert!(err.to_string().contains("/nope/config.toml"));
    }
}
