#![forbid(unsafe_code)]

//! Common error type for Teredo crates.
//!
//! Most protocol-level failures (malformed packets, nonce mismatches,
//! spoofed mappings) are handled by silently dropping the offending
//! packet and never surface here. Only startup transport failures and
//! peer-directory exhaustion are caller-visible.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TeredoError {
    /// I/O related failures (socket creation, bind).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing failures.
    #[error("Config parse error: {0}")]
    ConfigParse(toml::de::Error),

    /// Semantically invalid configuration (e.g. client mode without a server).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Peer directory could not allocate an entry.
    #[error("Peer directory exhausted")]
    Exhausted,
}

/// Convenient alias for results throughout Teredo crates.
pub type TeredoResult<T> = Result<T, TeredoError>;
