//! Error types for data parsing in pumpsync-types.

use thiserror::Error;

/// Errors that can occur when parsing persisted identity data.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Hex string has an odd number of digits.
    #[error("Invalid hex length: {0} digits (must be even)")]
    OddHexLength(usize),

    /// Hex string contains a character outside `[0-9a-fA-F]`.
    #[error("Invalid hex digit '{digit}' at position {position}")]
    InvalidHexDigit { digit: char, position: usize },

    /// Link key is empty.
    #[error("Link key cannot be empty")]
    EmptyKey,
}

/// Result type alias using pumpsync-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
