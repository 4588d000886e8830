//! Error types shared across the SDK core.
//!
//! Each subsystem surfaces a small typed enum rather than a catch-all error:
//! the storage layer reports `DbError`, the wire layer `ApiError`, the
//! streaming parser `SplitError`, the user-attribute codec `TlvError`, and the
//! local agent IPC speaks the numeric `OutCode` namespace. Engine-level setup
//! paths use `anyhow::Result` and attach context as they bubble up.

use thiserror::Error;

/// Result codes of the local agent IPC protocol.
///
/// These travel as 32-bit little-endian integers on the data socket. `0` is
/// success; negative values name the failure class. `ReqConfirm` is not a
/// final outcome: it asks the shell to answer a yes/no prompt and read the
/// next code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OutCode {
    Ok = 0,
    Args = -51,
    InvalidEmail = -52,
    NotFound = -53,
    InvalidState = -54,
    InvalidType = -55,
    NotPermitted = -56,
    NotLoggedIn = -57,
    /// Node tree has not been fetched yet.
    NoFetch = -58,
    Unexpected = -59,
    /// Client must answer a yes/no prompt before the final outcome arrives.
    ReqConfirm = -60,
}

impl OutCode {
    /// Maps a raw wire integer to a known code, `Unexpected` otherwise.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => OutCode::Ok,
            -51 => OutCode::Args,
            -52 => OutCode::InvalidEmail,
            -53 => OutCode::NotFound,
            -54 => OutCode::InvalidState,
            -55 => OutCode::InvalidType,
            -56 => OutCode::NotPermitted,
            -57 => OutCode::NotLoggedIn,
            -58 => OutCode::NoFetch,
            -60 => OutCode::ReqConfirm,
            _ => OutCode::Unexpected,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

/// Storage failures worth telling the application about.
///
/// Only `Full` and `Io` reach the registered database error callback; other
/// failures surface through the return value of the operation that hit them.
/// Query interruption via a cancel token is not an error at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("database storage is full")]
    Full,
    #[error("database I/O failure")]
    Io,
    #[error("database failure")]
    Unknown,
}

/// Wire-level API error numbers carried in command responses.
///
/// The server answers either a structured value or a bare negative number;
/// this type wraps the latter. `0` never appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("API error {0}")]
pub struct ApiError(pub i64);

impl ApiError {
    /// Internal error used when a response cannot be parsed at all.
    pub const INTERNAL: ApiError = ApiError(-1);
}

/// Streaming parser failure. The splitter is irrecoverable after reporting
/// one of these; the owning request is failed and retried at a higher level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitError {
    #[error("malformed JSON: {0}")]
    Malformed(&'static str),
    #[error("streaming filter rejected data at path {0:?}")]
    FilterFailed(String),
}

/// User-attribute TLV codec failures.
///
/// The record layout is `name NUL length(u16 BE) value`; each variant names
/// the structural violation encountered while decoding or storing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TlvError {
    #[error("the supplied value already exists in this store")]
    AttributeExists,
    #[error("the specified value does not exist in this store")]
    ValueNotFound,
    #[error("the given data does not have a null delimiter")]
    MissingDelimiter,
    #[error("the provided data is not of valid length")]
    InvalidLength,
}
