//! Error types for the skal runtime
//!
//! One enum covers every failure the runtime reports to callers. Clean
//! worker termination is not an error; handlers return
//! [`Control::Stop`](crate::worker::Control) for that.

use thiserror::Error;

/// Main skal error type
#[derive(Error, Debug)]
pub enum SkalError {
    /// Malformed router URL
    #[error("bad router URL `{url}`: {reason}")]
    BadUrl {
        /// The offending URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// A serialized message could not be parsed
    #[error("malformed message: {0}")]
    Format(String),

    /// A serialized message uses an unsupported protocol version
    #[error("unsupported message version {found}, this build speaks version {supported}")]
    VersionMismatch {
        /// Version byte found in the frame
        found: u8,
        /// Version this build supports
        supported: u8,
    },

    /// A worker, group or allocator name is already taken
    #[error("name `{0}` is already registered")]
    DuplicateName(String),

    /// Message field lookup miss
    #[error("message has no {kind} field named `{name}`")]
    NoSuchField {
        /// Field family (`int`, `double`, `string`, `miniblob`, `blob`)
        kind: &'static str,
        /// Name that was looked up
        name: String,
    },

    /// Unknown blob allocator name
    #[error("no allocator named `{0}`")]
    NoSuchAllocator(String),

    /// Blob creation collision, open miss, or mapping of a corrupted blob
    #[error("bad blob: {0}")]
    BadBlob(String),

    /// A group subscription filter is not a valid regular expression
    #[error("bad subscription filter `{filter}`: {reason}")]
    BadFilter {
        /// The filter string as submitted
        filter: String,
        /// Compile error reported by the regex engine
        reason: String,
    },

    /// A worker or group needs placing but no executor is alive
    #[error("no live executor to place `{0}` on")]
    NoExecutor(String),
}

/// Result type alias for skal operations
pub type Result<T> = std::result::Result<T, SkalError>;

impl SkalError {
    /// Create a format error
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    /// Create a bad-blob error
    pub fn bad_blob(message: impl Into<String>) -> Self {
        Self::BadBlob(message.into())
    }

    /// Create a field-lookup error
    pub fn no_such_field(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NoSuchField {
            kind,
            name: name.into(),
        }
    }

    /// Create a bad-URL error
    pub fn bad_url(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::BadUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}
