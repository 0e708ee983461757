//! Error types for the certificate issuance service.
//!
//! This module defines the central `Error` enum shared by the server and the
//! client. The `Display` text of each variant is what travels inside an error
//! frame, so the wording is part of the wire contract.
//!
//! ## Error Cases
//! - `NameTooLong`, `EmptyName`, `InvalidName`: the request was malformed.
//! - `Generation`: key generation or signing failed for a subject.
//! - `Cancelled`: a queued or running job was dropped during shutdown.
//! - `Busy`: the worker pool refused the job (admission limit reached).
//! - `ServiceShutdown`: a request arrived while the service was stopping.
//! - `UnknownStatus`, `Truncated`, `FieldTooLarge`, `Io`: a response frame
//!   could not be read.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the issuance service.
///
/// The enum is `Clone` because a single failed generation is delivered to
/// every connection waiting on the same subject name.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The subject name exceeded the maximum length before or at the
    /// delimiter.
    #[error("Name too long")]
    NameTooLong { len: usize, max: usize },

    /// The request consisted of the delimiter alone.
    #[error("Name is empty")]
    EmptyName,

    /// The subject name contained bytes outside printable ASCII.
    #[error("Name must be printable ASCII")]
    InvalidName,

    /// The signing service failed to produce a key pair or certificate.
    #[error("Key generation failed: {reason}")]
    Generation { reason: String },

    /// The job was cancelled before it could report a result.
    #[error("Key generation cancelled")]
    Cancelled,

    /// The pool has reached its admission limit.
    #[error("Server busy: {pending} jobs pending")]
    Busy { pending: usize },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// A response frame started with a status byte other than 0 or 1.
    #[error("Unknown response status: {0}")]
    UnknownStatus(u8),

    /// The peer closed the stream before a complete frame arrived.
    #[error("Truncated frame: missing {context}")]
    Truncated { context: &'static str },

    /// A length prefix announced more bytes than a response field may hold.
    #[error("Frame field too large: {len} bytes")]
    FieldTooLarge { len: usize },

    /// Any other transport failure while reading or writing a frame.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Returns `true` for errors caused by a malformed request.
    pub const fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::NameTooLong { .. } | Self::EmptyName | Self::InvalidName
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
