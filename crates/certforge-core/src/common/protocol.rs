//! # Wire protocol
//!
//! Byte-level framing shared by the server and the client. The protocol is
//! strictly one request per connection and carries no version field.
//!
//! ## Request
//!
//! ```text
//! <ASCII subject name><0x00>
//! ```
//!
//! There is no length prefix: the delimiter terminates the name. A buffered
//! prefix that grows past [`MAX_NAME_LEN`] without a delimiter is rejected
//! immediately, without waiting for more data.
//!
//! ## Response
//!
//! ```text
//! success: 0x00 <u32 BE len><private key PEM> <u32 BE len><certificate PEM>
//! error:   0x01 <u32 BE len><UTF-8 message>
//! ```
//!
//! The server closes the connection once the frame is fully written.

use crate::{Error, IssuedPair, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum accepted subject name length, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Byte that terminates a request.
pub const REQUEST_DELIMITER: u8 = 0x00;

/// Status byte of a successful response.
pub const STATUS_OK: u8 = 0;

/// Status byte of an error response.
pub const STATUS_ERROR: u8 = 1;

/// Upper bound on a single length-prefixed response field.
///
/// PEM blobs for the largest supported RSA keys stay well below this; the
/// bound only protects readers from absurd allocations.
pub const MAX_FIELD_LEN: usize = 1 << 20;

const LEN_PREFIX: usize = size_of::<u32>();

/// Scans a partially received request.
///
/// Returns `Ok(None)` while the delimiter has not arrived and the buffered
/// prefix is still within `max_len`. Bytes following the delimiter are
/// ignored.
///
/// # Errors
///
/// - [`Error::NameTooLong`] once more than `max_len` bytes are buffered
///   without a delimiter, or when the delimited name is longer than
///   `max_len`.
/// - [`Error::EmptyName`] for a bare delimiter.
/// - [`Error::InvalidName`] for bytes outside printable ASCII.
pub fn scan_request(buf: &[u8], max_len: usize) -> Result<Option<String>> {
    match buf.iter().position(|&b| b == REQUEST_DELIMITER) {
        Some(end) => validate_name(&buf[..end], max_len).map(Some),
        None if buf.len() > max_len => Err(Error::NameTooLong {
            len: buf.len(),
            max: max_len,
        }),
        None => Ok(None),
    }
}

fn validate_name(raw: &[u8], max_len: usize) -> Result<String> {
    if raw.is_empty() {
        return Err(Error::EmptyName);
    }
    if raw.len() > max_len {
        return Err(Error::NameTooLong {
            len: raw.len(),
            max: max_len,
        });
    }
    if !raw.iter().all(|b| (0x20..=0x7e).contains(b)) {
        return Err(Error::InvalidName);
    }
    // Printable ASCII is always valid UTF-8.
    Ok(raw.iter().map(|&b| b as char).collect())
}

/// Encodes a request frame for `name`, applying the same rules the server
/// enforces.
pub fn encode_request(name: &str) -> Result<Bytes> {
    validate_name(name.as_bytes(), MAX_NAME_LEN)?;
    let mut buf = BytesMut::with_capacity(name.len() + 1);
    buf.put_slice(name.as_bytes());
    buf.put_u8(REQUEST_DELIMITER);
    Ok(buf.freeze())
}

/// A decoded response frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Issued {
        private_key: Bytes,
        certificate: Bytes,
    },
    Failed {
        message: String,
    },
}

impl Response {
    /// Builds the error frame for `err`; the message is its `Display` text.
    pub fn from_error(err: &Error) -> Self {
        Self::Failed {
            message: err.to_string(),
        }
    }

    /// Returns the exact number of bytes [`encode`](Self::encode) emits.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Issued {
                private_key,
                certificate,
            } => 1 + LEN_PREFIX + private_key.len() + LEN_PREFIX + certificate.len(),
            Self::Failed { message } => 1 + LEN_PREFIX + message.len(),
        }
    }

    /// Serializes the frame into a single contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match self {
            Self::Issued {
                private_key,
                certificate,
            } => {
                buf.put_u8(STATUS_OK);
                put_field(&mut buf, private_key);
                put_field(&mut buf, certificate);
            }
            Self::Failed { message } => {
                buf.put_u8(STATUS_ERROR);
                put_field(&mut buf, message.as_bytes());
            }
        }
        buf.freeze()
    }

    /// Decodes a complete frame from `buf`, advancing it past the frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Truncated`] if `buf` ends early,
    /// [`Error::UnknownStatus`] for an unrecognized status byte, and
    /// [`Error::FieldTooLarge`] for an oversized length prefix.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(Error::Truncated { context: "status" });
        }
        match buf.get_u8() {
            STATUS_OK => {
                let private_key = take_field(buf, "private key")?;
                let certificate = take_field(buf, "certificate")?;
                Ok(Self::Issued {
                    private_key,
                    certificate,
                })
            }
            STATUS_ERROR => {
                let message = take_field(buf, "error message")?;
                Ok(Self::Failed {
                    message: String::from_utf8_lossy(&message).into_owned(),
                })
            }
            other => Err(Error::UnknownStatus(other)),
        }
    }

    /// Reads one frame from an async stream.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let status = reader
            .read_u8()
            .await
            .map_err(|e| eof_as_truncated(e, "status"))?;
        match status {
            STATUS_OK => {
                let private_key = read_field(reader, "private key").await?;
                let certificate = read_field(reader, "certificate").await?;
                Ok(Self::Issued {
                    private_key,
                    certificate,
                })
            }
            STATUS_ERROR => {
                let message = read_field(reader, "error message").await?;
                Ok(Self::Failed {
                    message: String::from_utf8_lossy(&message).into_owned(),
                })
            }
            other => Err(Error::UnknownStatus(other)),
        }
    }
}

impl From<IssuedPair> for Response {
    fn from(pair: IssuedPair) -> Self {
        Self::Issued {
            private_key: pair.private_key,
            certificate: pair.certificate,
        }
    }
}

impl From<&Result<IssuedPair>> for Response {
    fn from(result: &Result<IssuedPair>) -> Self {
        match result {
            Ok(pair) => pair.clone().into(),
            Err(e) => Self::from_error(e),
        }
    }
}

fn put_field(buf: &mut BytesMut, field: &[u8]) {
    // Fields are PEM blobs or short messages; they never approach 4 GiB.
    buf.put_u32(field.len() as u32);
    buf.put_slice(field);
}

fn check_field_len(len: usize) -> Result<usize> {
    if len > MAX_FIELD_LEN {
        return Err(Error::FieldTooLarge { len });
    }
    Ok(len)
}

fn take_field(buf: &mut impl Buf, context: &'static str) -> Result<Bytes> {
    if buf.remaining() < LEN_PREFIX {
        return Err(Error::Truncated { context });
    }
    let len = check_field_len(buf.get_u32() as usize)?;
    if buf.remaining() < len {
        return Err(Error::Truncated { context });
    }
    Ok(buf.copy_to_bytes(len))
}

async fn read_field<R>(reader: &mut R, context: &'static str) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = reader
        .read_u32()
        .await
        .map_err(|e| eof_as_truncated(e, context))?;
    let len = check_field_len(len as usize)?;
    let mut field = vec![0_u8; len];
    reader
        .read_exact(&mut field)
        .await
        .map_err(|e| eof_as_truncated(e, context))?;
    Ok(Bytes::from(field))
}

fn eof_as_truncated(err: std::io::Error, context: &'static str) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Truncated { context }
    } else {
        err.into()
    }
}
