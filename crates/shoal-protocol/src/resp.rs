//! RESP frame types.
//!
//! [`Resp`] is the decoded form of a single RESP frame. Payloads use
//! `Bytes` so a decoded value owns a reference-counted region that is
//! independent of the network buffer it was parsed from. Integers keep
//! their raw ASCII form and are parsed on demand with [`btoi64`]; most
//! integer replies are forwarded verbatim and never need the parse.

use bytes::Bytes;

use crate::error::ProtocolError;

/// Maximum length of a bulk string in bytes (512 MiB, matching the servers
/// this proxy fronts).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Maximum number of elements in an array.
pub const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// A single decoded RESP frame.
///
/// Bulk strings and arrays have a distinct null form (`$-1\r\n`, `*-1\r\n`)
/// which is not the same as empty; both are represented with `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resp {
    /// Simple string reply, e.g. `+OK\r\n`.
    Simple(Bytes),

    /// Error reply, e.g. `-ERR unknown command\r\n`.
    Error(Bytes),

    /// Integer reply, e.g. `:42\r\n`. Kept as raw ASCII digits.
    Integer(Bytes),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`. `None` is the
    /// null bulk.
    Bulk(Option<Bytes>),

    /// Array of frames, e.g. `*2\r\n+a\r\n+b\r\n`. `None` is the null
    /// array.
    Array(Option<Vec<Resp>>),
}

impl Resp {
    /// Builds a bulk frame from anything byte-like.
    pub fn bulk(data: impl Into<Bytes>) -> Resp {
        Resp::Bulk(Some(data.into()))
    }

    /// Builds a simple string frame.
    pub fn simple(data: impl Into<Bytes>) -> Resp {
        Resp::Simple(data.into())
    }

    /// Builds an error frame.
    pub fn error(data: impl Into<Bytes>) -> Resp {
        Resp::Error(data.into())
    }

    /// Builds an integer frame from a value.
    pub fn int(n: i64) -> Resp {
        let mut buf = itoa::Buffer::new();
        Resp::Integer(Bytes::copy_from_slice(buf.format(n).as_bytes()))
    }

    /// The null bulk string (`$-1\r\n`).
    pub fn null_bulk() -> Resp {
        Resp::Bulk(None)
    }

    /// The null array (`*-1\r\n`).
    pub fn null_array() -> Resp {
        Resp::Array(None)
    }

    /// Builds an array frame from elements.
    pub fn array(items: Vec<Resp>) -> Resp {
        Resp::Array(Some(items))
    }

    pub fn is_simple(&self) -> bool {
        matches!(self, Resp::Simple(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Resp::Error(_))
    }

    pub fn is_bulk(&self) -> bool {
        matches!(self, Resp::Bulk(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Resp::Array(_))
    }

    /// The frame's shape, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Resp::Simple(_) => "string",
            Resp::Error(_) => "error",
            Resp::Integer(_) => "int",
            Resp::Bulk(_) => "bulkbytes",
            Resp::Array(_) => "array",
        }
    }

    /// The payload of an error frame, if this is one.
    pub fn error_payload(&self) -> Option<&Bytes> {
        match self {
            Resp::Error(v) => Some(v),
            _ => None,
        }
    }

    /// Parses an integer frame's raw payload.
    pub fn as_int(&self) -> Result<i64, ProtocolError> {
        match self {
            Resp::Integer(v) => btoi64(v),
            _ => Err(ProtocolError::InvalidInt),
        }
    }
}

/// Parses ASCII decimal bytes into an `i64`.
///
/// The fast path handles an optional sign plus up to nine digits without
/// overflow checks; anything longer (or rejected by the fast path) falls
/// through to a generic checked 64-bit parse.
pub fn btoi64(b: &[u8]) -> Result<i64, ProtocolError> {
    if !b.is_empty() && b.len() < 10 {
        let (neg, mut i) = match b[0] {
            b'-' => (true, 1),
            b'+' => (false, 1),
            _ => (false, 0),
        };
        if i != b.len() {
            let mut n: i64 = 0;
            while i < b.len() && b[i].is_ascii_digit() {
                n = n * 10 + i64::from(b[i] - b'0');
                i += 1;
            }
            if i == b.len() {
                return Ok(if neg { -n } else { n });
            }
        }
    }
    std::str::from_utf8(b)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(ProtocolError::InvalidInt)
}
