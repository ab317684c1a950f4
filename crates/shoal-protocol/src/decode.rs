//! Streaming RESP decoder.
//!
//! Two entry points: [`Decoder::decode`] parses one frame of any shape
//! (server replies), [`Decoder::decode_multi_bulk`] parses a client
//! request, accepting both the canonical array-of-bulks form and inline
//! commands (a bare CRLF-terminated line split on spaces).
//!
//! Bulk and text payloads are read through the arena
//! (`read_bytes`/`read_full`) so the returned [`Resp`] owns its bytes
//! independently of the reader's buffer. Length headers are consumed
//! immediately and may borrow the buffer via `read_slice`.
//!
//! The decoder is single-use on failure: after the first error every call
//! reports `use of failed decoder`.

use std::future::Future;
use std::io;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::buf::{BufReader, Slice};
use crate::error::ProtocolError;
use crate::offheap::IoBuf;
use crate::resp::{btoi64, Resp, MAX_ARRAY_LEN, MAX_BULK_LEN};

const DECODE_BUFFER_SIZE: usize = 8192;

// Cap for Vec::with_capacity when a header declares a huge element count;
// the vector still grows to the declared size as elements actually arrive.
const PREALLOC_CAP: usize = 1024;

/// Streaming decoder over any [`AsyncRead`].
#[derive(Debug)]
pub struct Decoder<R> {
    br: BufReader<R>,
    failed: bool,
}

impl<R: AsyncRead + Unpin + Send> Decoder<R> {
    pub fn new(rd: R) -> Decoder<R> {
        Decoder::with_capacity(rd, DECODE_BUFFER_SIZE)
    }

    pub fn with_capacity(rd: R, size: usize) -> Decoder<R> {
        Decoder {
            br: BufReader::with_capacity(rd, size),
            failed: false,
        }
    }

    /// Uses caller-provided buffer storage, e.g. an off-heap slice.
    pub fn with_buffer(rd: R, buf: IoBuf) -> Decoder<R> {
        Decoder {
            br: BufReader::with_buffer(rd, buf),
            failed: false,
        }
    }

    /// Decodes one frame of any shape.
    pub async fn decode(&mut self) -> Result<Resp, ProtocolError> {
        if self.failed {
            return Err(ProtocolError::FailedDecoder);
        }
        match self.decode_resp().await {
            Ok(r) => Ok(r),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    /// Decodes one client request as a list of bulk strings.
    ///
    /// A leading `*` parses as an array whose every element must be a
    /// bulk. Anything else parses as an inline command: one CRLF-terminated
    /// line split on spaces. An all-whitespace line yields no tokens and
    /// fails; whitespace runs between tokens are accepted.
    pub async fn decode_multi_bulk(&mut self) -> Result<Vec<Resp>, ProtocolError> {
        if self.failed {
            return Err(ProtocolError::FailedDecoder);
        }
        match self.decode_multi_bulk_inner().await {
            Ok(multi) => Ok(multi),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    // Arrays recurse; box the future to give it a size.
    fn decode_resp(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Resp, ProtocolError>> + Send + '_>> {
        Box::pin(async move {
            let b = self.br.read_u8().await?;
            match b {
                b'+' => Ok(Resp::Simple(self.decode_text_bytes().await?)),
                b'-' => Ok(Resp::Error(self.decode_text_bytes().await?)),
                b':' => Ok(Resp::Integer(self.decode_text_bytes().await?)),
                b'$' => Ok(Resp::Bulk(self.decode_bulk_bytes().await?)),
                b'*' => Ok(Resp::Array(self.decode_array().await?)),
                other => Err(ProtocolError::BadRespType(other as char)),
            }
        })
    }

    async fn decode_text_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let mut line = self.br.read_bytes(b'\n').await?;
        match line.len().checked_sub(2) {
            Some(n) if line[n] == b'\r' => {
                line.truncate(n);
                Ok(line.freeze())
            }
            _ => Err(ProtocolError::BadCrlfEnd),
        }
    }

    // Length headers are consumed immediately, so borrowing the reader's
    // buffer is fine here.
    async fn decode_int(&mut self) -> Result<i64, ProtocolError> {
        let line = match self.br.read_slice(b'\n').await? {
            Slice::Complete(s) => s,
            Slice::Overflow(_) => {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "buffer full",
                )))
            }
        };
        match line.len().checked_sub(2) {
            Some(n) if line[n] == b'\r' => btoi64(&line[..n]),
            _ => Err(ProtocolError::BadCrlfEnd),
        }
    }

    async fn decode_bulk_bytes(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        let n = self.decode_int().await?;
        match n {
            n if n < -1 => return Err(ProtocolError::BadBulkBytesLen),
            n if n > MAX_BULK_LEN => return Err(ProtocolError::BadBulkBytesLenTooLong),
            -1 => return Ok(None),
            _ => {}
        }
        let n = n as usize;
        let mut payload = self.br.read_full(n + 2).await?;
        if payload[n] != b'\r' || payload[n + 1] != b'\n' {
            return Err(ProtocolError::BadCrlfEnd);
        }
        payload.truncate(n);
        Ok(Some(payload.freeze()))
    }

    async fn decode_array(&mut self) -> Result<Option<Vec<Resp>>, ProtocolError> {
        let n = self.decode_int().await?;
        match n {
            n if n < -1 => return Err(ProtocolError::BadArrayLen),
            n if n > MAX_ARRAY_LEN => return Err(ProtocolError::BadArrayLenTooLong),
            -1 => return Ok(None),
            _ => {}
        }
        let n = n as usize;
        let mut array = Vec::with_capacity(n.min(PREALLOC_CAP));
        for _ in 0..n {
            array.push(self.decode_resp().await?);
        }
        Ok(Some(array))
    }

    async fn decode_multi_bulk_inner(&mut self) -> Result<Vec<Resp>, ProtocolError> {
        if self.br.peek_u8().await? != b'*' {
            return self.decode_single_line_multi_bulk().await;
        }
        self.br.read_u8().await?;
        let n = self.decode_int().await?;
        match n {
            n if n <= 0 => return Err(ProtocolError::BadArrayLen),
            n if n > MAX_ARRAY_LEN => return Err(ProtocolError::BadArrayLenTooLong),
            _ => {}
        }
        let n = n as usize;
        let mut multi = Vec::with_capacity(n.min(PREALLOC_CAP));
        for _ in 0..n {
            let r = self.decode_resp().await?;
            if !r.is_bulk() {
                return Err(ProtocolError::BadMultiBulkContent);
            }
            multi.push(r);
        }
        Ok(multi)
    }

    async fn decode_single_line_multi_bulk(&mut self) -> Result<Vec<Resp>, ProtocolError> {
        let line = self.decode_text_bytes().await?;
        let mut multi = Vec::with_capacity(8);
        let mut l = 0;
        for r in 0..=line.len() {
            if r == line.len() || line[r] == b' ' {
                if l < r {
                    multi.push(Resp::Bulk(Some(line.slice(l..r))));
                }
                l = r + 1;
            }
        }
        if multi.is_empty() {
            return Err(ProtocolError::BadMultiBulkLen);
        }
        Ok(multi)
    }
}

/// Decodes one frame from a byte slice.
pub async fn decode_from_bytes(p: &[u8]) -> Result<Resp, ProtocolError> {
    Decoder::new(p).decode().await
}

/// Decodes one client request from a byte slice.
pub async fn decode_multi_bulk_from_bytes(p: &[u8]) -> Result<Vec<Resp>, ProtocolError> {
    Decoder::new(p).decode_multi_bulk().await
}
