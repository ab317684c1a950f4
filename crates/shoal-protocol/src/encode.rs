//! RESP encoder.
//!
//! Writes the bit-exact wire form of a [`Resp`] into a buffered writer.
//! Like the decoder, an encoder that has failed once refuses further use.
//!
//! [`FlushEncoder`] adds adaptive batching for the pipelining hot path:
//! requests accumulate in the write buffer and a real flush happens only
//! when forced, when enough requests are buffered, or when the last flush
//! was long enough ago.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::io::AsyncWrite;

use crate::buf::BufWriter;
use crate::error::ProtocolError;
use crate::offheap::IoBuf;
use crate::resp::Resp;

const ENCODE_BUFFER_SIZE: usize = 8192;

const CRLF: &[u8] = b"\r\n";

/// Streaming encoder over any [`AsyncWrite`].
#[derive(Debug)]
pub struct Encoder<W> {
    bw: BufWriter<W>,
    failed: bool,
}

impl<W: AsyncWrite + Unpin + Send> Encoder<W> {
    pub fn new(wr: W) -> Encoder<W> {
        Encoder::with_capacity(wr, ENCODE_BUFFER_SIZE)
    }

    pub fn with_capacity(wr: W, size: usize) -> Encoder<W> {
        Encoder {
            bw: BufWriter::with_capacity(wr, size),
            failed: false,
        }
    }

    /// Uses caller-provided buffer storage, e.g. an off-heap slice.
    pub fn with_buffer(wr: W, buf: IoBuf) -> Encoder<W> {
        Encoder {
            bw: BufWriter::with_buffer(wr, buf),
            failed: false,
        }
    }

    /// Consumes the encoder, returning the underlying writer. Unflushed
    /// bytes are discarded.
    pub fn into_inner(self) -> W {
        self.bw.into_inner()
    }

    /// Encodes one frame, optionally flushing afterwards.
    pub async fn encode(&mut self, r: &Resp, flush: bool) -> Result<(), ProtocolError> {
        if self.failed {
            return Err(ProtocolError::FailedEncoder);
        }
        let result = async {
            self.encode_resp(r).await?;
            if flush {
                self.bw.flush().await?;
            }
            Ok(())
        }
        .await;
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    /// Encodes a request as an array of frames, optionally flushing.
    pub async fn encode_multi_bulk(
        &mut self,
        multi: &[Resp],
        flush: bool,
    ) -> Result<(), ProtocolError> {
        if self.failed {
            return Err(ProtocolError::FailedEncoder);
        }
        let result = async {
            self.encode_array_header(multi.len() as i64).await?;
            for r in multi {
                self.encode_resp(r).await?;
            }
            if flush {
                self.bw.flush().await?;
            }
            Ok(())
        }
        .await;
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    /// Flushes queued bytes to the underlying writer.
    pub async fn flush(&mut self) -> Result<(), ProtocolError> {
        if self.failed {
            return Err(ProtocolError::FailedEncoder);
        }
        match self.bw.flush().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.failed = true;
                Err(e.into())
            }
        }
    }

    // Arrays recurse; box the future to give it a size.
    fn encode_resp<'a>(
        &'a mut self,
        r: &'a Resp,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProtocolError>> + Send + 'a>> {
        Box::pin(async move {
            match r {
                Resp::Simple(v) => self.encode_text(b'+', v).await,
                Resp::Error(v) => self.encode_text(b'-', v).await,
                Resp::Integer(v) => self.encode_text(b':', v).await,
                Resp::Bulk(None) => Ok(self.bw.write(b"$-1\r\n").await?),
                Resp::Bulk(Some(v)) => {
                    self.bw.write_u8(b'$').await?;
                    self.encode_len(v.len() as i64).await?;
                    self.bw.write(v).await?;
                    Ok(self.bw.write(CRLF).await?)
                }
                Resp::Array(None) => Ok(self.bw.write(b"*-1\r\n").await?),
                Resp::Array(Some(items)) => {
                    self.encode_array_header(items.len() as i64).await?;
                    for item in items {
                        self.encode_resp(item).await?;
                    }
                    Ok(())
                }
            }
        })
    }

    async fn encode_text(&mut self, prefix: u8, v: &[u8]) -> Result<(), ProtocolError> {
        self.bw.write_u8(prefix).await?;
        self.bw.write(v).await?;
        Ok(self.bw.write(CRLF).await?)
    }

    async fn encode_array_header(&mut self, n: i64) -> Result<(), ProtocolError> {
        self.bw.write_u8(b'*').await?;
        self.encode_len(n).await
    }

    async fn encode_len(&mut self, n: i64) -> Result<(), ProtocolError> {
        let mut buf = itoa::Buffer::new();
        self.bw.write(buf.format(n).as_bytes()).await?;
        Ok(self.bw.write(CRLF).await?)
    }
}

/// Encodes one frame to a fresh byte vector.
pub async fn encode_to_bytes(r: &Resp) -> Result<Vec<u8>, ProtocolError> {
    let mut enc = Encoder::new(Vec::new());
    enc.encode(r, true).await?;
    Ok(enc.into_inner())
}

/// Batching wrapper around [`Encoder`] for the pipelining hot path.
///
/// `flush(force)` performs a real flush when forced, when `max_buffered`
/// requests have accumulated, or when `max_interval` has elapsed since the
/// last real flush. The writer loop forces a flush whenever its input
/// queue momentarily drains.
#[derive(Debug)]
pub struct FlushEncoder<W> {
    enc: Encoder<W>,
    pub max_interval: Duration,
    pub max_buffered: usize,
    nbuffered: usize,
    last_flush: Instant,
}

impl<W: AsyncWrite + Unpin + Send> FlushEncoder<W> {
    pub fn new(enc: Encoder<W>) -> FlushEncoder<W> {
        FlushEncoder {
            enc,
            max_interval: Duration::ZERO,
            max_buffered: 0,
            nbuffered: 0,
            last_flush: Instant::now(),
        }
    }

    /// Queues one request without flushing.
    pub async fn encode_multi_bulk(&mut self, multi: &[Resp]) -> Result<(), ProtocolError> {
        self.enc.encode_multi_bulk(multi, false).await?;
        self.nbuffered += 1;
        Ok(())
    }

    pub async fn flush(&mut self, force: bool) -> Result<(), ProtocolError> {
        if force
            || self.nbuffered >= self.max_buffered
            || self.last_flush.elapsed() >= self.max_interval
        {
            self.enc.flush().await?;
            self.nbuffered = 0;
            self.last_flush = Instant::now();
        }
        Ok(())
    }
}
