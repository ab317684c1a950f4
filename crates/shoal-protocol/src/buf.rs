//! Buffered reader and writer for the RESP codec.
//!
//! The reader keeps a linear buffer with two cursors, `rpos <= wpos`.
//! Unread bytes live in `buf[rpos..wpos]`; a fill first compacts them to
//! the front and then issues exactly one underlying read. Because the
//! buffer is linear rather than a ring, [`BufReader::read_slice`] can hand
//! out a contiguous borrow of the internal buffer with no copy.
//!
//! Both reader and writer have sticky errors: after the first failure the
//! cursors freeze and every later call reports the same error.
//!
//! Decoded payloads that must outlive the next fill go through
//! [`SliceAlloc`], a small bump arena carving from a shared block.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::offheap::IoBuf;

pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Bump arena for decoded payloads.
///
/// Requests of 512 bytes or more get a fresh allocation. Smaller requests
/// carve from an 8 KiB block with `split_to`, so the returned region shares
/// the block's allocation but is independently owned and survives any
/// number of later reads.
#[derive(Debug, Default)]
pub struct SliceAlloc {
    block: BytesMut,
}

impl SliceAlloc {
    const BLOCK_SIZE: usize = 8192;
    const FRESH_MIN: usize = 512;

    /// Returns a zeroed region of length `n`, ready to be overwritten.
    pub fn make(&mut self, n: usize) -> BytesMut {
        if n == 0 {
            return BytesMut::new();
        }
        if n >= Self::FRESH_MIN {
            return BytesMut::zeroed(n);
        }
        if self.block.len() < n {
            self.block = BytesMut::zeroed(Self::BLOCK_SIZE);
        }
        self.block.split_to(n)
    }
}

/// A `read_slice` result. `Complete` includes the delimiter and borrows
/// the internal buffer, valid only until the next read call. `Overflow`
/// means the buffer filled without finding the delimiter; it carries the
/// discarded contents and the read position has advanced past them.
#[derive(Debug, PartialEq, Eq)]
pub enum Slice<'a> {
    Complete(&'a [u8]),
    Overflow(&'a [u8]),
}

// Sticky errors are re-reported on every call after the first failure.
// io::Error does not implement Clone, so remember enough to rebuild it.
#[derive(Debug)]
struct StickyError {
    kind: io::ErrorKind,
    message: String,
}

impl StickyError {
    fn capture(err: &io::Error) -> StickyError {
        StickyError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    fn to_io(&self) -> io::Error {
        io::Error::new(self.kind, self.message.clone())
    }
}

fn unexpected_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected end of stream")
}

/// Buffered reader over an [`AsyncRead`].
#[derive(Debug)]
pub struct BufReader<R> {
    rd: R,
    buf: IoBuf,
    rpos: usize,
    wpos: usize,
    err: Option<StickyError>,
    slice: SliceAlloc,
}

impl<R: AsyncRead + Unpin> BufReader<R> {
    pub fn new(rd: R) -> BufReader<R> {
        BufReader::with_capacity(rd, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(rd: R, size: usize) -> BufReader<R> {
        let size = if size == 0 { DEFAULT_BUFFER_SIZE } else { size };
        BufReader::with_buffer(rd, IoBuf::heap(size))
    }

    /// Uses caller-provided storage, e.g. an off-heap slice.
    pub fn with_buffer(rd: R, buf: IoBuf) -> BufReader<R> {
        let buf = if buf.is_empty() {
            IoBuf::heap(DEFAULT_BUFFER_SIZE)
        } else {
            buf
        };
        BufReader {
            rd,
            buf,
            rpos: 0,
            wpos: 0,
            err: None,
            slice: SliceAlloc::default(),
        }
    }

    fn buffered(&self) -> usize {
        self.wpos - self.rpos
    }

    fn check(&self) -> io::Result<()> {
        match &self.err {
            Some(e) => Err(e.to_io()),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: io::Error) -> io::Error {
        self.err = Some(StickyError::capture(&err));
        err
    }

    /// Compacts unread bytes to the front, then issues exactly one
    /// underlying read. A zero-byte read means the stream ended and
    /// becomes the sticky error.
    async fn fill(&mut self) -> io::Result<()> {
        if self.rpos > 0 {
            self.buf.copy_within(self.rpos..self.wpos, 0);
            self.wpos -= self.rpos;
            self.rpos = 0;
        }
        let n = match self.rd.read(&mut self.buf[self.wpos..]).await {
            Ok(n) => n,
            Err(e) => return Err(self.fail(e)),
        };
        if n == 0 {
            return Err(self.fail(unexpected_eof()));
        }
        self.wpos += n;
        Ok(())
    }

    /// Standard streaming read. Bypasses the buffer when it is empty and
    /// `p` is at least as large as the buffer itself.
    pub async fn read(&mut self, p: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        if p.is_empty() {
            return Ok(0);
        }
        if self.buffered() == 0 {
            if p.len() >= self.buf.len() {
                let n = match self.rd.read(p).await {
                    Ok(n) => n,
                    Err(e) => return Err(self.fail(e)),
                };
                if n == 0 {
                    return Err(self.fail(unexpected_eof()));
                }
                return Ok(n);
            }
            self.fill().await?;
        }
        let n = p.len().min(self.buffered());
        p[..n].copy_from_slice(&self.buf[self.rpos..self.rpos + n]);
        self.rpos += n;
        Ok(n)
    }

    pub async fn read_u8(&mut self) -> io::Result<u8> {
        self.check()?;
        if self.buffered() == 0 {
            self.fill().await?;
        }
        let c = self.buf[self.rpos];
        self.rpos += 1;
        Ok(c)
    }

    /// Returns the next byte without consuming it.
    pub async fn peek_u8(&mut self) -> io::Result<u8> {
        self.check()?;
        if self.buffered() == 0 {
            self.fill().await?;
        }
        Ok(self.buf[self.rpos])
    }

    // Range form of read_slice so callers can copy out of the buffer
    // without holding a borrow across the arena.
    async fn read_slice_range(
        &mut self,
        delim: u8,
    ) -> io::Result<(std::ops::Range<usize>, bool)> {
        self.check()?;
        loop {
            if let Some(idx) = memchr::memchr(delim, &self.buf[self.rpos..self.wpos]) {
                let limit = self.rpos + idx + 1;
                let range = self.rpos..limit;
                self.rpos = limit;
                return Ok((range, true));
            }
            if self.buffered() == self.buf.len() {
                // full buffer, no delimiter: discard the overrun
                let range = self.rpos..self.wpos;
                self.rpos = self.wpos;
                return Ok((range, false));
            }
            self.fill().await?;
        }
    }

    /// Returns a borrow of the internal buffer up to and including the
    /// first `delim`. The borrow is valid only until the next read call.
    pub async fn read_slice(&mut self, delim: u8) -> io::Result<Slice<'_>> {
        let (range, complete) = self.read_slice_range(delim).await?;
        let s = &self.buf[range];
        if complete {
            Ok(Slice::Complete(s))
        } else {
            Ok(Slice::Overflow(s))
        }
    }

    /// Like [`read_slice`](BufReader::read_slice), but returns an
    /// arena-backed region that survives later reads. Overflowed fragments
    /// are stitched together until the delimiter is found.
    pub async fn read_bytes(&mut self, delim: u8) -> io::Result<BytesMut> {
        let (range, complete) = self.read_slice_range(delim).await?;
        if complete {
            let mut out = self.slice.make(range.len());
            out.copy_from_slice(&self.buf[range]);
            return Ok(out);
        }
        let mut frags: Vec<BytesMut> = Vec::new();
        let mut size = range.len();
        let mut dup = self.slice.make(range.len());
        dup.copy_from_slice(&self.buf[range]);
        frags.push(dup);
        loop {
            let (range, complete) = self.read_slice_range(delim).await?;
            size += range.len();
            if complete {
                let mut out = self.slice.make(size);
                let mut n = 0;
                for frag in &frags {
                    out[n..n + frag.len()].copy_from_slice(frag);
                    n += frag.len();
                }
                out[n..].copy_from_slice(&self.buf[range]);
                return Ok(out);
            }
            let mut dup = self.slice.make(range.len());
            dup.copy_from_slice(&self.buf[range]);
            frags.push(dup);
        }
    }

    /// Reads exactly `n` bytes into an arena-backed region, failing with
    /// `UnexpectedEof` if the stream ends early.
    pub async fn read_full(&mut self, n: usize) -> io::Result<BytesMut> {
        self.check()?;
        if n == 0 {
            return Ok(BytesMut::new());
        }
        let mut out = self.slice.make(n);
        let mut filled = 0;
        while filled < n {
            filled += self.read(&mut out[filled..]).await?;
        }
        Ok(out)
    }
}

/// Buffered writer over an [`AsyncWrite`].
#[derive(Debug)]
pub struct BufWriter<W> {
    wr: W,
    buf: IoBuf,
    wpos: usize,
    err: Option<StickyError>,
}

impl<W: AsyncWrite + Unpin> BufWriter<W> {
    pub fn new(wr: W) -> BufWriter<W> {
        BufWriter::with_capacity(wr, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(wr: W, size: usize) -> BufWriter<W> {
        let size = if size == 0 { DEFAULT_BUFFER_SIZE } else { size };
        BufWriter::with_buffer(wr, IoBuf::heap(size))
    }

    /// Uses caller-provided storage, e.g. an off-heap slice.
    pub fn with_buffer(wr: W, buf: IoBuf) -> BufWriter<W> {
        let buf = if buf.is_empty() {
            IoBuf::heap(DEFAULT_BUFFER_SIZE)
        } else {
            buf
        };
        BufWriter {
            wr,
            buf,
            wpos: 0,
            err: None,
        }
    }

    /// The underlying writer.
    pub fn get_ref(&self) -> &W {
        &self.wr
    }

    /// Consumes the buffer, returning the underlying writer. Queued bytes
    /// that were never flushed are discarded.
    pub fn into_inner(self) -> W {
        self.wr
    }

    fn available(&self) -> usize {
        self.buf.len() - self.wpos
    }

    fn check(&self) -> io::Result<()> {
        match &self.err {
            Some(e) => Err(e.to_io()),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: io::Error) -> io::Error {
        self.err = Some(StickyError::capture(&err));
        err
    }

    fn short_write(&mut self) -> io::Error {
        self.fail(io::Error::new(io::ErrorKind::WriteZero, "short write"))
    }

    // Writes a whole slice through the underlying writer, bypassing the
    // buffer. A zero-length write is a short write.
    async fn write_direct(&mut self, p: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < p.len() {
            let n = match self.wr.write(&p[written..]).await {
                Ok(n) => n,
                Err(e) => return Err(self.fail(e)),
            };
            if n == 0 {
                return Err(self.short_write());
            }
            written += n;
        }
        Ok(())
    }

    async fn flush_buf(&mut self) -> io::Result<()> {
        if self.wpos == 0 {
            return Ok(());
        }
        let mut written = 0;
        while written < self.wpos {
            let n = match self.wr.write(&self.buf[written..self.wpos]).await {
                Ok(n) => n,
                Err(e) => return Err(self.fail(e)),
            };
            if n == 0 {
                return Err(self.short_write());
            }
            written += n;
        }
        self.wpos = 0;
        Ok(())
    }

    /// Flushes queued bytes. A no-op when nothing is queued.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        self.flush_buf().await?;
        match self.wr.flush().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub async fn write(&mut self, p: &[u8]) -> io::Result<()> {
        self.check()?;
        let mut p = p;
        while p.len() > self.available() {
            if self.wpos == 0 {
                // nothing queued and p exceeds the whole buffer
                return self.write_direct(p).await;
            }
            let n = self.available();
            self.buf[self.wpos..self.wpos + n].copy_from_slice(&p[..n]);
            self.wpos += n;
            self.flush_buf().await?;
            p = &p[n..];
        }
        if !p.is_empty() {
            self.buf[self.wpos..self.wpos + p.len()].copy_from_slice(p);
            self.wpos += p.len();
        }
        Ok(())
    }

    /// Queues one byte, flushing first only when the buffer is full.
    pub async fn write_u8(&mut self, c: u8) -> io::Result<()> {
        self.check()?;
        if self.available() == 0 {
            self.flush_buf().await?;
        }
        self.buf[self.wpos] = c;
        self.wpos += 1;
        Ok(())
    }
}
