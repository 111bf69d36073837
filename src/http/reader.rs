//! Cursor-based buffered reader shared by every parser in the crate.

use crate::errors::{Error, Result};
use memchr::memchr;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::timeout,
};

const DEFAULT_CHUNK: usize = 8 * 1024;

/// Growable read buffer with a consume cursor.
///
/// Consumed bytes are not removed immediately: the cursor moves forward and
/// the buffer is compacted lazily, on the next [`fill`](Self::fill), once the
/// consumed prefix is at least half of the buffer. Repeated small consumes
/// therefore cost `O(1)` each.
///
/// [`fill`](Self::fill) only awaits a single `read_buf` and is cancel-safe:
/// dropping it never loses bytes already read from the socket.
#[derive(Debug)]
pub struct BufferedReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    chunk: usize,
    timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> BufferedReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_chunk(inner, DEFAULT_CHUNK)
    }

    /// Creates a reader that asks the source for up to `chunk` bytes per read.
    pub fn with_chunk(inner: R, chunk: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(chunk),
            pos: 0,
            chunk: chunk.max(1),
            timeout: None,
        }
    }

    /// Rebuilds a reader from [`into_parts`](Self::into_parts) output,
    /// possibly around a different source type.
    pub fn from_parts(inner: R, buf: Vec<u8>, chunk: usize) -> Self {
        Self {
            inner,
            buf,
            pos: 0,
            chunk: chunk.max(1),
            timeout: None,
        }
    }

    /// Bounds every socket read by `time`. A read that takes longer fails
    /// with [`Error::Timeout`].
    #[inline]
    pub fn set_timeout(&mut self, time: Option<Duration>) {
        self.timeout = time;
    }

    /// Bytes read from the source but not consumed yet.
    #[inline(always)]
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Marks `n` buffered bytes as consumed.
    #[inline(always)]
    pub fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buf.len());
    }

    /// Reads once from the source, appending to the buffer.
    ///
    /// Returns the number of new bytes; `0` means end of stream.
    pub async fn fill(&mut self) -> Result<usize> {
        if self.pos > 0 && self.pos >= self.buf.len() / 2 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.reserve(self.chunk);

        let read = self.inner.read_buf(&mut self.buf);
        let n = match self.timeout {
            Some(time) => timeout(time, read).await??,
            None => read.await?,
        };

        Ok(n)
    }

    /// Fills until at least `n` bytes are buffered.
    ///
    /// Fails with [`Error::ConnectionClosed`] if the source ends first.
    pub async fn ensure(&mut self, n: usize) -> Result<()> {
        while self.buf.len() - self.pos < n {
            if self.fill().await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Reads one line and returns it without the trailing `\n` / `\r\n`.
    ///
    /// Fails with [`Error::LineTooLong`] once `max` bytes have been seen
    /// without a line feed, and with [`Error::ConnectionClosed`] if the
    /// source ends before one.
    pub async fn read_line(&mut self, max: usize) -> Result<&[u8]> {
        let mut scanned = 0;

        loop {
            if let Some(index) = memchr(b'\n', &self.buf[self.pos + scanned..]) {
                let start = self.pos;
                let newline = start + scanned + index;
                let end = match newline > start && self.buf[newline - 1] == b'\r' {
                    true => newline - 1,
                    false => newline,
                };
                if end - start > max {
                    return Err(Error::LineTooLong(max));
                }

                self.pos = newline + 1;
                return Ok(&self.buf[start..end]);
            }

            // One extra byte for a CR waiting on its LF
            scanned = self.buf.len() - self.pos;
            if scanned > max + 1 {
                return Err(Error::LineTooLong(max));
            }
            if self.fill().await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Reads exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize) -> Result<&[u8]> {
        self.ensure(n).await?;

        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..start + n])
    }

    /// Returns between `1` and `max` bytes, reading from the source only if
    /// nothing is buffered.
    pub async fn read_chunk(&mut self, max: usize) -> Result<&[u8]> {
        if self.pos == self.buf.len() && self.fill().await? == 0 {
            return Err(Error::ConnectionClosed);
        }

        let start = self.pos;
        let len = (self.buf.len() - start).min(max);
        self.pos += len;
        Ok(&self.buf[start..start + len])
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Returns the source and whatever was buffered but not consumed.
    pub fn into_parts(mut self) -> (R, Vec<u8>) {
        self.buf.drain(..self.pos);
        (self.inner, self.buf)
    }
}
