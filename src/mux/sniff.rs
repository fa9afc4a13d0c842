//! Non-destructive lookahead over a byte stream.
//!
//! [`SniffedStream`] buffers whatever is read while matchers inspect a
//! connection and replays those bytes to the eventual reader before touching
//! the underlying stream again.

use crate::mux::error::SniffError;
use bytes::{Buf, BytesMut};
use pin_project_lite::pin_project;
use std::io;
use std::ops::Range;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Default cap on bytes buffered while sniffing.
pub const DEFAULT_SNIFF_LIMIT: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

pin_project! {
    /// A stream whose leading bytes can be peeked any number of times.
    #[derive(Debug)]
    pub struct SniffedStream<S> {
        #[pin]
        inner: S,
        buffer: BytesMut,
        limit: usize,
    }
}

impl<S> SniffedStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_limit(inner, DEFAULT_SNIFF_LIMIT)
    }

    /// Wrap `inner`, refusing to buffer more than `limit` bytes.
    pub fn with_limit(inner: S, limit: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            limit,
        }
    }

    /// Bytes read from the stream but not yet consumed by a reader.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Remove `range` from the buffered bytes so no reader ever sees it.
    pub fn discard(&mut self, range: Range<usize>) {
        let end = range.end.min(self.buffer.len());
        let start = range.start.min(end);
        let tail = self.buffer.split_off(end);
        self.buffer.truncate(start);
        self.buffer.extend_from_slice(&tail);
    }

    /// Split into the raw stream and the bytes that must be replayed first.
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.inner, self.buffer)
    }
}

impl<S: AsyncRead + Unpin> SniffedStream<S> {
    /// Return the first `n` unconsumed bytes without consuming them.
    ///
    /// Reads from the underlying stream only as far as needed. Repeated calls
    /// see the same bytes, and so does the next reader.
    pub async fn peek(&mut self, n: usize) -> Result<&[u8], SniffError> {
        if n > self.limit {
            return Err(SniffError::LimitExceeded { limit: self.limit });
        }

        while self.buffer.len() < n {
            let mut chunk = [0u8; READ_CHUNK];
            let room = (self.limit - self.buffer.len()).min(READ_CHUNK);
            let read = self.inner.read(&mut chunk[..room]).await?;
            if read == 0 {
                return Err(SniffError::ShortRead {
                    wanted: n,
                    got: self.buffer.len(),
                });
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }

        Ok(&self.buffer[..n])
    }
}

impl<S: AsyncRead> AsyncRead for SniffedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();

        if this.buffer.is_empty() {
            return this.inner.poll_read(cx, buf);
        }

        let n = this.buffer.len().min(buf.remaining());
        buf.put_slice(&this.buffer[..n]);
        this.buffer.advance(n);
        if this.buffer.is_empty() {
            // Release the sniffing allocation once it has been replayed.
            *this.buffer = BytesMut::new();
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for SniffedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
