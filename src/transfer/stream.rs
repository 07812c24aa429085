//! Stream wrappers threaded through every byte a composite operation moves
//!
//! [`MeteredReader`] sits between an adapter's `read` stream and another
//! adapter's `write`: it reports progress per chunk and turns a fired
//! cancellation token into an I/O error, which aborts the destination write
//! without any adapter knowing about cancellation.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::adapter::ProgressFn;

/// Message carried by the I/O error that signals cancellation.
pub const CANCELLED_MESSAGE: &str = "Operation cancelled";

pub fn cancelled_io_error() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, CANCELLED_MESSAGE)
}

/// Byte-counting, cancellable reader.
pub struct MeteredReader<R> {
    inner: R,
    on_bytes: Option<ProgressFn>,
    cancel: Option<CancellationToken>,
    bytes: u64,
}

impl<R> MeteredReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            on_bytes: None,
            cancel: None,
            bytes: 0,
        }
    }

    pub fn with_progress(mut self, on_bytes: ProgressFn) -> Self {
        self.on_bytes = Some(on_bytes);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Bytes that have passed through so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for MeteredReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Poll::Ready(Err(cancelled_io_error()));
            }
        }

        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                if n > 0 {
                    this.bytes += n;
                    if let Some(cb) = &this.on_bytes {
                        cb(n);
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
