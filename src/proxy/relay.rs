//! Bidirectional relay between a downstream and an upstream stream.
//!
//! Each direction reads from one side, runs the bytes through a
//! [`Transform`] (identity, chunk encoder or chunk decoder), and queues the
//! output on a [`PendingWriteQueue`] for the other side. Both directions are
//! driven from a single task by one `poll_fn`, so no locking is involved.
//!
//! Per direction:
//! - at most one write is in flight;
//! - buffers leave the queue in FIFO order, and only once fully written;
//! - reads pause while the queue holds more than the high-water mark;
//! - after EOF and a drained queue the writer is shut down (half-close).
//!
//! The relay ends when both directions have finished.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::{ChunkDecoder, ChunkEncoder};
use crate::error::Result;
use crate::SOCKET_BUF_SIZE;

/// Per-direction byte rewriting applied between read and write.
pub trait Transform: Send {
    /// Consume `input`, appending any output to `out`.
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()>;

    /// Called once when the source side reaches EOF. An error means the
    /// input stopped mid-frame and fails the relay.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Copies bytes unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Transform for Passthrough {
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(input);
        Ok(())
    }
}

impl<T: Transform + ?Sized> Transform for Box<T> {
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        (**self).transform(input, out)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Type-erased transform, for relays whose cipher is chosen at runtime.
pub type BoxedTransform = Box<dyn Transform>;

impl Transform for ChunkEncoder {
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.encode(input, out)
    }
}

impl Transform for ChunkDecoder {
    fn transform(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.decode(input, out)
    }

    fn finish(&mut self) -> Result<()> {
        ChunkDecoder::finish(self)
    }
}

/// FIFO of buffers awaiting transmission on one direction.
#[derive(Debug)]
pub struct PendingWriteQueue {
    buffers: VecDeque<Bytes>,
    /// Bytes of the front buffer already written
    offset: usize,
    queued: usize,
    high_water_mark: usize,
}

impl PendingWriteQueue {
    /// Create an empty queue.
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            buffers: VecDeque::new(),
            offset: 0,
            queued: 0,
            high_water_mark,
        }
    }

    /// Append a buffer; empty buffers are ignored.
    pub fn push(&mut self, buf: Bytes) {
        if !buf.is_empty() {
            self.queued += buf.len();
            self.buffers.push_back(buf);
        }
    }

    /// Unwritten part of the front buffer.
    pub fn front(&self) -> Option<&[u8]> {
        self.buffers.front().map(|b| &b[self.offset..])
    }

    /// Mark `n` bytes of the front buffer as written, popping it once done.
    pub fn advance(&mut self, n: usize) {
        let Some(front) = self.buffers.front() else {
            return;
        };
        let n = n.min(front.len() - self.offset);
        self.offset += n;
        self.queued -= n;
        if self.offset == front.len() {
            self.buffers.pop_front();
            self.offset = 0;
        }
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of queued buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Unwritten bytes across all buffers.
    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    /// Whether reads feeding this queue should pause.
    pub fn is_above_high_water(&self) -> bool {
        self.queued > self.high_water_mark
    }
}

struct Direction<T> {
    name: &'static str,
    transform: T,
    buf: Box<[u8]>,
    scratch: Vec<u8>,
    queue: PendingWriteQueue,
    read_done: bool,
    need_flush: bool,
    done: bool,
    bytes_read: u64,
    bytes_written: u64,
}

impl<T: Transform> Direction<T> {
    fn new(name: &'static str, transform: T, high_water_mark: usize) -> Self {
        Self {
            name,
            transform,
            buf: vec![0u8; SOCKET_BUF_SIZE].into_boxed_slice(),
            scratch: Vec::with_capacity(SOCKET_BUF_SIZE),
            queue: PendingWriteQueue::new(high_water_mark),
            read_done: false,
            need_flush: false,
            done: false,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    fn push(&mut self, data: &[u8]) -> Result<()> {
        self.scratch.clear();
        self.transform.transform(data, &mut self.scratch)?;
        self.queue.push(Bytes::copy_from_slice(&self.scratch));
        Ok(())
    }

    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        reader: &mut R,
        writer: &mut W,
    ) -> Poll<Result<()>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            let mut progressed = false;

            if !self.read_done && !self.queue.is_above_high_water() {
                let mut rb = ReadBuf::new(&mut self.buf);
                match Pin::new(&mut *reader).poll_read(cx, &mut rb) {
                    Poll::Ready(Ok(())) => {
                        let n = rb.filled().len();
                        if n == 0 {
                            tracing::trace!(direction = self.name, "EOF");
                            self.transform.finish()?;
                            self.read_done = true;
                        } else {
                            self.bytes_read += n as u64;
                            self.scratch.clear();
                            self.transform.transform(&self.buf[..n], &mut self.scratch)?;
                            self.queue.push(Bytes::copy_from_slice(&self.scratch));
                            tracing::trace!(
                                direction = self.name,
                                read = n,
                                queued = self.queue.queued_bytes(),
                                "chunk"
                            );
                        }
                        progressed = true;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                    Poll::Pending => {}
                }
            }

            while let Some(chunk) = self.queue.front() {
                match Pin::new(&mut *writer).poll_write(cx, chunk) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        )
                        .into()))
                    }
                    Poll::Ready(Ok(n)) => {
                        self.queue.advance(n);
                        self.bytes_written += n as u64;
                        self.need_flush = true;
                        progressed = true;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                    Poll::Pending => break,
                }
            }

            if self.queue.is_empty() && self.need_flush {
                match Pin::new(&mut *writer).poll_flush(cx) {
                    Poll::Ready(Ok(())) => self.need_flush = false,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                    Poll::Pending => {}
                }
            }

            if self.read_done && self.queue.is_empty() && !self.need_flush {
                ready!(Pin::new(&mut *writer).poll_shutdown(cx))?;
                self.done = true;
                tracing::trace!(direction = self.name, bytes = self.bytes_written, "finished");
                return Poll::Ready(Ok(()));
            }

            if !progressed {
                return Poll::Pending;
            }
        }
    }
}

/// Byte totals of a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes read from downstream
    pub upstream_read: u64,
    /// Bytes written to upstream (after transform)
    pub upstream_written: u64,
    /// Bytes read from upstream
    pub downstream_read: u64,
    /// Bytes written to downstream (after transform)
    pub downstream_written: u64,
}

/// A relay under construction: transforms chosen, optional first payloads
/// queued, not yet running.
pub struct Relay<U, D> {
    up: Direction<U>,
    down: Direction<D>,
}

impl<U: Transform, D: Transform> Relay<U, D> {
    /// `up` rewrites downstream→upstream bytes, `down` the reverse.
    pub fn new(up: U, down: D, high_water_mark: usize) -> Self {
        Self {
            up: Direction::new("up", up, high_water_mark),
            down: Direction::new("down", down, high_water_mark),
        }
    }

    /// Queue `data` for upstream through the upstream transform.
    pub fn push_upstream(&mut self, data: &[u8]) -> Result<()> {
        self.up.push(data)
    }

    /// Queue already-transformed bytes for upstream.
    pub fn push_upstream_raw(&mut self, data: Bytes) {
        self.up.queue.push(data);
    }

    /// Queue `data` for downstream through the downstream transform.
    pub fn push_downstream(&mut self, data: &[u8]) -> Result<()> {
        self.down.push(data)
    }

    /// Run until both directions have reached EOF and drained, or either
    /// side fails.
    pub async fn run<A, B>(mut self, downstream: &mut A, upstream: &mut B) -> Result<RelayStats>
    where
        A: AsyncRead + AsyncWrite + Unpin + ?Sized,
        B: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        poll_fn(|cx| -> Poll<Result<()>> {
            if !self.up.done {
                if let Poll::Ready(r) = self.up.poll_transfer(cx, &mut *downstream, &mut *upstream) {
                    r?;
                }
            }
            if !self.down.done {
                if let Poll::Ready(r) = self.down.poll_transfer(cx, &mut *upstream, &mut *downstream) {
                    r?;
                }
            }
            if self.up.done && self.down.done {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        })
        .await?;

        Ok(RelayStats {
            upstream_read: self.up.bytes_read,
            upstream_written: self.up.bytes_written,
            downstream_read: self.down.bytes_read,
            downstream_written: self.down.bytes_written,
        })
    }
}
