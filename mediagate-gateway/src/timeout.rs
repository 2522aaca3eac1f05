//! Deadline enforcement for relayed stream bodies.
//!
//! A relayed origin can stall mid-stream; without deadlines the client
//! connection (and the origin socket behind it) would be held open
//! indefinitely. [`DeadlineBody`] wraps the origin body and fails the
//! stream when a single chunk takes too long or the whole transfer
//! exceeds its total budget.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body::{Body, Frame};
use tokio::time::{sleep, Sleep};

/// Per-chunk and total deadlines for one relayed stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamDeadlines {
    /// Budget for each individual chunk to arrive.
    pub chunk: Duration,
    /// Budget for the whole transfer.
    pub total: Duration,
}

impl StreamDeadlines {
    pub fn new(chunk: Duration, total: Duration) -> Self {
        Self { chunk, total }
    }
}

/// Body wrapper that enforces [`StreamDeadlines`].
///
/// The chunk timer resets after every frame; the total timer is armed on
/// first poll and never resets.
pub struct DeadlineBody<B> {
    inner: B,
    deadlines: StreamDeadlines,
    chunk_timer: Pin<Box<Sleep>>,
    total_timer: Pin<Box<Sleep>>,
    armed: bool,
}

impl<B> DeadlineBody<B> {
    pub fn new(inner: B, deadlines: StreamDeadlines) -> Self {
        Self {
            inner,
            deadlines,
            chunk_timer: Box::pin(sleep(deadlines.chunk)),
            total_timer: Box::pin(sleep(deadlines.total)),
            armed: false,
        }
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = Box<dyn std::error::Error + Send + Sync>;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        if !this.armed {
            this.armed = true;
            let now = tokio::time::Instant::now();
            this.total_timer.as_mut().reset(now + this.deadlines.total);
            this.chunk_timer.as_mut().reset(now + this.deadlines.chunk);
        }

        if this.total_timer.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("stream exceeded total budget of {:?}", this.deadlines.total),
            )
            .into())));
        }

        if this.chunk_timer.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("stream stalled beyond {:?}", this.deadlines.chunk),
            )
            .into())));
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(frame) => {
                let deadline = tokio::time::Instant::now() + this.deadlines.chunk;
                this.chunk_timer.as_mut().reset(deadline);
                Poll::Ready(frame.map(|r| r.map_err(Into::into)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
