//! Idle deadline for streamed bodies.
//!
//! [`IdleTimeoutBody`] fails a body whose source has gone quiet for longer
//! than the configured idle period. The clock only runs while the inner
//! body is pending; time spent waiting for the reader to poll again does
//! not count.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::BoxError;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use tokio::time::{Instant, Sleep};

use crate::error::ProxyError;

/// Body wrapper that errors once no frame arrives within `idle`.
pub struct IdleTimeoutBody<B> {
    inner: B,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
    armed: bool,
    expired: bool,
}

impl<B> IdleTimeoutBody<B> {
    /// Must be called inside a Tokio runtime.
    pub fn new(inner: B, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            deadline: Box::pin(tokio::time::sleep(idle)),
            armed: false,
            expired: false,
        }
    }
}

impl<B> Body for IdleTimeoutBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.expired {
            return Poll::Ready(None);
        }

        if let Poll::Ready(item) = Pin::new(&mut this.inner).poll_frame(cx) {
            this.armed = false;
            return Poll::Ready(item.map(|result| result.map_err(Into::into)));
        }

        if !this.armed {
            this.deadline.as_mut().reset(Instant::now() + this.idle);
            this.armed = true;
        }
        match this.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.expired = true;
                Poll::Ready(Some(Err(ProxyError::BodyIdle(this.idle.as_secs()).into())))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.expired || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use futures_util::{stream, StreamExt};

    #[tokio::test]
    async fn quiet_body_fails_after_idle_period() {
        let first = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"ab"))]);
        let stalled = first.chain(stream::pending());
        let body = IdleTimeoutBody::new(AxumBody::from_stream(stalled), Duration::from_secs(1));
        let mut data = AxumBody::new(body).into_data_stream();

        assert_eq!(data.next().await.unwrap().unwrap(), Bytes::from_static(b"ab"));

        let started = std::time::Instant::now();
        let err = data.next().await.unwrap().unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(err.to_string(), "Body idle for 1 seconds");
        assert!(data.next().await.is_none());
    }

    #[tokio::test]
    async fn steady_body_is_left_alone() {
        let slow = stream::iter(["a", "b", "c"]).then(|part| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok::<_, std::io::Error>(Bytes::from_static(part.as_bytes()))
        });
        let body = IdleTimeoutBody::new(AxumBody::from_stream(slow), Duration::from_secs(1));

        let bytes = axum::body::to_bytes(AxumBody::new(body), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"abc");
    }
}
