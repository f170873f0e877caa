use bytes::Bytes;
use dispatch::{RequestProcessor, ResponseContent};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// Feeds the request body through the processor, chunk by chunk in arrival
/// order, and returns the produced content (or the rendered rejection).
pub(crate) async fn drive<B>(mut processor: RequestProcessor, mut body: B) -> ResponseContent
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref()
                    && let Err(rejection) = processor.on_chunk(data)
                {
                    return rejection;
                }
            }
            Some(Err(error)) => return processor.on_error(&error.to_string()),
            None => return processor.on_end(),
        }
    }
}

/// A response body backed by a channel fed from a blocking producer task.
pub(crate) struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Runs a byte producer (`Ok(0)` meaning end of body) on the blocking pool,
/// streaming its output as body frames.
pub(crate) fn pumped_body(
    mut produce: impl FnMut(&mut [u8]) -> io::Result<usize> + Send + 'static,
) -> ChannelBody {
    let (tx, rx) = mpsc::channel(8);
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match produce(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        // Receiver dropped; the response was abandoned.
                        break;
                    }
                }
                Err(error) => {
                    debug!(%error, "response body producer failed");
                    break;
                }
            }
        }
    });
    ChannelBody { rx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pumped_body_streams_until_zero() {
        let mut chunks: Vec<&[u8]> = vec![b"hello ", b"world"];
        chunks.reverse();
        let body = pumped_body(move |buf| {
            let Some(chunk) = chunks.pop() else {
                return Ok(0);
            };
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        });

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn test_pumped_body_stops_on_error() {
        let mut sent = false;
        let body = pumped_body(move |buf| {
            if sent {
                return Err(io::Error::other("source failed"));
            }
            sent = true;
            buf[..4].copy_from_slice(b"part");
            Ok(4)
        });

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), b"part");
    }
}
