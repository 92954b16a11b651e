//! Type-erased transport stream.
//!
//! The connect sequence produces a different concrete type depending on
//! whether TLS and/or compression were negotiated (§4.3.x, §4.3). Rather
//! than make every downstream consumer (the multiplexer, in particular)
//! generic over all four combinations, box the negotiated stream behind
//! one object-safe trait — the same "erase the concrete IO type behind
//! a boxed trait object" trick hyper/tonic use for their transport
//! layer, done by hand here since this crate has no such helper crate
//! in its dependency graph.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub trait AsyncStream: Send {
    fn poll_read_boxed(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>>;
    fn poll_write_boxed(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>>;
    fn poll_flush_boxed(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>>;
    fn poll_shutdown_boxed(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>>;
}

impl<T: AsyncRead + AsyncWrite + Send> AsyncStream for T {
    fn poll_read_boxed(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        AsyncRead::poll_read(self, cx, buf)
    }

    fn poll_write_boxed(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(self, cx, buf)
    }

    fn poll_flush_boxed(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_flush(self, cx)
    }

    fn poll_shutdown_boxed(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_shutdown(self, cx)
    }
}

pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

pub fn box_stream<S: AsyncRead + AsyncWrite + Send + 'static>(stream: S) -> BoxedStream {
    Box::pin(stream)
}

impl AsyncRead for dyn AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.poll_read_boxed(cx, buf)
    }
}

impl AsyncWrite for dyn AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.poll_write_boxed(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.poll_flush_boxed(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.poll_shutdown_boxed(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn boxed_stream_round_trips_through_a_duplex_pipe() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut boxed: BoxedStream = box_stream(a);
        boxed.write_all(b"hi").await.unwrap();
        boxed.flush().await.unwrap();
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
