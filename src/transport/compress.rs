//! Transparent zstd compression, negotiated as a single byte exchanged
//! on the raw connection before multiplexing begins (§4.3).
//!
//! Grounded on the `async-compression` crate's tokio adapters — the
//! same crate `estuary-flow`, `npolshakova-agentgateway`, and
//! `plabayo-rama` reach for to wrap a `tokio` stream in zstd framing,
//! preferred here over the plain `zstd` crate since the wire is async
//! end to end and has no spot to do blocking (de)compression.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, ReadHalf, WriteHalf};

/// Exchange a single negotiation byte: 1 requests compression, 0
/// declines. Compression is enabled only when both sides request it.
pub async fn negotiate<S>(stream: &mut S, want: bool) -> std::io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_u8(if want { 1 } else { 0 }).await?;
    stream.flush().await?;
    let peer_wants = stream.read_u8().await? == 1;
    Ok(want && peer_wants)
}

/// A stream wrapped so reads pass through zstd decompression and writes
/// pass through zstd compression, transparent to anything layered on
/// top (the multiplexer neither knows nor cares).
pub struct CompressedStream<S> {
    decoder: ZstdDecoder<BufReader<ReadHalf<S>>>,
    encoder: ZstdEncoder<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> CompressedStream<S> {
    pub fn wrap(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            decoder: ZstdDecoder::new(BufReader::new(read_half)),
            encoder: ZstdEncoder::new(write_half),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for CompressedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().decoder).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for CompressedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().encoder).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().encoder).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().encoder).poll_shutdown(cx)
    }
}

/// Either side of the negotiation outcome, unified behind one type so
/// callers downstream of negotiation don't need to be generic over
/// whether compression won.
pub enum NegotiatedStream<S> {
    Plain(S),
    Compressed(CompressedStream<S>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for NegotiatedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NegotiatedStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            NegotiatedStream::Compressed(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for NegotiatedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            NegotiatedStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            NegotiatedStream::Compressed(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NegotiatedStream::Plain(s) => Pin::new(s).poll_flush(cx),
            NegotiatedStream::Compressed(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NegotiatedStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            NegotiatedStream::Compressed(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn negotiation_enables_compression_only_when_both_sides_want_it() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let a_side = tokio::spawn(async move { negotiate(&mut a, true).await });
        let enabled_b = negotiate(&mut b, true).await.unwrap();
        let enabled_a = a_side.await.unwrap().unwrap();
        assert!(enabled_a);
        assert!(enabled_b);
    }

    #[tokio::test]
    async fn negotiation_declines_when_either_side_declines() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let a_side = tokio::spawn(async move { negotiate(&mut a, true).await });
        let enabled_b = negotiate(&mut b, false).await.unwrap();
        let enabled_a = a_side.await.unwrap().unwrap();
        assert!(!enabled_a);
        assert!(!enabled_b);
    }

    #[tokio::test]
    async fn compressed_stream_round_trips_bytes() {
        let (a, b) = tokio::io::duplex(8192);
        let mut a = CompressedStream::wrap(a);
        let mut b = CompressedStream::wrap(b);

        let writer = tokio::spawn(async move {
            a.write_all(b"the quick brown fox jumps over the lazy dog")
                .await
                .unwrap();
            a.flush().await.unwrap();
            a.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        b.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, b"the quick brown fox jumps over the lazy dog");
    }
}
