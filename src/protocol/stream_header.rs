//! Binary header sent as the first bytes of every proxy data stream
//! (§4.4, §6): which tunnel the stream belongs to, and the remote
//! address the server observed for the inbound connection.
//!
//! Kept as its own tiny binary framing rather than reusing the JSON
//! `codec` module — this runs once per stream, at the front of a byte
//! pipe that immediately becomes raw proxied traffic, so it is written
//! the way `tunnel::protocol::Frame` writes its fixed
//! binary header: explicit field widths, no serde.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::message::ProtocolError;

/// Current wire version. Bump if the field layout ever changes.
pub const VERSION: u8 = 1;

/// Upper bound on each string field, generous enough for any tunnel id or
/// `host:port` string but small enough to reject garbage quickly.
const MAX_FIELD_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub tunnel_id: String,
    pub remote_addr: String,
}

impl StreamHeader {
    pub fn new(tunnel_id: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            remote_addr: remote_addr.into(),
        }
    }

    fn encode_body(&self) -> Result<BytesMut, ProtocolError> {
        let tunnel_id = self.tunnel_id.as_bytes();
        let remote_addr = self.remote_addr.as_bytes();
        if tunnel_id.len() > MAX_FIELD_LEN || remote_addr.len() > MAX_FIELD_LEN {
            return Err(ProtocolError::UnknownTag(format!(
                "stream header field exceeds {MAX_FIELD_LEN} bytes"
            )));
        }
        let mut buf = BytesMut::with_capacity(1 + 2 + tunnel_id.len() + 2 + remote_addr.len());
        buf.put_u8(VERSION);
        buf.put_u16(tunnel_id.len() as u16);
        buf.put_slice(tunnel_id);
        buf.put_u16(remote_addr.len() as u16);
        buf.put_slice(remote_addr);
        Ok(buf)
    }

    fn decode_body(mut body: &[u8]) -> Result<Self, ProtocolError> {
        if body.is_empty() {
            return Err(ProtocolError::UnknownTag("empty stream header".into()));
        }
        let version = body.get_u8();
        if version != VERSION {
            return Err(ProtocolError::UnknownTag(format!(
                "unsupported stream header version {version}"
            )));
        }
        let tunnel_id = read_string(&mut body)?;
        let remote_addr = read_string(&mut body)?;
        Ok(Self {
            tunnel_id,
            remote_addr,
        })
    }

    /// Write `version + tunnel_id + remote_addr`, preceded by a 4-byte
    /// big-endian length of that body, in a single `write_all`.
    pub async fn write<W: tokio::io::AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
    ) -> Result<(), ProtocolError> {
        let body = self.encode_body()?;
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        writer
            .write_all(&frame)
            .await
            .map_err(|e| ProtocolError::UnknownTag(format!("stream header write failed: {e}")))
    }

    pub async fn read<R: tokio::io::AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<Self, ProtocolError> {
        let mut len_buf = [0u8; 4];
        reader
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| ProtocolError::UnknownTag(format!("stream header read failed: {e}")))?;
        let len = (&len_buf[..]).get_u32() as usize;
        if len > MAX_FIELD_LEN * 2 + 8 {
            return Err(ProtocolError::UnknownTag(format!(
                "stream header length {len} exceeds bound"
            )));
        }
        let mut body = vec![0u8; len];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| ProtocolError::UnknownTag(format!("stream header read failed: {e}")))?;
        Self::decode_body(&body)
    }
}

fn read_string(body: &mut &[u8]) -> Result<String, ProtocolError> {
    if body.len() < 2 {
        return Err(ProtocolError::UnknownTag("truncated stream header".into()));
    }
    let len = body.get_u16() as usize;
    if body.len() < len {
        return Err(ProtocolError::UnknownTag("truncated stream header".into()));
    }
    let (raw, rest) = body.split_at(len);
    *body = rest;
    String::from_utf8(raw.to_vec())
        .map_err(|e| ProtocolError::UnknownTag(format!("non-utf8 stream header field: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let header = StreamHeader::new("t-abc123", "203.0.113.7:54321");
        header.write(&mut a).await.unwrap();
        let decoded = StreamHeader::read(&mut b).await.unwrap();
        assert_eq!(decoded, header);
    }

    #[tokio::test]
    async fn rejects_wrong_version() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut frame = BytesMut::new();
        frame.put_u32(1);
        frame.put_u8(255);
        a.write_all(&frame).await.unwrap();
        let err = StreamHeader::read(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(_)));
    }

    #[test]
    fn rejects_oversize_field() {
        let header = StreamHeader::new("x".repeat(MAX_FIELD_LEN + 1), "addr");
        assert!(header.encode_body().is_err());
    }
}
