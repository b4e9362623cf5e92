//! PacketProto: packet framing over a byte stream.
//!
//! ```ascii
//! 0:  payload length (u16 LE)
//! 2:  payload
//! ```
//!
//! A write failure on the stream is a transport failure: the sink reports it once through the
//!  receiver returned on construction and drops all further packets. The owner is expected to tear
//!  down the connection.

use anyhow::bail;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{trace, warn};
use crate::flow::PacketPass;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const PACKETPROTO_HEADER_LEN: usize = 2;
pub const PACKETPROTO_MAX_PAYLOAD: usize = u16::MAX as usize;

/// Frames packets onto a byte stream.
pub struct PacketProtoSink<W> {
    writer: W,
    mtu: usize,
    buf: BytesMut,
    error: Option<oneshot::Sender<anyhow::Error>>,
}

impl<W: AsyncWrite + Unpin + Send> PacketProtoSink<W> {
    pub fn new(writer: W, mtu: usize) -> anyhow::Result<(PacketProtoSink<W>, oneshot::Receiver<anyhow::Error>)> {
        if mtu > PACKETPROTO_MAX_PAYLOAD {
            bail!("PacketProto MTU {} exceeds the maximum of {}", mtu, PACKETPROTO_MAX_PAYLOAD);
        }

        let (error_tx, error_rx) = oneshot::channel();
        Ok((
            PacketProtoSink {
                writer,
                mtu,
                buf: BytesMut::with_capacity(PACKETPROTO_HEADER_LEN + mtu),
                error: Some(error_tx),
            },
            error_rx,
        ))
    }

    async fn write_packet(&mut self, packet: &[u8]) -> std::io::Result<()> {
        self.buf.clear();
        self.buf.put_u16_le(packet.len().prechecked_cast());
        self.buf.put_slice(packet);
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> PacketPass for PacketProtoSink<W> {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn send(&mut self, packet: &[u8]) {
        if self.error.is_none() {
            trace!("stream failed previously - dropping packet");
            return;
        }

        if let Err(e) = self.write_packet(packet).await {
            warn!("error writing to stream: {}", e);
            if let Some(error) = self.error.take() {
                let _ = error.send(e.into());
            }
        }
    }
}

/// Reads framed packets from a byte stream.
pub struct PacketProtoDecoder<R> {
    reader: R,
    mtu: usize,
}

impl<R: AsyncRead + Unpin + Send> PacketProtoDecoder<R> {
    pub fn new(reader: R, mtu: usize) -> PacketProtoDecoder<R> {
        PacketProtoDecoder { reader, mtu }
    }

    /// Read the next packet. A packet longer than the MTU means the stream is out of sync or
    ///  compromised, and it is reported as an error just like I/O errors and EOF.
    pub async fn next_packet(&mut self) -> anyhow::Result<Bytes> {
        let mut len_buf = [0u8; PACKETPROTO_HEADER_LEN];
        self.reader.read_exact(&mut len_buf).await?;
        let len: usize = u16::from_le_bytes(len_buf).safe_cast();

        if len > self.mtu {
            bail!("received a packet of length {} exceeding the MTU of {} - stream is corrupt", len, self.mtu);
        }

        let mut packet = vec![0u8; len];
        self.reader.read_exact(&mut packet).await?;
        Ok(packet.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(b"".to_vec(), vec![0, 0])]
    #[case::short(b"abc".to_vec(), vec![3, 0, b'a', b'b', b'c'])]
    #[case::long(vec![7; 300], [vec![44, 1], vec![7; 300]].concat())]
    #[tokio::test]
    async fn test_sink_framing(#[case] packet: Vec<u8>, #[case] expected: Vec<u8>) {
        let (client, mut server) = tokio::io::duplex(1024);
        let (mut sink, _error) = PacketProtoSink::new(client, 500).unwrap();

        sink.send(&packet).await;

        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_decoder_reads_packets() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut sink, _error) = PacketProtoSink::new(client, 100).unwrap();
        let mut decoder = PacketProtoDecoder::new(server, 100);

        sink.send(b"first").await;
        sink.send(b"").await;
        sink.send(b"third").await;

        assert_eq!(decoder.next_packet().await.unwrap().as_ref(), b"first");
        assert_eq!(decoder.next_packet().await.unwrap().as_ref(), b"");
        assert_eq!(decoder.next_packet().await.unwrap().as_ref(), b"third");
    }

    #[tokio::test]
    async fn test_decoder_rejects_oversized() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut decoder = PacketProtoDecoder::new(server, 4);

        client.write_all(&[5, 0, 1, 2, 3, 4, 5]).await.unwrap();
        assert!(decoder.next_packet().await.is_err());
    }

    #[tokio::test]
    async fn test_decoder_eof_is_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut decoder = PacketProtoDecoder::new(server, 100);

        client.write_all(&[5, 0, 1, 2]).await.unwrap();
        drop(client);
        assert!(decoder.next_packet().await.is_err());
    }

    #[tokio::test]
    async fn test_sink_reports_error_once() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut sink, error) = PacketProtoSink::new(client, 100).unwrap();
        drop(server);

        sink.send(b"lost").await;
        assert!(error.await.is_ok());
        sink.send(b"dropped").await;
    }

    #[test]
    fn test_rejects_oversized_mtu() {
        let (client, _server) = tokio::io::duplex(1024);
        assert!(PacketProtoSink::new(client, 70000).is_err());
    }
}
