//! Datagram transport at the end of a pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};
use crate::flow::PacketPass;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet of length {} to {:?}", packet_buf.len(), to);

        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }
}

/// A sink sending every packet as one datagram to a fixed peer. Send errors are logged and the
///  packet is lost, which is what datagram consumers expect anyway.
pub struct DatagramSink {
    socket: Arc<dyn SendSocket>,
    peer_addr: SocketAddr,
    mtu: usize,
}

impl DatagramSink {
    pub fn new(socket: Arc<dyn SendSocket>, peer_addr: SocketAddr, mtu: usize) -> DatagramSink {
        DatagramSink { socket, peer_addr, mtu }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[async_trait]
impl PacketPass for DatagramSink {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn send(&mut self, packet: &[u8]) {
        self.socket.do_send_packet(self.peer_addr, packet).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sends_to_peer() {
        let peer: SocketAddr = "10.0.0.2:4000".parse().unwrap();

        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .once()
            .withf(move |addr, buf| addr == &peer && buf == b"payload")
            .returning(|_, _| ());

        let mut sink = DatagramSink::new(Arc::new(socket), peer, 1400);
        assert_eq!(sink.mtu(), 1400);
        sink.send(b"payload").await;
    }
}
