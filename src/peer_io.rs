//! The link to one peer over UDP.
//!
//! ```ascii
//! send:     frames -> FragmentDisassembler -> SpProtoEncoder -> UDP socket
//! receive:  UDP socket -> SpProtoDecoder -> FragmentAssembler -> output
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;
use crate::config::{DatagramPeerIoConfig, DisassemblerConfig, FragmentConfig};
use crate::flow::datagram::{DatagramSink, SendSocket};
use crate::flow::PacketPass;
use crate::fragmentproto::{max_chunks_for_frame, CHUNK_HEADER_LEN};
use crate::fragmentproto::assembler::FragmentAssembler;
use crate::fragmentproto::disassembler::FragmentDisassembler;
use crate::spproto::decoder::{SpProtoDecoder, SpProtoDecoderControl};
use crate::spproto::encoder::{SpProtoEncoder, SpProtoEncoderControl};
use crate::util::random::Random;

/// Sends and receives frames to and from a single peer. Frames passed to the link are
///  fragmented, encoded and sent as datagrams; datagrams from the peer's address are decoded and
///  reassembled into frames for the output. Datagrams from other addresses are dropped.
pub struct DatagramPeerIo {
    send: FragmentDisassembler,
    frame_mtu: usize,
    peer_addr: SocketAddr,
    encoder: SpProtoEncoderControl,
    decoder: SpProtoDecoderControl,
    receiver: JoinHandle<()>,
}

impl DatagramPeerIo {
    pub fn new<O: PacketPass + 'static>(config: DatagramPeerIoConfig, socket: Arc<UdpSocket>, peer_addr: SocketAddr, output: O, random: Arc<dyn Random>) -> anyhow::Result<DatagramPeerIo> {
        config.validate()?;
        let Some(carrier_mtu) = config.chunk_carrier_mtu() else {
            bail!("UDP MTU {} is too small for SPProto", config.udp_mtu);
        };

        let datagram_sink = DatagramSink::new(Arc::new(socket.clone()) as Arc<dyn SendSocket>, peer_addr, config.udp_mtu);
        let (encoder, encoder_control) = SpProtoEncoder::new(&config.sp, datagram_sink, random)?;
        let send = FragmentDisassembler::new(
            DisassemblerConfig {
                input_mtu: config.frame_mtu,
                carrier_mtu,
                chunk_mtu: None,
                latency: config.latency,
            },
            encoder,
        )?;

        let num_chunks = max_chunks_for_frame(config.frame_mtu, carrier_mtu - CHUNK_HEADER_LEN);
        let assembler = FragmentAssembler::new(FragmentConfig::new(config.frame_mtu, config.num_frames, num_chunks), carrier_mtu, output)?;
        let (decoder, decoder_control) = SpProtoDecoder::new(&config.sp, assembler)?;

        let receiver = tokio::spawn(Self::recv_loop(socket, peer_addr, decoder));

        Ok(DatagramPeerIo {
            send,
            frame_mtu: config.frame_mtu,
            peer_addr,
            encoder: encoder_control,
            decoder: decoder_control,
            receiver,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn encoder_control(&self) -> &SpProtoEncoderControl {
        &self.encoder
    }

    pub fn decoder_control(&self) -> &SpProtoDecoderControl {
        &self.decoder
    }

    async fn recv_loop<O: PacketPass>(socket: Arc<UdpSocket>, peer_addr: SocketAddr, mut decoder: SpProtoDecoder<O>) {
        info!("starting receive loop for peer {:?}", peer_addr);

        // one extra byte to detect oversized datagrams
        let mut buf = vec![0u8; decoder.mtu() + 1];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

            if from != peer_addr {
                let _entered = span.enter();
                debug!("received datagram from unknown address {:?} - dropping", from);
                continue;
            }

            async {
                trace!("received datagram of length {}", num_read);
                decoder.send(&buf[..num_read]).await;
            }
            .instrument(span)
            .await;
        }
    }
}

impl Drop for DatagramPeerIo {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

#[async_trait]
impl PacketPass for DatagramPeerIo {
    fn mtu(&self) -> usize {
        self.frame_mtu
    }

    async fn send(&mut self, packet: &[u8]) {
        self.send.send(packet).await
    }
}
