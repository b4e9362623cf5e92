use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use crate::config::UdpGwClientConfig;
use crate::flow::fair_queue::{FairQueue, FairQueueFlow};
use crate::flow::inactivity_monitor::{InactivityAlarm, InactivityMonitor, InactivityTimer};
use crate::flow::packet_buffer::PacketBuffer;
use crate::flow::packet_proto::{PacketProtoDecoder, PacketProtoSink};
use crate::udpgw::connection_table::{ConnectionKey, ConnectionTable};
use crate::udpgw::proto::{addr_len, frame_mtu, UdpGwFlags, UdpGwFrame, UDPGW_HEADER_LEN};

/// Receives UDP packets coming back through the gateway
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UdpGwHandler: Send + Sync + 'static {
    /// `local` and `remote` are the address pair the packet's connection was created for
    async fn on_packet(&self, local: SocketAddr, remote: SocketAddr, payload: &[u8]);
}

/// Multiplexes UDP 'connections' over a single stream to a udpgw server.
///
/// Each `(local, remote)` address pair gets a connection with its own bounded send buffer feeding
///  a shared [FairQueue], so a busy connection cannot starve the others. The stream is kept alive
///  with keepalive frames when there is no traffic.
///
/// A failure of the stream is reported once through the receiver returned by
///  [UdpGwClient::new]. The client does not reconnect: it is up to the owner to drop it and
///  create a new one.
pub struct UdpGwClient {
    config: UdpGwClientConfig,
    connections: Arc<Mutex<ConnectionTable<PacketBuffer>>>,
    queue: FairQueue,
    keepalive: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

impl UdpGwClient {
    pub fn new<S>(config: UdpGwClientConfig, stream: S, handler: Arc<dyn UdpGwHandler>) -> anyhow::Result<(UdpGwClient, oneshot::Receiver<anyhow::Error>)>
    where S: AsyncRead + AsyncWrite + Send + 'static
    {
        config.validate()?;
        let frame_mtu = frame_mtu(config.udp_mtu);

        let (reader, writer) = tokio::io::split(stream);
        let (sink, sink_error) = PacketProtoSink::new(writer, frame_mtu)?;
        let (monitor, alarm) = InactivityMonitor::new(sink, config.keepalive_time);
        let queue = FairQueue::new(monitor, false);

        let connections = Arc::new(Mutex::new(ConnectionTable::new(config.max_connections, config.eviction)));

        let keepalive = tokio::spawn(Self::keepalive_loop(queue.new_flow(), alarm.clone()));

        let (error_tx, error_rx) = oneshot::channel();
        let receiver = tokio::spawn(Self::supervise(
            PacketProtoDecoder::new(reader, frame_mtu),
            connections.clone(),
            handler,
            alarm.timer().clone(),
            config.udp_mtu,
            sink_error,
            error_tx,
        ));

        info!("udpgw client started");
        Ok((
            UdpGwClient {
                config,
                connections,
                queue,
                keepalive,
                receiver,
            },
            error_rx,
        ))
    }

    pub fn udp_mtu(&self) -> usize {
        self.config.udp_mtu
    }

    pub fn num_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Send a UDP packet through the gateway. `is_dns` makes the server send it to its configured
    ///  DNS server rather than `remote`. A packet is dropped if the connection's send buffer is
    ///  full.
    pub fn submit_packet(&self, local: SocketAddr, remote: SocketAddr, is_dns: bool, payload: &[u8]) {
        assert!(payload.len() <= self.config.udp_mtu, "UDP payload of length {} exceeds the MTU of {}", payload.len(), self.config.udp_mtu);

        let queue = self.queue.handle();
        let send_buffer_size = self.config.send_buffer_size;

        let mut connections = self.connections.lock().unwrap();
        let connection = connections.get_or_insert(ConnectionKey { local, remote }, |_| {
            PacketBuffer::new(queue.new_flow(), send_buffer_size)
        });

        let mut flags = UdpGwFlags::empty();
        if connection.take_rebind() {
            flags |= UdpGwFlags::REBIND;
        }
        if is_dns {
            flags |= UdpGwFlags::DNS;
        }

        let mut buf = BytesMut::with_capacity(UDPGW_HEADER_LEN + addr_len(&remote) + payload.len());
        UdpGwFrame::ser_data(&mut buf, flags, connection.conid(), remote, payload);

        trace!("submitting {} bytes on connection {}", payload.len(), connection.conid());
        if !connection.data.try_push(buf.freeze()) {
            warn!("send buffer of connection {} is full - dropping packet", connection.conid());
        }
    }

    async fn keepalive_loop(mut flow: FairQueueFlow, alarm: InactivityAlarm) {
        let mut buf = BytesMut::new();
        UdpGwFrame::ser_keepalive(&mut buf);
        let keepalive = buf.freeze();

        loop {
            alarm.lapsed().await;
            trace!("sending keepalive");
            // the next keepalive is only considered after this one went out
            flow.submit(keepalive.clone()).await;
        }
    }

    async fn supervise<R: AsyncRead + Send + 'static>(
        decoder: PacketProtoDecoder<ReadHalf<R>>,
        connections: Arc<Mutex<ConnectionTable<PacketBuffer>>>,
        handler: Arc<dyn UdpGwHandler>,
        timer: Arc<InactivityTimer>,
        udp_mtu: usize,
        sink_error: oneshot::Receiver<anyhow::Error>,
        error_tx: oneshot::Sender<anyhow::Error>,
    ) {
        let error = tokio::select! {
            Ok(e) = sink_error => e,
            e = Self::receive_loop(decoder, connections, handler, timer, udp_mtu) => e,
        };
        warn!("udpgw connection failed: {}", error);
        let _ = error_tx.send(error);
    }

    async fn receive_loop<R: AsyncRead + Send + 'static>(
        mut decoder: PacketProtoDecoder<ReadHalf<R>>,
        connections: Arc<Mutex<ConnectionTable<PacketBuffer>>>,
        handler: Arc<dyn UdpGwHandler>,
        timer: Arc<InactivityTimer>,
        udp_mtu: usize,
    ) -> anyhow::Error {
        loop {
            let packet = match decoder.next_packet().await {
                Ok(packet) => packet,
                Err(e) => return e,
            };

            let (conid, remote, payload) = match UdpGwFrame::deser(packet) {
                Ok(UdpGwFrame::Keepalive) => {
                    trace!("received keepalive");
                    timer.reset();
                    continue;
                }
                Ok(UdpGwFrame::Data { conid, remote, payload, .. }) => (conid, remote, payload),
                Err(e) => {
                    debug!("dropping malformed frame from server: {}", e);
                    continue;
                }
            };

            if payload.len() > udp_mtu {
                debug!("dropping packet of length {} exceeding the UDP MTU", payload.len());
                continue;
            }

            let Some(local) = Self::match_connection(&connections, conid, remote) else {
                continue;
            };

            trace!("received {} bytes on connection {}", payload.len(), conid);
            handler.on_packet(local, remote, &payload).await;
        }
    }

    /// the local address of a live connection with the given id, if the remote address matches
    fn match_connection(connections: &Mutex<ConnectionTable<PacketBuffer>>, conid: u16, remote: SocketAddr) -> Option<SocketAddr> {
        let mut connections = connections.lock().unwrap();
        let Some(connection) = connections.get_by_conid(conid) else {
            debug!("received packet for unknown connection {} - dropping", conid);
            return None;
        };

        let key = connection.key();
        if key.remote != remote {
            debug!("received packet for connection {} from {:?}, expected {:?} - dropping", conid, remote, key.remote);
            return None;
        }

        connections.touch(conid);
        Some(key.local)
    }
}

impl Drop for UdpGwClient {
    fn drop(&mut self) {
        self.keepalive.abort();
        self.receiver.abort();
        self.connections.lock().unwrap().clear();
        debug!("udpgw client stopped");
    }
}
