use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use crate::config::DataProtoSinkConfig;
use crate::dataproto::{keepalive_packet, DataProtoFlags, DATAPROTO_HEADER_LEN, DATAPROTO_MAX_OVERHEAD};
use crate::flow::fair_queue::{FairQueue, FairQueueFlow, FairQueueHandle};
use crate::flow::inactivity_monitor::{InactivityAlarm, InactivityMonitor, InactivityTimer};
use crate::flow::PacketPass;

/// State shared between the sink, its output stage and its tasks
struct ReceiveState {
    /// reset whenever something is received from the peer
    timer: Arc<InactivityTimer>,
    last_received: Mutex<Option<Instant>>,
    tolerance_time: Duration,
    up: watch::Sender<bool>,
}

impl ReceiveState {
    fn is_receiving(&self) -> bool {
        match *self.last_received.lock().unwrap() {
            Some(at) => at.elapsed() < self.tolerance_time,
            None => false,
        }
    }

    fn set_up(&self, up: bool) {
        let changed = self.up.send_if_modified(|current| {
            std::mem::replace(current, up) != up
        });
        if changed {
            info!("peer link is {}", if up { "up" } else { "down" });
        }
    }
}

/// Sets the `RECEIVING_KEEPALIVES` flag on packets as they leave the queue, so the flag reflects
///  the state at the time of sending rather than when the packet was queued
struct FlagStamper<O> {
    output: O,
    receive: Arc<ReceiveState>,
    buf: BytesMut,
}

#[async_trait]
impl<O: PacketPass> PacketPass for FlagStamper<O> {
    fn mtu(&self) -> usize {
        self.output.mtu()
    }

    async fn send(&mut self, packet: &[u8]) {
        assert!(packet.len() >= DATAPROTO_HEADER_LEN, "packet without DataProto header");

        let mut flags = DataProtoFlags::from_bits_retain(packet[0]);
        flags.set(DataProtoFlags::RECEIVING_KEEPALIVES, self.receive.is_receiving());

        self.buf.clear();
        self.buf.extend_from_slice(packet);
        self.buf[0] = flags.bits();
        self.output.send(&self.buf).await;
    }
}

/// The sending side of the link to one peer.
///
/// Flows attach to the sink through its [DataProtoSinkHandle] and are served round-robin. When
///  nothing was sent for the keepalive time, the sink sends a keepalive. The owner reports
///  everything received from the peer through [DataProtoSink::received], which drives the
///  peer's up / down state.
pub struct DataProtoSink {
    queue: FairQueue,
    receive: Arc<ReceiveState>,
    alarm: InactivityAlarm,
    frame_mtu: usize,
    keepalive: JoinHandle<()>,
    receive_timeout: JoinHandle<()>,
}

impl DataProtoSink {
    /// Returns the sink and a receiver for its up / down state, which starts out as down.
    pub fn new<O: PacketPass + 'static>(config: DataProtoSinkConfig, output: O) -> anyhow::Result<(DataProtoSink, watch::Receiver<bool>)> {
        config.validate()?;
        if output.mtu() < DATAPROTO_MAX_OVERHEAD + config.frame_mtu {
            anyhow::bail!("output MTU {} is too small for frames of {} bytes", output.mtu(), config.frame_mtu);
        }

        let (up_tx, up_rx) = watch::channel(false);
        let receive = Arc::new(ReceiveState {
            timer: InactivityTimer::new(config.tolerance_time),
            last_received: Mutex::new(None),
            tolerance_time: config.tolerance_time,
            up: up_tx,
        });

        let (monitor, alarm) = InactivityMonitor::new(output, config.keepalive_time);
        let stamper = FlagStamper {
            output: monitor,
            receive: receive.clone(),
            buf: BytesMut::with_capacity(DATAPROTO_MAX_OVERHEAD + config.frame_mtu),
        };
        let queue = FairQueue::new(stamper, false);

        // the first keepalive goes out right away
        alarm.force();
        let keepalive = tokio::spawn(Self::keepalive_loop(queue.new_flow(), alarm.clone()));
        let receive_timeout = tokio::spawn(Self::receive_timeout_loop(receive.clone()));

        Ok((
            DataProtoSink {
                queue,
                receive,
                alarm,
                frame_mtu: config.frame_mtu,
                keepalive,
                receive_timeout,
            },
            up_rx,
        ))
    }

    pub fn frame_mtu(&self) -> usize {
        self.frame_mtu
    }

    pub fn handle(&self) -> DataProtoSinkHandle {
        DataProtoSinkHandle {
            queue: self.queue.handle(),
            frame_mtu: self.frame_mtu,
        }
    }

    pub fn is_up(&self) -> bool {
        *self.receive.up.borrow()
    }

    /// number of attached flows, including the sink's own keepalive flow
    pub fn num_flows(&self) -> usize {
        self.queue.num_flows()
    }

    /// Report a packet received from the peer. `peer_receiving` is the packet's
    ///  `RECEIVING_KEEPALIVES` flag, i.e. whether the peer hears us.
    pub fn received(&self, peer_receiving: bool) {
        trace!("received from peer, peer receiving: {}", peer_receiving);
        *self.receive.last_received.lock().unwrap() = Some(Instant::now());
        self.receive.timer.reset();
        self.receive.set_up(peer_receiving);

        if !peer_receiving {
            // tell the peer that we hear it as soon as possible
            self.alarm.force();
        }
    }

    async fn keepalive_loop(mut flow: FairQueueFlow, alarm: InactivityAlarm) {
        let keepalive = keepalive_packet();
        loop {
            alarm.lapsed().await;
            trace!("sending keepalive");
            flow.submit(keepalive.clone()).await;
        }
    }

    async fn receive_timeout_loop(receive: Arc<ReceiveState>) {
        loop {
            receive.timer.lapsed().await;
            if receive.last_received.lock().unwrap().is_some() {
                debug!("nothing received for {:?}", receive.tolerance_time);
            }
            receive.set_up(false);
        }
    }
}

impl Drop for DataProtoSink {
    fn drop(&mut self) {
        self.keepalive.abort();
        self.receive_timeout.abort();
    }
}

/// A reference to a sink that flows can attach to
#[derive(Clone)]
pub struct DataProtoSinkHandle {
    queue: FairQueueHandle,
    frame_mtu: usize,
}

impl DataProtoSinkHandle {
    pub fn frame_mtu(&self) -> usize {
        self.frame_mtu
    }

    pub(crate) fn new_flow(&self) -> FairQueueFlow {
        self.queue.new_flow()
    }

    /// `true` once the sink was dropped
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataproto::{parse_packet, ser_header};
    use crate::test_util::sink::RecordingSink;

    fn config() -> DataProtoSinkConfig {
        DataProtoSinkConfig {
            frame_mtu: 100,
            keepalive_time: Duration::from_secs(10),
            tolerance_time: Duration::from_secs(22),
        }
    }

    fn flags_of(packet: &[u8]) -> DataProtoFlags {
        parse_packet(packet.to_vec().into()).unwrap().flags
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalives() {
        let output = RecordingSink::new(200);
        let (_sink, _up) = DataProtoSink::new(config(), output.clone()).unwrap();
        let start = tokio::time::Instant::now();

        let packets = output.wait_for_packets(1).await;
        assert!(parse_packet(packets[0].clone().into()).unwrap().is_keepalive());
        assert!(start.elapsed() < Duration::from_secs(1));

        output.wait_for_packets(2).await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_suppresses_keepalives() {
        let output = RecordingSink::new(200);
        let (sink, _up) = DataProtoSink::new(config(), output.clone()).unwrap();
        output.wait_for_packets(1).await;

        let mut flow = sink.handle().new_flow();
        let mut packet = Vec::new();
        ser_header(&mut packet, DataProtoFlags::empty(), 1, &[2]);
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            flow.send(&packet).await;
        }

        let packets = output.packets();
        assert_eq!(packets.len(), 4);
        assert!(packets[1..].iter().all(|p| !parse_packet(p.clone().into()).unwrap().is_keepalive()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiving_flag_follows_received_packets() {
        let output = RecordingSink::new(200);
        let (sink, _up) = DataProtoSink::new(config(), output.clone()).unwrap();
        let mut flow = sink.handle().new_flow();
        let mut packet = Vec::new();
        ser_header(&mut packet, DataProtoFlags::RECEIVING_KEEPALIVES, 1, &[2]);

        // nothing received yet: the flag is cleared even if the packet had it
        flow.send(&packet).await;
        sink.received(true);
        flow.send(&packet).await;
        tokio::time::sleep(Duration::from_secs(23)).await;
        flow.send(&packet).await;

        let flags = output.packets().iter()
            .filter(|p| !parse_packet((*p).clone().into()).unwrap().is_keepalive())
            .map(|p| flags_of(p))
            .collect::<Vec<_>>();
        assert_eq!(flags, vec![DataProtoFlags::empty(), DataProtoFlags::RECEIVING_KEEPALIVES, DataProtoFlags::empty()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_up_down() {
        let output = RecordingSink::new(200);
        let (sink, mut up) = DataProtoSink::new(config(), output.clone()).unwrap();
        assert!(!*up.borrow_and_update());

        sink.received(true);
        up.changed().await.unwrap();
        assert!(*up.borrow_and_update());
        assert!(sink.is_up());

        // the peer does not hear us
        sink.received(false);
        up.changed().await.unwrap();
        assert!(!*up.borrow_and_update());

        sink.received(true);
        up.changed().await.unwrap();
        assert!(*up.borrow_and_update());

        let start = tokio::time::Instant::now();
        up.changed().await.unwrap();
        assert!(!*up.borrow());
        assert!(start.elapsed() >= Duration::from_secs(22));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_not_receiving_triggers_keepalive() {
        let output = RecordingSink::new(200);
        let (sink, _up) = DataProtoSink::new(config(), output.clone()).unwrap();
        output.wait_for_packets(1).await;

        let start = tokio::time::Instant::now();
        sink.received(false);
        let packets = output.wait_for_packets(2).await;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(flags_of(&packets[1]), DataProtoFlags::RECEIVING_KEEPALIVES);
    }

    #[rstest::rstest]
    #[case::small_output(100, config())]
    #[case::tolerance_too_short(200, DataProtoSinkConfig { tolerance_time: Duration::from_secs(10), ..config() })]
    #[tokio::test]
    async fn test_invalid_setup(#[case] output_mtu: usize, #[case] config: DataProtoSinkConfig) {
        assert!(DataProtoSink::new(config, RecordingSink::new(output_mtu)).is_err());
    }
}
