use bytes::Bytes;
use tracing::{debug, trace};
use crate::dataproto::flow::DataProtoFlow;
use crate::flow::PacketRecv;

/// Reads frames from a local input (e.g. a TAP device reader) and routes them to the flows the
///  caller picks for each frame.
pub struct DataProtoSource<R> {
    input: R,
}

impl<R: PacketRecv> DataProtoSource<R> {
    pub fn new(input: R) -> DataProtoSource<R> {
        DataProtoSource { input }
    }

    pub fn frame_mtu(&self) -> usize {
        self.input.mtu()
    }

    /// the next frame from the input, `None` once the input is closed
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        self.input.recv().await
    }

    /// Route a frame to each of `destinations`, returning the number of flows that accepted it.
    ///  A frame that does not fit a flow's MTU is not routed to that flow.
    pub fn route(&self, frame: &[u8], destinations: &[&DataProtoFlow]) -> usize {
        let mut num_routed = 0;
        for flow in destinations {
            if frame.len() > flow.frame_mtu() {
                debug!("frame of length {} exceeds the MTU {} of the flow to {} - not routing it there", frame.len(), flow.frame_mtu(), flow.dest_id());
                continue;
            }
            if flow.route(frame) {
                num_routed += 1;
            }
        }
        trace!("routed frame of length {} to {} of {} destinations", frame.len(), num_routed, destinations.len());
        num_routed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use crate::config::{DataProtoFlowConfig, DataProtoSinkConfig};
    use crate::dataproto::parse_packet;
    use crate::dataproto::sink::DataProtoSink;
    use crate::flow::ChannelRecv;
    use crate::test_util::sink::RecordingSink;

    fn flow(dest_id: u16, frame_mtu: usize, num_packets: usize) -> DataProtoFlow {
        DataProtoFlow::new(DataProtoFlowConfig { num_packets, inactivity_time: None }, 1, dest_id, frame_mtu).unwrap().0
    }

    #[tokio::test]
    async fn test_routes_to_all_destinations() {
        let (tx, rx) = mpsc::channel(4);
        let mut source = DataProtoSource::new(ChannelRecv::new(rx, 100));
        assert_eq!(source.frame_mtu(), 100);

        let output_2 = RecordingSink::new(200);
        let output_3 = RecordingSink::new(200);
        let sink_2 = DataProtoSink::new(DataProtoSinkConfig::default_for_mtu(100), output_2.clone()).unwrap().0;
        let sink_3 = DataProtoSink::new(DataProtoSinkConfig::default_for_mtu(100), output_3.clone()).unwrap().0;
        let mut flow_2 = flow(2, 100, 4);
        let mut flow_3 = flow(3, 100, 4);
        flow_2.attach(&sink_2.handle());
        flow_3.attach(&sink_3.handle());

        tx.send(Bytes::from_static(b"broadcast")).await.unwrap();
        let frame = source.next_frame().await.unwrap();
        assert_eq!(source.route(&frame, &[&flow_2, &flow_3]), 2);

        for (output, dest_id) in [(output_2, 2u16), (output_3, 3)] {
            let packets = output.wait_for_packets(2).await;
            let packet = packets.into_iter()
                .map(|p| parse_packet(p.into()).unwrap())
                .find(|p| !p.is_keepalive())
                .unwrap();
            assert_eq!(packet.from_id, 1);
            assert_eq!(packet.dest_ids, vec![dest_id]);
            assert_eq!(packet.frame, Bytes::from_static(b"broadcast"));
        }

        drop(tx);
        assert!(source.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_skips_full_and_too_small_flows() {
        let (_tx, rx) = mpsc::channel(1);
        let source = DataProtoSource::new(ChannelRecv::new(rx, 100));

        let full = flow(2, 100, 1);
        assert!(full.route(b"x"));
        let small = flow(3, 4, 4);
        let ok = flow(4, 100, 4);

        assert_eq!(source.route(b"frame", &[&full, &small, &ok]), 1);
    }
}
