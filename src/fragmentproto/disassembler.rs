use std::time::Duration;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::DisassemblerConfig;
use crate::flow::PacketPass;
use crate::fragmentproto::{ChunkHeader, CHUNK_HEADER_LEN};
use crate::util::safe_converter::PrecheckedCast;

/// Splits frames into chunks and packs them into carrier packets. Chunks of consecutive frames
///  share carrier packets, so a packet is only complete once no further chunk fits; the owner
///  decides when to [FrameDisassembler::flush] a partially filled one.
pub struct FrameDisassembler {
    input_mtu: usize,
    carrier_mtu: usize,
    chunk_mtu: usize,
    next_frame_id: u16,
    current: Option<BytesMut>,
}

impl FrameDisassembler {
    pub fn new(config: &DisassemblerConfig) -> anyhow::Result<FrameDisassembler> {
        config.validate()?;

        let max_chunk_payload = config.carrier_mtu - CHUNK_HEADER_LEN;
        let chunk_mtu = config.chunk_mtu
            .map(|c| c.min(max_chunk_payload))
            .unwrap_or(max_chunk_payload);

        Ok(FrameDisassembler {
            input_mtu: config.input_mtu,
            carrier_mtu: config.carrier_mtu,
            chunk_mtu,
            next_frame_id: 0,
            current: None,
        })
    }

    pub fn input_mtu(&self) -> usize {
        self.input_mtu
    }

    pub fn carrier_mtu(&self) -> usize {
        self.carrier_mtu
    }

    pub fn has_partial_packet(&self) -> bool {
        self.current.is_some()
    }

    /// Add a frame, returning the carrier packets that were filled up by it.
    pub fn push_frame(&mut self, frame: &[u8]) -> Vec<Bytes> {
        assert!(frame.len() <= self.input_mtu, "frame of length {} exceeds MTU {}", frame.len(), self.input_mtu);

        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        trace!("splitting frame {} of length {}", frame_id, frame.len());

        let mut completed = Vec::new();
        let mut offset = 0;
        loop {
            let carrier_mtu = self.carrier_mtu;
            let out = self.current.get_or_insert_with(|| BytesMut::with_capacity(carrier_mtu));

            let available = carrier_mtu - out.len() - CHUNK_HEADER_LEN;
            let chunk_len = (frame.len() - offset).min(available).min(self.chunk_mtu);
            let is_last = offset + chunk_len == frame.len();

            ChunkHeader {
                frame_id,
                chunk_start: offset.prechecked_cast(),
                chunk_len: chunk_len.prechecked_cast(),
                is_last,
            }.ser(out);
            out.put_slice(&frame[offset..offset + chunk_len]);
            offset += chunk_len;

            if carrier_mtu - out.len() < CHUNK_HEADER_LEN + 1 {
                if let Some(packet) = self.flush() {
                    completed.push(packet);
                }
            }

            if is_last {
                break;
            }
        }
        completed
    }

    /// Take the partially filled carrier packet, if any
    pub fn flush(&mut self) -> Option<Bytes> {
        self.current.take()
            .map(|b| b.freeze())
    }
}

/// A pipeline stage splitting frames into carrier packets for its output. A background task
///  drives the output and flushes partially filled packets once the configured latency has
///  passed without the packet filling up.
pub struct FragmentDisassembler {
    tx: mpsc::Sender<Vec<u8>>,
    input_mtu: usize,
    task: JoinHandle<()>,
}

impl FragmentDisassembler {
    pub fn new<O: PacketPass + 'static>(config: DisassemblerConfig, output: O) -> anyhow::Result<FragmentDisassembler> {
        if output.mtu() < config.carrier_mtu {
            anyhow::bail!("output MTU {} is smaller than the carrier MTU {}", output.mtu(), config.carrier_mtu);
        }
        let disassembler = FrameDisassembler::new(&config)?;
        let input_mtu = disassembler.input_mtu();

        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(Self::run(disassembler, config.latency, rx, output));

        Ok(FragmentDisassembler { tx, input_mtu, task })
    }

    async fn run<O: PacketPass>(mut disassembler: FrameDisassembler, latency: Option<Duration>, mut rx: mpsc::Receiver<Vec<u8>>, mut output: O) {
        let mut flush_deadline: Option<Instant> = None;

        loop {
            let deadline = flush_deadline;
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    for packet in disassembler.push_frame(&frame) {
                        output.send(&packet).await;
                    }

                    match latency {
                        None => {
                            if let Some(packet) = disassembler.flush() {
                                output.send(&packet).await;
                            }
                        }
                        Some(latency) => {
                            if !disassembler.has_partial_packet() {
                                flush_deadline = None;
                            }
                            else if flush_deadline.is_none() {
                                flush_deadline = Some(Instant::now() + latency);
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    flush_deadline = None;
                    if let Some(packet) = disassembler.flush() {
                        trace!("latency passed - sending partial carrier packet of length {}", packet.len());
                        output.send(&packet).await;
                    }
                }
            }
        }

        if let Some(packet) = disassembler.flush() {
            output.send(&packet).await;
        }
        debug!("fragment disassembler input closed");
    }
}

impl Drop for FragmentDisassembler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl PacketPass for FragmentDisassembler {
    fn mtu(&self) -> usize {
        self.input_mtu
    }

    async fn send(&mut self, packet: &[u8]) {
        assert!(packet.len() <= self.input_mtu, "frame of length {} exceeds MTU {}", packet.len(), self.input_mtu);
        if self.tx.send(packet.to_vec()).await.is_err() {
            debug!("disassembler task is gone - dropping frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FragmentConfig;
    use crate::fragmentproto::assembler::FrameAssembler;
    use crate::fragmentproto::max_chunks_for_frame;
    use crate::test_util::sink::RecordingSink;
    use rstest::rstest;

    fn config(input_mtu: usize, carrier_mtu: usize, chunk_mtu: Option<usize>, latency: Option<Duration>) -> DisassemblerConfig {
        DisassemblerConfig {
            input_mtu,
            carrier_mtu,
            chunk_mtu,
            latency,
        }
    }

    fn headers(mut packet: &[u8]) -> Vec<ChunkHeader> {
        let mut result = Vec::new();
        while !packet.is_empty() {
            let header = ChunkHeader::deser(&mut packet).unwrap();
            packet = &packet[header.chunk_len as usize..];
            result.push(header);
        }
        result
    }

    #[test]
    fn test_single_frame_fits() {
        let mut disassembler = FrameDisassembler::new(&config(100, 100, None, None)).unwrap();
        assert!(disassembler.push_frame(b"hello").is_empty());

        let packet = disassembler.flush().unwrap();
        assert_eq!(headers(&packet), vec![ChunkHeader { frame_id: 0, chunk_start: 0, chunk_len: 5, is_last: true }]);
        assert_eq!(&packet[CHUNK_HEADER_LEN..], b"hello");
        assert!(disassembler.flush().is_none());
    }

    #[test]
    fn test_large_frame_is_split() {
        let mut disassembler = FrameDisassembler::new(&config(1000, 107, None, None)).unwrap();
        let packets = disassembler.push_frame(&[7; 250]);

        assert_eq!(packets.len(), 2);
        assert_eq!(headers(&packets[0]), vec![ChunkHeader { frame_id: 0, chunk_start: 0, chunk_len: 100, is_last: false }]);
        assert_eq!(headers(&packets[1]), vec![ChunkHeader { frame_id: 0, chunk_start: 100, chunk_len: 100, is_last: false }]);

        let rest = disassembler.flush().unwrap();
        assert_eq!(headers(&rest), vec![ChunkHeader { frame_id: 0, chunk_start: 200, chunk_len: 50, is_last: true }]);
    }

    #[test]
    fn test_chunk_mtu_limits_chunks() {
        let mut disassembler = FrameDisassembler::new(&config(1000, 1000, Some(40), None)).unwrap();
        assert!(disassembler.push_frame(&[1; 100]).is_empty());

        let packet = disassembler.flush().unwrap();
        let lens = headers(&packet).iter().map(|h| h.chunk_len).collect::<Vec<_>>();
        assert_eq!(lens, vec![40, 40, 20]);
    }

    #[test]
    fn test_consecutive_frames_share_packets() {
        let mut disassembler = FrameDisassembler::new(&config(100, 50, None, None)).unwrap();
        assert!(disassembler.push_frame(&[1; 20]).is_empty());
        let packets = disassembler.push_frame(&[2; 20]);

        assert_eq!(packets.len(), 1);
        assert_eq!(headers(&packets[0]), vec![
            ChunkHeader { frame_id: 0, chunk_start: 0, chunk_len: 20, is_last: true },
            ChunkHeader { frame_id: 1, chunk_start: 0, chunk_len: 16, is_last: false },
        ]);
        assert_eq!(headers(&disassembler.flush().unwrap()), vec![
            ChunkHeader { frame_id: 1, chunk_start: 16, chunk_len: 4, is_last: true },
        ]);
    }

    #[test]
    fn test_frame_ids_wrap() {
        let mut disassembler = FrameDisassembler::new(&config(100, 100, None, None)).unwrap();
        disassembler.next_frame_id = u16::MAX;

        disassembler.push_frame(b"a");
        disassembler.push_frame(b"b");
        let ids = headers(&disassembler.flush().unwrap()).iter().map(|h| h.frame_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![u16::MAX, 0]);
    }

    #[test]
    fn test_empty_frame() {
        let mut disassembler = FrameDisassembler::new(&config(100, 100, None, None)).unwrap();
        disassembler.push_frame(b"");
        assert_eq!(headers(&disassembler.flush().unwrap()), vec![ChunkHeader { frame_id: 0, chunk_start: 0, chunk_len: 0, is_last: true }]);
    }

    #[rstest]
    #[case::small_carrier(1500, 200, None)]
    #[case::chunk_limit(1500, 1000, Some(300))]
    #[case::tight(300, 8, None)]
    fn test_reassembles(#[case] frame_mtu: usize, #[case] carrier_mtu: usize, #[case] chunk_mtu: Option<usize>) {
        let mut disassembler = FrameDisassembler::new(&config(frame_mtu, carrier_mtu, chunk_mtu, None)).unwrap();
        let effective_chunk_mtu = chunk_mtu.unwrap_or(carrier_mtu - CHUNK_HEADER_LEN).min(carrier_mtu - CHUNK_HEADER_LEN);
        let mut assembler = FrameAssembler::new(FragmentConfig::new(frame_mtu, 4, max_chunks_for_frame(frame_mtu, effective_chunk_mtu))).unwrap();

        let frames = (0..5usize)
            .map(|i| (0..(frame_mtu - i * 17)).map(|j| (i + j) as u8).collect::<Vec<u8>>())
            .collect::<Vec<_>>();

        let mut packets = Vec::new();
        for frame in &frames {
            packets.extend(disassembler.push_frame(frame));
        }
        packets.extend(disassembler.flush());

        let mut reassembled = Vec::new();
        for packet in packets {
            assert!(packet.len() <= carrier_mtu);
            reassembled.extend(assembler.process_packet(&packet));
        }
        assert_eq!(reassembled, frames);
    }

    #[rstest]
    #[case::one_payload_byte(8, None, true)]
    #[case::header_only(7, None, false)]
    #[case::zero_chunk_mtu(100, Some(0), false)]
    fn test_config_validation(#[case] carrier_mtu: usize, #[case] chunk_mtu: Option<usize>, #[case] valid: bool) {
        assert_eq!(FrameDisassembler::new(&config(100, carrier_mtu, chunk_mtu, None)).is_ok(), valid);
    }

    #[tokio::test]
    async fn test_stage_without_latency_sends_right_away() {
        let sink = RecordingSink::new(100);
        let mut stage = FragmentDisassembler::new(config(100, 100, None, None), sink.clone()).unwrap();

        stage.send(b"abc").await;
        let packets = sink.wait_for_packets(1).await;
        assert_eq!(&packets[0][CHUNK_HEADER_LEN..], b"abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_flushes_after_latency() {
        let sink = RecordingSink::new(100);
        let mut stage = FragmentDisassembler::new(config(100, 100, None, Some(Duration::from_millis(5))), sink.clone()).unwrap();

        stage.send(b"abc").await;
        stage.send(b"def").await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(sink.packets().is_empty());

        let packets = sink.wait_for_packets(1).await;
        assert_eq!(headers(&packets[0]).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_sends_full_packets_before_latency() {
        let sink = RecordingSink::new(30);
        let mut stage = FragmentDisassembler::new(config(100, 30, None, Some(Duration::from_secs(10))), sink.clone()).unwrap();

        stage.send(&[1; 30]).await;
        let packets = sink.wait_for_packets(1).await;
        assert_eq!(packets[0].len(), 30);
        assert_eq!(sink.packets().len(), 1);
    }
}
