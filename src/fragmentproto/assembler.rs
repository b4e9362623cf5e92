use std::collections::BTreeMap;
use async_trait::async_trait;
use tracing::{debug, trace};
use crate::config::FragmentConfig;
use crate::flow::PacketPass;
use crate::fragmentproto::ChunkHeader;
use crate::util::index_list::IndexList;
use crate::util::safe_converter::SafeCast;

#[derive(Clone, Copy, Debug)]
struct ChunkExtent {
    start: usize,
    len: usize,
}
impl ChunkExtent {
    fn overlaps(&self, start: usize, len: usize) -> bool {
        self.start < start + len && start < self.start + self.len
    }
}

struct FrameSlot {
    frame_id: u16,
    /// assembler time of the last chunk
    time: u32,
    chunks: Vec<ChunkExtent>,
    sum: usize,
    /// known once the last chunk arrived
    length: Option<usize>,
    /// highest chunk end so far while the length is unknown
    length_so_far: usize,
    buffer: Vec<u8>,
}

impl FrameSlot {
    fn new(num_chunks: usize, output_mtu: usize) -> FrameSlot {
        FrameSlot {
            frame_id: 0,
            time: 0,
            chunks: Vec::with_capacity(num_chunks),
            sum: 0,
            length: None,
            length_so_far: 0,
            buffer: vec![0u8; output_mtu],
        }
    }

    fn reset(&mut self, frame_id: u16, time: u32) {
        self.frame_id = frame_id;
        self.time = time;
        self.chunks.clear();
        self.sum = 0;
        self.length = None;
        self.length_so_far = 0;
    }
}

enum ChunkResult {
    Incomplete,
    Complete(Vec<u8>),
    Failed(&'static str),
}

/// Reassembles frames from carrier packets. This is the synchronous core of
///  [FragmentAssembler], with the assembler's clock advancing by one tick per input packet.
pub struct FrameAssembler {
    config: FragmentConfig,
    slots: Vec<FrameSlot>,
    free: Vec<usize>,
    used: BTreeMap<u16, usize>,
    /// used slots in allocation order, the front is evicted first
    used_order: IndexList,
    time: u32,
}

impl FrameAssembler {
    pub fn new(config: FragmentConfig) -> anyhow::Result<FrameAssembler> {
        config.validate()?;

        let slots = (0..config.num_frames)
            .map(|_| FrameSlot::new(config.num_chunks, config.output_mtu))
            .collect();

        Ok(FrameAssembler {
            free: (0..config.num_frames).rev().collect(),
            used: BTreeMap::new(),
            used_order: IndexList::with_capacity(config.num_frames),
            slots,
            time: 0,
            config,
        })
    }

    pub fn output_mtu(&self) -> usize {
        self.config.output_mtu
    }

    pub fn num_pending_frames(&self) -> usize {
        self.used.len()
    }

    pub(crate) fn time(&self) -> u32 {
        self.time
    }

    /// Process all chunks in a carrier packet, returning the frames completed by it in order of
    ///  completion. Processing stops at the first malformed chunk.
    pub fn process_packet(&mut self, mut packet: &[u8]) -> Vec<Vec<u8>> {
        let mut completed = Vec::new();

        while !packet.is_empty() {
            let header = match ChunkHeader::deser(&mut packet) {
                Ok(header) => header,
                Err(e) => {
                    debug!("dropping rest of carrier packet: {}", e);
                    break;
                }
            };

            let chunk_len: usize = header.chunk_len.safe_cast();
            if packet.len() < chunk_len {
                debug!("too little data for chunk payload - dropping rest of carrier packet");
                break;
            }
            let chunk_start: usize = header.chunk_start.safe_cast();
            if chunk_start + chunk_len > self.config.output_mtu {
                debug!("chunk {}+{} exceeds the frame MTU - dropping rest of carrier packet", chunk_start, chunk_len);
                break;
            }

            let (payload, rest) = packet.split_at(chunk_len);
            packet = rest;

            if let Some(frame) = self.process_chunk(header.frame_id, chunk_start, payload, header.is_last) {
                completed.push(frame);
            }
        }

        self.tick();
        completed
    }

    fn process_chunk(&mut self, frame_id: u16, chunk_start: usize, payload: &[u8], is_last: bool) -> Option<Vec<u8>> {
        let slot_idx = self.lookup_or_allocate(frame_id);

        match self.add_chunk(slot_idx, chunk_start, payload, is_last) {
            ChunkResult::Incomplete => None,
            ChunkResult::Complete(frame) => {
                trace!("frame {} complete: {} bytes", frame_id, frame.len());
                self.free_slot(slot_idx);
                Some(frame)
            }
            ChunkResult::Failed(reason) => {
                debug!("discarding frame {}: {}", frame_id, reason);
                self.free_slot(slot_idx);
                None
            }
        }
    }

    fn lookup_or_allocate(&mut self, frame_id: u16) -> usize {
        if let Some(&slot_idx) = self.used.get(&frame_id) {
            if !self.is_timed_out(slot_idx) {
                return slot_idx;
            }
            debug!("frame {} timed out - starting over", frame_id);
            self.free_slot(slot_idx);
        }

        if self.free.is_empty() {
            if let Some(oldest) = self.used_order.front() {
                debug!("no free frame slot - evicting frame {}", self.slots[oldest].frame_id);
                self.free_slot(oldest);
            }
        }

        let slot_idx = self.free.pop()
            .expect("a slot was freed above");
        self.slots[slot_idx].reset(frame_id, self.time);
        self.used.insert(frame_id, slot_idx);
        self.used_order.push_back(slot_idx);
        slot_idx
    }

    fn add_chunk(&mut self, slot_idx: usize, chunk_start: usize, payload: &[u8], is_last: bool) -> ChunkResult {
        let num_chunks = self.config.num_chunks;
        let time = self.time;
        let slot = &mut self.slots[slot_idx];

        let chunk_len = payload.len();
        let chunk_end = chunk_start + chunk_len;

        if slot.chunks.iter().any(|c| c.overlaps(chunk_start, chunk_len)) {
            return ChunkResult::Failed("chunk overlaps with an existing chunk");
        }

        if is_last {
            if slot.length.is_some() {
                return ChunkResult::Failed("second last chunk");
            }
            if slot.length_so_far > chunk_end {
                return ChunkResult::Failed("last chunk, but there is data beyond its end");
            }
        }
        else if let Some(length) = slot.length {
            if chunk_end > length {
                return ChunkResult::Failed("chunk beyond the frame's length");
            }
        }

        slot.time = time;
        slot.chunks.push(ChunkExtent { start: chunk_start, len: chunk_len });
        slot.sum += chunk_len;
        if is_last {
            slot.length = Some(chunk_end);
        }
        else if slot.length.is_none() {
            slot.length_so_far = slot.length_so_far.max(chunk_end);
        }
        slot.buffer[chunk_start..chunk_end].copy_from_slice(payload);

        match slot.length {
            Some(length) if slot.sum == length => ChunkResult::Complete(slot.buffer[..length].to_vec()),
            _ if slot.chunks.len() == num_chunks => ChunkResult::Failed("all chunks used, but frame is incomplete"),
            _ => ChunkResult::Incomplete,
        }
    }

    fn is_timed_out(&self, slot_idx: usize) -> bool {
        let slot_time = self.slots[slot_idx].time;
        debug_assert!(slot_time <= self.time);
        self.time - slot_time > self.config.time_tolerance
    }

    fn free_slot(&mut self, slot_idx: usize) {
        let frame_id = self.slots[slot_idx].frame_id;
        if self.used.get(&frame_id) == Some(&slot_idx) {
            self.used.remove(&frame_id);
        }
        self.used_order.remove(slot_idx);
        self.free.push(slot_idx);
    }

    fn tick(&mut self) {
        if self.time < self.config.max_time {
            self.time += 1;
            return;
        }

        self.reduce_times();
        if !self.used_order.is_empty() {
            // every surviving frame is within tolerance, so the minimum was positive
            self.time += 1;
        }
    }

    /// Normalize times when the clock reaches its maximum: evict timed out frames and shift all
    ///  times down by the oldest remaining frame's time.
    fn reduce_times(&mut self) {
        let used = self.used_order.iter().collect::<Vec<_>>();
        let mut min_time = None;

        for slot_idx in used {
            if self.is_timed_out(slot_idx) {
                debug!("frame {} timed out while normalizing times", self.slots[slot_idx].frame_id);
                self.free_slot(slot_idx);
            }
            else {
                let t = self.slots[slot_idx].time;
                min_time = Some(min_time.map_or(t, |m: u32| m.min(t)));
            }
        }

        let Some(min_time) = min_time else {
            self.time = 0;
            return;
        };

        trace!("normalizing frame times by {}", min_time);
        for slot_idx in self.used_order.iter().collect::<Vec<_>>() {
            self.slots[slot_idx].time -= min_time;
        }
        self.time -= min_time;
    }
}

/// A pipeline stage reassembling frames from carrier packets and passing them to its output
pub struct FragmentAssembler<O> {
    assembler: FrameAssembler,
    output: O,
    input_mtu: usize,
}

impl<O: PacketPass> FragmentAssembler<O> {
    /// `input_mtu` is the maximum carrier packet size
    pub fn new(config: FragmentConfig, input_mtu: usize, output: O) -> anyhow::Result<FragmentAssembler<O>> {
        if output.mtu() < config.output_mtu {
            anyhow::bail!("output MTU {} is smaller than the frame MTU {}", output.mtu(), config.output_mtu);
        }
        Ok(FragmentAssembler {
            assembler: FrameAssembler::new(config)?,
            output,
            input_mtu,
        })
    }
}

#[async_trait]
impl<O: PacketPass> PacketPass for FragmentAssembler<O> {
    fn mtu(&self) -> usize {
        self.input_mtu
    }

    async fn send(&mut self, packet: &[u8]) {
        for frame in self.assembler.process_packet(packet) {
            self.output.send(&frame).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::sink::RecordingSink;
    use rstest::rstest;

    fn chunk(frame_id: u16, start: u16, payload: &[u8], is_last: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        ChunkHeader {
            frame_id,
            chunk_start: start,
            chunk_len: payload.len() as u16,
            is_last,
        }.ser(&mut buf);
        buf.extend_from_slice(payload);
        buf
    }

    fn frame_bytes(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn assembler(num_frames: usize, num_chunks: usize, output_mtu: usize) -> FrameAssembler {
        FrameAssembler::new(FragmentConfig::new(output_mtu, num_frames, num_chunks)).unwrap()
    }

    #[test]
    fn test_out_of_order_three_chunks() {
        let mut assembler = assembler(4, 4, 1200);
        let frame = frame_bytes(1200, 7);

        assert!(assembler.process_packet(&chunk(7, 0, &frame[0..500], false)).is_empty());
        assert!(assembler.process_packet(&chunk(7, 900, &frame[900..1200], true)).is_empty());
        let completed = assembler.process_packet(&chunk(7, 500, &frame[500..900], false));

        assert_eq!(completed, vec![frame]);
        assert_eq!(assembler.num_pending_frames(), 0);
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3])]
    #[case::reversed(vec![3, 2, 1, 0])]
    #[case::last_first(vec![3, 0, 1, 2])]
    #[case::shuffled(vec![2, 0, 3, 1])]
    fn test_any_order_interleaved(#[case] order: Vec<usize>) {
        let mut assembler = assembler(4, 4, 1000);
        let frame_a = frame_bytes(1000, 1);
        let frame_b = frame_bytes(401, 2);

        let pieces = |frame: &[u8], id: u16| {
            let quarter = frame.len() / 4;
            (0..4).map(|i| {
                let start = i * quarter;
                let end = if i == 3 { frame.len() } else { start + quarter };
                chunk(id, start as u16, &frame[start..end], i == 3)
            }).collect::<Vec<_>>()
        };
        let a = pieces(&frame_a, 100);
        let b = pieces(&frame_b, 101);

        let mut completed = Vec::new();
        for &i in &order {
            completed.extend(assembler.process_packet(&a[i]));
            completed.extend(assembler.process_packet(&b[i]));
        }
        assert_eq!(completed, vec![frame_a, frame_b]);
    }

    #[test]
    fn test_several_chunks_in_one_packet() {
        let mut assembler = assembler(4, 4, 100);
        let mut packet = chunk(1, 0, b"abc", false);
        packet.extend(chunk(2, 0, b"xyz", true));
        packet.extend(chunk(1, 3, b"def", true));

        assert_eq!(assembler.process_packet(&packet), vec![b"xyz".to_vec(), b"abcdef".to_vec()]);
    }

    #[rstest]
    #[case::same_range(0, 100, 0, 100)]
    #[case::contained(0, 100, 10, 20)]
    #[case::tail_overlap(0, 100, 99, 10)]
    #[case::head_overlap(50, 100, 0, 51)]
    fn test_overlap_discards_frame(#[case] start_a: u16, #[case] len_a: usize, #[case] start_b: u16, #[case] len_b: usize) {
        let mut assembler = assembler(4, 4, 1000);

        assert!(assembler.process_packet(&chunk(1, start_a, &vec![1; len_a], false)).is_empty());
        assert!(assembler.process_packet(&chunk(1, start_b, &vec![2; len_b], false)).is_empty());
        assert_eq!(assembler.num_pending_frames(), 0);

        // the frame is gone: completing the original layout does not emit anything stale
        let completed = assembler.process_packet(&chunk(1, 200, &[3; 10], true));
        assert!(completed.is_empty());
        assert_eq!(assembler.num_pending_frames(), 1);
    }

    #[test]
    fn test_adjacent_chunks_do_not_overlap() {
        let mut assembler = assembler(4, 4, 1000);
        assert!(assembler.process_packet(&chunk(1, 0, &[1; 10], false)).is_empty());
        assert_eq!(assembler.process_packet(&chunk(1, 10, &[2; 10], true)), vec![[vec![1u8; 10], vec![2u8; 10]].concat()]);
    }

    #[rstest]
    #[case::second_last(vec![(10, 10, true), (30, 10, true)])]
    #[case::last_before_data(vec![(50, 10, false), (0, 10, true)])]
    #[case::beyond_length(vec![(10, 10, true), (20, 10, false)])]
    fn test_inconsistent_length_discards_frame(#[case] chunks: Vec<(u16, usize, bool)>) {
        let mut assembler = assembler(4, 4, 1000);
        for (start, len, is_last) in chunks {
            assert!(assembler.process_packet(&chunk(1, start, &vec![0; len], is_last)).is_empty());
        }
        assert_eq!(assembler.num_pending_frames(), 0);
    }

    #[test]
    fn test_chunks_exhausted_discards_frame() {
        let mut assembler = assembler(4, 2, 1000);
        assert!(assembler.process_packet(&chunk(1, 0, &[0; 10], false)).is_empty());
        assert!(assembler.process_packet(&chunk(1, 10, &[0; 10], false)).is_empty());
        assert_eq!(assembler.num_pending_frames(), 0);
    }

    #[test]
    fn test_eviction_of_oldest_frame() {
        let mut assembler = assembler(4, 4, 1000);
        for id in 1..=5 {
            assert!(assembler.process_packet(&chunk(id, 0, &[id as u8; 100], false)).is_empty());
        }
        assert_eq!(assembler.num_pending_frames(), 4);

        // frame 3 is still there and fails on overlap, freeing its slot
        assert!(assembler.process_packet(&chunk(3, 0, &[9; 100], true)).is_empty());
        assert_eq!(assembler.num_pending_frames(), 3);

        // frame 1 was evicted, so an overlapping chunk starts it over
        assert_eq!(assembler.process_packet(&chunk(1, 0, &[9; 100], true)), vec![vec![9u8; 100]]);
    }

    #[test]
    fn test_eviction_ignores_progress() {
        let mut assembler = assembler(2, 4, 1000);
        assert!(assembler.process_packet(&chunk(1, 0, &[1; 100], false)).is_empty());
        assert!(assembler.process_packet(&chunk(2, 0, &[2; 10], false)).is_empty());
        assert!(assembler.process_packet(&chunk(1, 100, &[1; 100], false)).is_empty());

        // frame 1 has more data but was started first
        assert!(assembler.process_packet(&chunk(3, 0, &[3; 10], false)).is_empty());
        assert_eq!(assembler.process_packet(&chunk(2, 10, &[2; 10], true)), vec![vec![2u8; 20]]);

        assert!(assembler.process_packet(&chunk(1, 200, &[1; 10], true)).is_empty());
        assert_eq!(assembler.num_pending_frames(), 2);
    }

    #[test]
    fn test_timed_out_frame_starts_over() {
        let mut assembler = FrameAssembler::new(FragmentConfig {
            time_tolerance: 2,
            ..FragmentConfig::new(1000, 4, 4)
        }).unwrap();

        assert!(assembler.process_packet(&chunk(1, 0, &[1; 100], false)).is_empty());
        for _ in 0..3 {
            assert!(assembler.process_packet(&[]).is_empty());
        }

        // time 4, frame time 0: beyond tolerance
        assert_eq!(assembler.process_packet(&chunk(1, 0, &[2; 100], true)), vec![vec![2u8; 100]]);
    }

    #[test]
    fn test_frame_within_tolerance_is_kept() {
        let mut assembler = FrameAssembler::new(FragmentConfig {
            time_tolerance: 3,
            ..FragmentConfig::new(1000, 4, 4)
        }).unwrap();

        assert!(assembler.process_packet(&chunk(1, 0, &[1; 100], false)).is_empty());
        for _ in 0..2 {
            assert!(assembler.process_packet(&[]).is_empty());
        }
        assert_eq!(assembler.process_packet(&chunk(1, 100, &[2; 100], true)), vec![[vec![1u8; 100], vec![2u8; 100]].concat()]);
    }

    #[test]
    fn test_time_normalization_without_frames() {
        let mut assembler = FrameAssembler::new(FragmentConfig {
            max_time: 10,
            time_tolerance: 3,
            ..FragmentConfig::new(1000, 2, 4)
        }).unwrap();

        assert!(assembler.process_packet(&chunk(1, 0, &[1; 10], false)).is_empty());
        while assembler.time() < 10 {
            assembler.process_packet(&[]);
        }
        assembler.process_packet(&[]);

        assert_eq!(assembler.time(), 0);
        assert_eq!(assembler.num_pending_frames(), 0);
    }

    #[test]
    fn test_time_normalization_keeps_recent_frames() {
        let mut assembler = FrameAssembler::new(FragmentConfig {
            max_time: 10,
            time_tolerance: 3,
            ..FragmentConfig::new(1000, 2, 4)
        }).unwrap();

        while assembler.time() < 8 {
            assembler.process_packet(&[]);
        }
        assert!(assembler.process_packet(&chunk(1, 0, &[1; 10], false)).is_empty());
        assert_eq!(assembler.time(), 9);
        assembler.process_packet(&[]);
        assert_eq!(assembler.time(), 10);

        // normalizing: frame time 8 -> 0, clock 10 -> 2, then the tick
        assembler.process_packet(&[]);
        assert_eq!(assembler.time(), 3);
        assert_eq!(assembler.num_pending_frames(), 1);

        assert_eq!(assembler.process_packet(&chunk(1, 10, &[2; 10], true)), vec![[vec![1u8; 10], vec![2u8; 10]].concat()]);
    }

    #[rstest]
    #[case::short_header(vec![1, 0, 0])]
    #[case::bad_is_last({ let mut c = chunk(1, 0, b"abc", true); c[6] = 5; c })]
    #[case::truncated_payload({ let mut c = chunk(1, 0, b"abc", true); c.pop(); c })]
    #[case::beyond_mtu(chunk(1, 99, b"ab", true))]
    fn test_malformed_chunk_stops_processing(#[case] malformed: Vec<u8>) {
        let mut assembler = assembler(4, 4, 100);
        let mut packet = chunk(2, 0, b"ok", true);
        packet.extend(malformed);
        packet.extend(chunk(3, 0, b"never", true));

        assert_eq!(assembler.process_packet(&packet), vec![b"ok".to_vec()]);
    }

    #[tokio::test]
    async fn test_pipeline_stage() {
        let sink = RecordingSink::new(1200);
        let mut stage = FragmentAssembler::new(FragmentConfig::new(1200, 4, 4), 600, sink.clone()).unwrap();
        assert_eq!(stage.mtu(), 600);

        let frame = frame_bytes(1000, 3);
        stage.send(&chunk(1, 500, &frame[500..], true)).await;
        assert!(sink.packets().is_empty());
        stage.send(&chunk(1, 0, &frame[..500], false)).await;
        assert_eq!(sink.packets(), vec![frame]);
    }
}
