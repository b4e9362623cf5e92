//! FragmentProto: transporting frames bigger than a carrier packet as chunks.
//!
//! A carrier packet contains any number of chunks back to back, possibly of different frames:
//!
//! ```ascii
//! 0:  frame id (u16 LE)
//! 2:  chunk start (u16 LE) - offset of the chunk's payload in the frame
//! 4:  chunk length (u16 LE)
//! 6:  is last (u8) - 1 if this chunk ends the frame, 0 otherwise
//! 7:  chunk payload (chunk length bytes)
//! ```
//!
//! Chunks of a frame may arrive in any order, interleaved with chunks of other frames, and may be
//!  lost. The receiving side ([assembler::FrameAssembler]) keeps a fixed number of partially
//!  assembled frames and gives up on a frame when it runs out of slots (evicting the frame that
//!  was started first), when the frame's chunks are inconsistent, or when the frame did not make
//!  progress for a configured number of carrier packets.

use anyhow::bail;
use bytes::{Buf, BufMut};

pub mod assembler;
pub mod disassembler;

pub const CHUNK_HEADER_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub frame_id: u16,
    pub chunk_start: u16,
    pub chunk_len: u16,
    pub is_last: bool,
}

impl ChunkHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.frame_id);
        buf.put_u16_le(self.chunk_start);
        buf.put_u16_le(self.chunk_len);
        buf.put_u8(self.is_last as u8);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ChunkHeader> {
        if buf.remaining() < CHUNK_HEADER_LEN {
            bail!("too little data for chunk header");
        }

        let frame_id = buf.get_u16_le();
        let chunk_start = buf.get_u16_le();
        let chunk_len = buf.get_u16_le();
        let is_last = match buf.get_u8() {
            0 => false,
            1 => true,
            other => bail!("invalid is_last value {}", other),
        };

        Ok(ChunkHeader {
            frame_id,
            chunk_start,
            chunk_len,
            is_last,
        })
    }
}

/// The maximum number of chunks a frame of `frame_mtu` bytes is split into by a disassembler
///  with the given chunk MTU: a frame can start in the middle of a carrier packet, so one more
///  than the number of full chunks.
pub fn max_chunks_for_frame(frame_mtu: usize, chunk_mtu: usize) -> usize {
    frame_mtu.div_ceil(chunk_mtu) + 1
}
