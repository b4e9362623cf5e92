//! DataProto: the framing of payload packets exchanged between peers.
//!
//! ```ascii
//! 0:  flags (u8)
//! 1:  from peer id (u16 LE)
//! 3:  number of destination peer ids (u16 LE)
//! 5:  destination peer ids (u16 LE each)
//! *:  frame
//! ```
//!
//! A keepalive is a packet without destination ids and without a frame; its only purpose is to
//!  show the peer that the link works, and to tell it through the `RECEIVING_KEEPALIVES` flag
//!  whether we hear from it.
//!
//! A [sink::DataProtoSink] is the sending side towards one peer. Any number of
//!  [flow::DataProtoFlow]s, one per source and destination pair, attach to sinks and are served
//!  fairly. [source::DataProtoSource] reads frames from a local source (e.g. a TAP device) and
//!  routes them to flows.

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};
use crate::util::safe_converter::PrecheckedCast;

pub mod flow;
pub mod sink;
pub mod source;

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct DataProtoFlags: u8 {
        /// the sender received something from us recently
        const RECEIVING_KEEPALIVES = 0b0000_0001;
    }
}

pub const DATAPROTO_HEADER_LEN: usize = 1 + 2 + 2;
pub const DATAPROTO_PEER_ID_LEN: usize = 2;

/// the overhead of a packet with a single destination, which is what flows send
pub const DATAPROTO_MAX_OVERHEAD: usize = DATAPROTO_HEADER_LEN + DATAPROTO_PEER_ID_LEN;

pub fn ser_header(buf: &mut impl BufMut, flags: DataProtoFlags, from_id: u16, dest_ids: &[u16]) {
    buf.put_u8(flags.bits());
    buf.put_u16_le(from_id);
    buf.put_u16_le(dest_ids.len().prechecked_cast());
    for dest_id in dest_ids {
        buf.put_u16_le(*dest_id);
    }
}

pub fn keepalive_packet() -> Bytes {
    let mut buf = Vec::with_capacity(DATAPROTO_HEADER_LEN);
    ser_header(&mut buf, DataProtoFlags::empty(), 0, &[]);
    buf.into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataProtoPacket {
    pub flags: DataProtoFlags,
    pub from_id: u16,
    pub dest_ids: Vec<u16>,
    pub frame: Bytes,
}

impl DataProtoPacket {
    pub fn is_keepalive(&self) -> bool {
        self.dest_ids.is_empty() && self.frame.is_empty()
    }
}

/// Decode a packet received from a peer. Unknown flags are preserved.
pub fn parse_packet(mut buf: Bytes) -> anyhow::Result<DataProtoPacket> {
    if buf.remaining() < DATAPROTO_HEADER_LEN {
        bail!("packet of length {} is too short for a DataProto header", buf.remaining());
    }

    let flags = DataProtoFlags::from_bits_retain(buf.get_u8());
    let from_id = buf.get_u16_le();
    let num_dest_ids = buf.get_u16_le() as usize;

    if buf.remaining() < num_dest_ids * DATAPROTO_PEER_ID_LEN {
        bail!("packet is too short for {} destination peer ids", num_dest_ids);
    }
    let dest_ids = (0..num_dest_ids)
        .map(|_| buf.get_u16_le())
        .collect();

    Ok(DataProtoPacket {
        flags,
        from_id,
        dest_ids,
        frame: buf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_ser_header() {
        let mut buf = Vec::new();
        ser_header(&mut buf, DataProtoFlags::RECEIVING_KEEPALIVES, 0x102, &[3, 0x405]);
        assert_eq!(buf, vec![1, 2, 1, 2, 0, 3, 0, 5, 4]);
    }

    #[test]
    fn test_parse_packet() {
        let mut buf = Vec::new();
        ser_header(&mut buf, DataProtoFlags::RECEIVING_KEEPALIVES, 7, &[9]);
        buf.extend_from_slice(b"frame");

        let packet = parse_packet(buf.into()).unwrap();
        assert_eq!(packet, DataProtoPacket {
            flags: DataProtoFlags::RECEIVING_KEEPALIVES,
            from_id: 7,
            dest_ids: vec![9],
            frame: Bytes::from_static(b"frame"),
        });
        assert!(!packet.is_keepalive());
    }

    #[test]
    fn test_keepalive() {
        let packet = parse_packet(keepalive_packet()).unwrap();
        assert!(packet.is_keepalive());
        assert_eq!(packet.flags, DataProtoFlags::empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short_header(vec![0, 1, 0, 0])]
    #[case::missing_peer_id(vec![0, 1, 0, 2, 0, 5, 0])]
    fn test_parse_truncated(#[case] buf: Vec<u8>) {
        assert!(parse_packet(buf.into()).is_err());
    }
}
