//! The udpgw wire format. Every frame travels as one PacketProto packet over the stream to the
//!  gateway server:
//!
//! ```ascii
//! 0:  flags (u8)
//! 1:  connection id (u16 LE)
//! 3:  remote address - omitted for keepalives
//!     IPv4: ip (4 bytes), port (u16 BE)
//!     IPv6: ip (16 bytes), port (u16 BE), if the IPV6 flag is set
//! *:  UDP payload
//! ```
//!
//! Flags:
//! * KEEPALIVE: a control frame without address or payload, sent by either side to keep the
//!   stream alive. The connection id is ignored.
//! * REBIND: the id refers to a fresh logical connection, the server discards state it has for it
//! * DNS: the server sends the payload to its configured DNS server instead of the address
//! * IPV6: the address is an IPv6 address

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct UdpGwFlags: u8 {
        const KEEPALIVE = 0b0000_0001;
        const REBIND    = 0b0000_0010;
        const DNS       = 0b0000_0100;
        const IPV6      = 0b0000_1000;
    }
}

pub const UDPGW_HEADER_LEN: usize = 1 + 2;
pub const UDPGW_IPV4_ADDR_LEN: usize = 4 + 2;
pub const UDPGW_IPV6_ADDR_LEN: usize = 16 + 2;
pub const UDPGW_MAX_HEADER_LEN: usize = UDPGW_HEADER_LEN + UDPGW_IPV6_ADDR_LEN;

/// frames must fit a single PacketProto packet
pub const UDPGW_MAX_MTU: usize = u16::MAX as usize;

/// The size of the largest frame carrying a UDP payload of at most `udp_mtu` bytes
pub fn frame_mtu(udp_mtu: usize) -> usize {
    UDPGW_MAX_HEADER_LEN + udp_mtu
}

pub fn addr_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => UDPGW_IPV4_ADDR_LEN,
        SocketAddr::V6(_) => UDPGW_IPV6_ADDR_LEN,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpGwFrame {
    Keepalive,
    Data {
        flags: UdpGwFlags,
        conid: u16,
        remote: SocketAddr,
        payload: Bytes,
    },
}

impl UdpGwFrame {
    /// Serialize a data frame. The IPV6 flag is derived from the address.
    pub fn ser_data(buf: &mut impl BufMut, flags: UdpGwFlags, conid: u16, remote: SocketAddr, payload: &[u8]) {
        let flags = match remote {
            SocketAddr::V4(_) => flags - UdpGwFlags::IPV6,
            SocketAddr::V6(_) => flags | UdpGwFlags::IPV6,
        };
        buf.put_u8(flags.bits());
        buf.put_u16_le(conid);
        match remote {
            SocketAddr::V4(addr) => {
                buf.put_u32(addr.ip().to_bits());
                buf.put_u16(addr.port());
            }
            SocketAddr::V6(addr) => {
                buf.put_u128(addr.ip().to_bits());
                buf.put_u16(addr.port());
            }
        }
        buf.put_slice(payload);
    }

    pub fn ser_keepalive(buf: &mut impl BufMut) {
        buf.put_u8(UdpGwFlags::KEEPALIVE.bits());
        buf.put_u16_le(0);
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<UdpGwFrame> {
        let flags = UdpGwFlags::from_bits_retain(buf.try_get_u8()?);
        let conid = buf.try_get_u16_le()?;

        if flags.contains(UdpGwFlags::KEEPALIVE) {
            return Ok(UdpGwFrame::Keepalive);
        }

        let remote: SocketAddr = if flags.contains(UdpGwFlags::IPV6) {
            SocketAddrV6::new(buf.try_get_u128()?.into(), buf.try_get_u16()?, 0, 0).into()
        }
        else {
            SocketAddrV4::new(buf.try_get_u32()?.into(), buf.try_get_u16()?).into()
        };

        Ok(UdpGwFrame::Data {
            flags,
            conid,
            remote,
            payload: buf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use rstest::rstest;

    #[rstest]
    #[case::v4(UdpGwFlags::empty(), "1.2.3.4:53", vec![0, 5, 1, 1, 2, 3, 4, 0, 53, b'x'])]
    #[case::v4_rebind(UdpGwFlags::REBIND, "1.2.3.4:256", vec![2, 5, 1, 1, 2, 3, 4, 1, 0, b'x'])]
    #[case::v4_dns_clears_ipv6(UdpGwFlags::DNS | UdpGwFlags::IPV6, "1.2.3.4:53", vec![4, 5, 1, 1, 2, 3, 4, 0, 53, b'x'])]
    #[case::v6(UdpGwFlags::empty(), "[::1]:53", [vec![8, 5, 1], vec![0; 15], vec![1, 0, 53, b'x']].concat())]
    fn test_ser_data(#[case] flags: UdpGwFlags, #[case] remote: &str, #[case] expected: Vec<u8>) {
        let remote = SocketAddr::from_str(remote).unwrap();
        let mut buf = Vec::new();
        UdpGwFrame::ser_data(&mut buf, flags, 0x105, remote, b"x");
        assert_eq!(buf, expected);
        assert_eq!(buf.len(), UDPGW_HEADER_LEN + addr_len(&remote) + 1);

        let expected_flags = if remote.is_ipv6() { flags | UdpGwFlags::IPV6 } else { flags - UdpGwFlags::IPV6 };
        assert_eq!(UdpGwFrame::deser(buf.into()).unwrap(), UdpGwFrame::Data {
            flags: expected_flags,
            conid: 0x105,
            remote,
            payload: Bytes::from_static(b"x"),
        });
    }

    #[test]
    fn test_keepalive() {
        let mut buf = Vec::new();
        UdpGwFrame::ser_keepalive(&mut buf);
        assert_eq!(buf, vec![1, 0, 0]);
        assert_eq!(UdpGwFrame::deser(buf.into()).unwrap(), UdpGwFrame::Keepalive);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short_header(vec![0, 1])]
    #[case::short_v4(vec![0, 1, 0, 1, 2, 3, 4, 0])]
    #[case::short_v6(vec![8, 1, 0, 1, 2, 3, 4, 0, 53])]
    fn test_deser_truncated(#[case] buf: Vec<u8>) {
        assert!(UdpGwFrame::deser(buf.into()).is_err());
    }

    #[test]
    fn test_frame_mtu() {
        assert_eq!(UDPGW_MAX_HEADER_LEN, 21);
        assert_eq!(frame_mtu(1500), 1521);
    }
}
