use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::fragmentproto::CHUNK_HEADER_LEN;
use crate::spproto::{CipherMode, HashMode, SpProtoParams};
use crate::udpgw::connection_table::EvictionStrategy;
use crate::udpgw::proto::{UDPGW_MAX_HEADER_LEN, UDPGW_MAX_MTU};

/// Security parameters of an SPProto link. Both ends must be configured identically.
#[derive(Clone, Debug)]
pub struct SpProtoConfig {
    pub encryption: Option<CipherMode>,
    pub hash: Option<HashMode>,
    pub otp: Option<OtpConfig>,
}

#[derive(Clone, Debug)]
pub struct OtpConfig {
    /// the cipher used for generating the token sequence of a seed
    pub mode: CipherMode,

    /// number of tokens per seed. Token tables are generated by encrypting a zero buffer, so this
    ///  must make the table a whole number of cipher blocks.
    pub num: u32,

    /// The encoder signals that tokens are running low when this many are left. The owner is
    ///  expected to negotiate a fresh seed in response.
    pub warning_count: u32,

    /// The number of most recent seeds the decoder accepts tokens from. This gives the peer time
    ///  to switch over to a new seed while packets encoded with the old seed are still in flight.
    pub num_seeds: usize,
}

impl SpProtoConfig {
    pub fn plain() -> SpProtoConfig {
        SpProtoConfig {
            encryption: None,
            hash: None,
            otp: None,
        }
    }

    pub fn default_secure() -> SpProtoConfig {
        SpProtoConfig {
            encryption: Some(CipherMode::Aes128Cbc),
            hash: Some(HashMode::Sha256),
            otp: Some(OtpConfig {
                mode: CipherMode::Aes128Cbc,
                num: 1024,
                warning_count: 256,
                num_seeds: 2,
            }),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(otp) = &self.otp {
            if otp.num == 0 {
                bail!("number of OTPs per seed must be positive");
            }
            if (otp.num as usize * std::mem::size_of::<u32>()) % otp.mode.block_size() != 0 {
                bail!("OTP table of {} tokens is not a whole number of {} byte blocks", otp.num, otp.mode.block_size());
            }
            if otp.warning_count == 0 || otp.warning_count > otp.num {
                bail!("OTP warning count must be in 1..={}", otp.num);
            }
            if otp.num_seeds == 0 {
                bail!("decoder must accept at least one OTP seed");
            }
        }
        Ok(())
    }

    pub fn params(&self) -> SpProtoParams {
        SpProtoParams::new(self)
    }
}

/// Configuration of the frame reassembler
#[derive(Clone, Debug)]
pub struct FragmentConfig {
    /// maximum size of a reassembled frame
    pub output_mtu: usize,

    /// Number of frames that can be reassembled concurrently. This should be at least the number
    ///  of frames that can be reordered in transit plus two.
    pub num_frames: usize,

    /// maximum number of chunks a frame can consist of
    pub num_chunks: usize,

    /// The reassembler's internal clock (counting input packets) normalizes when it reaches this
    ///  value. Configurable for testing normalization.
    pub max_time: u32,

    /// A frame that did not receive a chunk for more than this many input packets is considered
    ///  lost, and a new chunk for its id starts a fresh frame.
    pub time_tolerance: u32,
}

impl FragmentConfig {
    pub fn new(output_mtu: usize, num_frames: usize, num_chunks: usize) -> FragmentConfig {
        FragmentConfig {
            output_mtu,
            num_frames,
            num_chunks,
            max_time: u32::MAX,
            time_tolerance: num_frames as u32,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.output_mtu > u16::MAX as usize {
            bail!("frame MTU {} does not fit chunk offsets", self.output_mtu);
        }
        if self.num_frames == 0 {
            bail!("number of frames must be positive");
        }
        if self.num_chunks == 0 {
            bail!("number of chunks per frame must be positive");
        }
        if self.num_frames as u64 >= self.max_time as u64 {
            bail!("number of frames ({}) must be less than max time ({})", self.num_frames, self.max_time);
        }
        if self.time_tolerance >= self.max_time {
            bail!("time tolerance ({}) must be less than max time ({})", self.time_tolerance, self.max_time);
        }
        Ok(())
    }
}

/// Configuration of the frame splitter
#[derive(Clone, Debug)]
pub struct DisassemblerConfig {
    /// maximum size of an input frame
    pub input_mtu: usize,

    /// maximum size of a packet containing chunks
    pub carrier_mtu: usize,

    /// maximum payload size of a single chunk, `None` for no limit beyond the carrier MTU
    pub chunk_mtu: Option<usize>,

    /// How long a partially filled carrier packet waits for chunks of subsequent frames before it
    ///  is sent. `None` sends right away.
    pub latency: Option<Duration>,
}

impl DisassemblerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.input_mtu > u16::MAX as usize {
            bail!("frame MTU {} does not fit chunk offsets", self.input_mtu);
        }
        if self.carrier_mtu <= CHUNK_HEADER_LEN {
            bail!("carrier MTU {} leaves no room for chunk payload", self.carrier_mtu);
        }
        if self.chunk_mtu == Some(0) {
            bail!("chunk MTU must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct UdpGwClientConfig {
    /// maximum size of a UDP payload passing through the gateway
    pub udp_mtu: usize,

    pub max_connections: usize,

    /// number of packets buffered per connection before packets are dropped
    pub send_buffer_size: usize,

    /// the connection to the gateway sends a keepalive after this time without traffic
    pub keepalive_time: Duration,

    pub eviction: EvictionStrategy,
}

impl UdpGwClientConfig {
    pub fn default_for_mtu(udp_mtu: usize) -> UdpGwClientConfig {
        UdpGwClientConfig {
            udp_mtu,
            max_connections: 256,
            send_buffer_size: 8,
            keepalive_time: Duration::from_secs(10),
            eviction: EvictionStrategy::Reallocate,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.udp_mtu + UDPGW_MAX_HEADER_LEN > UDPGW_MAX_MTU {
            bail!("UDP MTU {} is too big to fit a PacketProto frame", self.udp_mtu);
        }
        if self.max_connections == 0 || self.max_connections > u16::MAX as usize + 1 {
            bail!("max connections must be in 1..=65536");
        }
        if self.send_buffer_size == 0 {
            bail!("send buffer size must be positive");
        }
        if self.keepalive_time.is_zero() {
            bail!("keepalive time must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SocksAuth {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct SocksUdpGwConfig {
    pub socks_server_addr: SocketAddr,
    pub socks_auth: Option<SocksAuth>,

    /// the udpgw server's address as seen from the SOCKS server
    pub udpgw_server_addr: SocketAddr,

    pub reconnect_time: Duration,

    pub client: UdpGwClientConfig,
}

impl SocksUdpGwConfig {
    pub fn new(socks_server_addr: SocketAddr, udpgw_server_addr: SocketAddr, udp_mtu: usize) -> SocksUdpGwConfig {
        SocksUdpGwConfig {
            socks_server_addr,
            socks_auth: None,
            udpgw_server_addr,
            reconnect_time: Duration::from_secs(5),
            client: UdpGwClientConfig {
                eviction: EvictionStrategy::Repurpose,
                ..UdpGwClientConfig::default_for_mtu(udp_mtu)
            },
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(auth) = &self.socks_auth {
            if auth.username.is_empty() || auth.username.len() > 255 || auth.password.len() > 255 {
                bail!("SOCKS username and password must be 1..=255 and 0..=255 bytes");
            }
        }
        self.client.validate()
    }
}

#[derive(Clone, Debug)]
pub struct DataProtoSinkConfig {
    /// maximum size of a frame routed to the peer, excluding the DataProto header
    pub frame_mtu: usize,

    /// a keepalive is sent after this time without outgoing traffic
    pub keepalive_time: Duration,

    /// The peer is considered down if nothing was received for this long, and outgoing packets
    ///  claim 'receiving keepalives' only while something was received within this time.
    pub tolerance_time: Duration,
}

impl DataProtoSinkConfig {
    pub fn default_for_mtu(frame_mtu: usize) -> DataProtoSinkConfig {
        DataProtoSinkConfig {
            frame_mtu,
            keepalive_time: Duration::from_secs(10),
            tolerance_time: Duration::from_secs(22),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.keepalive_time.is_zero() {
            bail!("keepalive time must be positive");
        }
        if self.tolerance_time <= self.keepalive_time {
            bail!("tolerance time must exceed the keepalive time, otherwise a healthy peer is reported down");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct DataProtoFlowConfig {
    /// number of packets buffered for the destination
    pub num_packets: usize,

    /// if set, the flow's alarm lapses when nothing was routed through it for this long
    pub inactivity_time: Option<Duration>,
}

impl DataProtoFlowConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_packets == 0 {
            bail!("flow buffer must hold at least one packet");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct DatagramPeerIoConfig {
    /// maximum size of a frame sent to or received from the peer
    pub frame_mtu: usize,

    /// maximum UDP payload size on the path to the peer
    pub udp_mtu: usize,

    pub sp: SpProtoConfig,

    /// number of frames reassembled concurrently
    pub num_frames: usize,

    pub latency: Option<Duration>,
}

impl DatagramPeerIoConfig {
    pub fn default_ipv4(frame_mtu: usize) -> DatagramPeerIoConfig {
        DatagramPeerIoConfig {
            frame_mtu,
            udp_mtu: 1472,
            sp: SpProtoConfig::default_secure(),
            num_frames: 8,
            latency: None,
        }
    }

    /// the carrier MTU available to chunks, i.e. the UDP MTU minus SPProto overhead
    pub fn chunk_carrier_mtu(&self) -> Option<usize> {
        self.sp.params().payload_mtu_for_carrier_mtu(self.udp_mtu)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.sp.validate()?;
        match self.chunk_carrier_mtu() {
            Some(mtu) if mtu > CHUNK_HEADER_LEN => {}
            _ => bail!("UDP MTU {} leaves no room for fragment chunks after SPProto overhead", self.udp_mtu),
        }
        if self.frame_mtu > u16::MAX as usize {
            bail!("frame MTU {} does not fit chunk offsets", self.frame_mtu);
        }
        if self.num_frames < 2 {
            bail!("need at least two frame slots for reassembly");
        }
        Ok(())
    }
}
