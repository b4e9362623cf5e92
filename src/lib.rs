//! The data plane of a peer-to-peer VPN: the components that carry frames between peers, and
//!  UDP traffic to a udpgw server.
//!
//! ## Packet channels
//!
//! All components are stages of packet pipelines, connected through the [flow::PacketPass]
//!  contract: a producer passes one packet at a time, and the consumer's completion of the send
//!  is the signal that the producer may pass the next one. This gives back pressure throughout a
//!  pipeline without any explicit flow control.
//!
//! ## Peer links
//!
//! The path of a frame from one peer to another:
//!
//! ```ascii
//! source -> DataProtoFlow -> DataProtoSink (FairQueue) -> FragmentDisassembler -> SpProtoEncoder -> UDP
//! UDP -> SpProtoDecoder -> FragmentAssembler -> DataProto packets (received by the owner)
//! ```
//!
//! * [dataproto] adds peer ids and keepalives, and tracks whether the link to a peer is up
//! * [fragmentproto] splits frames into chunks that fit carrier packets, and reassembles them
//! * [spproto] adds optional encryption, a hash and a one-time password to each carrier packet
//! * [peer_io] composes fragmentation and SPProto over a UDP socket
//!
//! ## udpgw
//!
//! [udpgw] multiplexes UDP 'connections' over a single stream to a gateway server, optionally
//!  through a SOCKS5 proxy.
//!
//! ## Concurrency
//!
//! Everything runs on tokio. CPU heavy crypto work goes to [worker::ThreadWork]. State shared
//!  between a component and its background tasks is guarded by short lived mutexes that are never
//!  held across an `.await`.

pub mod config;
pub mod dataproto;
pub mod flow;
pub mod fragmentproto;
pub mod peer_io;
pub mod spproto;
pub mod test_util;
pub mod udpgw;
pub mod util;
pub mod worker;
