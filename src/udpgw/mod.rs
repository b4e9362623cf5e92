//! Client side of the udpgw protocol: many UDP 'connections' multiplexed over a single stream to
//!  a gateway server, which sends and receives the actual UDP packets on the client's behalf.

pub mod client;
pub mod connection_table;
pub mod proto;
pub mod socks_client;
