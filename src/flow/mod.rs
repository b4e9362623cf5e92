//! The packet channel contract and the generic flow components built on it.
//!
//! Every component of the data plane is a chain of packet producers and consumers. A producer
//!  hands a packet to a consumer through [PacketPass::send], and the completion of the returned
//!  future is the consumer's *done*: the consumer may process the packet synchronously or
//!  asynchronously, but the producer must not reuse the channel before it resolves. Since `send`
//!  takes `&mut self`, issuing a second send on a channel before the first one completed does not
//!  compile.
//!
//! [PacketRecv] is the dual direction: the consumer asks for the next packet and the producer
//!  resolves the future once it has one.
//!
//! Cancellation of an in-progress send is two-phase and only supported where a component
//!  explicitly offers it (see [fair_queue::SendOp]): the sender *requests* cancellation, and then
//!  waits for the operation to resolve either normally or as cancelled. There is no way to force
//!  a send to abort synchronously.
//!
//! Errors are not part of this contract. Components that sit on top of a transport surface
//!  transport failures through a separate one-shot notification; integrity failures drop the
//!  offending packet and complete the send normally.

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

pub mod datagram;
pub mod fair_queue;
pub mod inactivity_monitor;
pub mod packet_buffer;
pub mod packet_proto;

/// The consuming end of a packet channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketPass: Send {
    /// The maximum length of a packet passed to [PacketPass::send]
    fn mtu(&self) -> usize;

    /// Pass a packet of at most [PacketPass::mtu] bytes. The returned future resolving is the
    ///  consumer's 'done' for this packet.
    async fn send(&mut self, packet: &[u8]);
}

#[async_trait]
impl<P: PacketPass + ?Sized> PacketPass for Box<P> {
    fn mtu(&self) -> usize {
        (**self).mtu()
    }

    async fn send(&mut self, packet: &[u8]) {
        (**self).send(packet).await
    }
}

/// The producing end of a packet channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketRecv: Send {
    fn mtu(&self) -> usize;

    /// Wait for the next packet. `None` signals that the producer is closed for good.
    async fn recv(&mut self) -> Option<Bytes>;
}

#[async_trait]
impl<P: PacketRecv + ?Sized> PacketRecv for Box<P> {
    fn mtu(&self) -> usize {
        (**self).mtu()
    }

    async fn recv(&mut self) -> Option<Bytes> {
        (**self).recv().await
    }
}

/// A [PacketRecv] fed through a tokio channel, e.g. by a device reader task
pub struct ChannelRecv {
    rx: tokio::sync::mpsc::Receiver<Bytes>,
    mtu: usize,
}
impl ChannelRecv {
    pub fn new(rx: tokio::sync::mpsc::Receiver<Bytes>, mtu: usize) -> ChannelRecv {
        ChannelRecv { rx, mtu }
    }
}

#[async_trait]
impl PacketRecv for ChannelRecv {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn recv(&mut self) -> Option<Bytes> {
        loop {
            let packet = self.rx.recv().await?;
            if packet.len() <= self.mtu {
                return Some(packet);
            }
            tracing::warn!("dropping packet of length {} exceeding the channel MTU of {}", packet.len(), self.mtu);
        }
    }
}
