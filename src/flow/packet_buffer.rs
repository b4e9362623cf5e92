//! A bounded packet buffer in front of a sink.
//!
//! Producers that must not wait for the sink (e.g. because they serve many independent
//!  connections from one call site) push packets without blocking; a task forwards them to the
//!  sink one at a time. A full buffer rejects the packet, and it is up to the caller to drop it.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;
use crate::flow::PacketPass;

pub struct PacketBuffer {
    tx: mpsc::Sender<Bytes>,
    mtu: usize,
    forwarder: JoinHandle<()>,
}

impl PacketBuffer {
    /// Spawn the forwarding task on the current runtime. `capacity` must be at least 1.
    pub fn new<O: PacketPass + 'static>(output: O, capacity: usize) -> PacketBuffer {
        let mtu = output.mtu();
        let (tx, rx) = mpsc::channel(capacity);
        let forwarder = tokio::spawn(Self::forward(rx, output));

        PacketBuffer { tx, mtu, forwarder }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Returns `false` if the buffer is full and the packet was not accepted.
    pub fn try_push(&self, packet: Bytes) -> bool {
        assert!(packet.len() <= self.mtu, "packet of length {} exceeds buffer MTU {}", packet.len(), self.mtu);
        self.tx.try_send(packet).is_ok()
    }

    async fn forward<O: PacketPass>(mut rx: mpsc::Receiver<Bytes>, mut output: O) {
        while let Some(packet) = rx.recv().await {
            trace!("forwarding buffered packet of length {}", packet.len());
            output.send(&packet).await;
        }
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::sink::RecordingSink;

    #[tokio::test]
    async fn test_forwards_in_order() {
        let sink = RecordingSink::new(10);
        let buffer = PacketBuffer::new(sink.clone(), 4);

        assert!(buffer.try_push(Bytes::from_static(b"a")));
        assert!(buffer.try_push(Bytes::from_static(b"b")));
        assert!(buffer.try_push(Bytes::from_static(b"c")));

        assert_eq!(sink.wait_for_packets(3).await, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn test_rejects_when_full() {
        let sink = RecordingSink::new(10).gated();
        let buffer = PacketBuffer::new(sink.clone(), 2);

        assert!(buffer.try_push(Bytes::from_static(b"1")));
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.num_started(), 1);
        // "1" is in the sink, two more fit the buffer
        assert!(buffer.try_push(Bytes::from_static(b"2")));
        assert!(buffer.try_push(Bytes::from_static(b"3")));
        assert!(!buffer.try_push(Bytes::from_static(b"4")));

        sink.open_gate(3);
        assert_eq!(sink.wait_for_packets(3).await, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    }
}
