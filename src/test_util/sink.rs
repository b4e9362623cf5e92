use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use crate::flow::PacketPass;

#[derive(Default)]
struct Recorded {
    packets: Mutex<Vec<Vec<u8>>>,
    started: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    changed: Notify,
}

/// A [PacketPass] that records every packet it completed, optionally delaying or gating each
///  send. It also tracks how many sends overlapped, which is a contract violation for a
///  well-behaved producer.
#[derive(Clone)]
pub struct RecordingSink {
    mtu: usize,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    recorded: Arc<Recorded>,
}

impl RecordingSink {
    pub fn new(mtu: usize) -> RecordingSink {
        RecordingSink {
            mtu,
            delay: None,
            gate: None,
            recorded: Default::default(),
        }
    }

    /// every send sleeps for `delay` before completing
    pub fn with_delay(mut self, delay: Duration) -> RecordingSink {
        self.delay = Some(delay);
        self
    }

    /// every send waits for a permit released through [RecordingSink::open_gate]
    pub fn gated(mut self) -> RecordingSink {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn open_gate(&self, num_sends: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(num_sends);
        }
    }

    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.recorded.packets.lock().unwrap().clone()
    }

    pub fn num_started(&self) -> usize {
        self.recorded.started.load(Ordering::Acquire)
    }

    pub fn max_concurrent_sends(&self) -> usize {
        self.recorded.max_active.load(Ordering::Acquire)
    }

    /// wait until at least `num_packets` packets were recorded
    pub async fn wait_for_packets(&self, num_packets: usize) -> Vec<Vec<u8>> {
        loop {
            let notified = self.recorded.changed.notified();
            let packets = self.packets();
            if packets.len() >= num_packets {
                return packets;
            }
            notified.await;
        }
    }
}

struct ActiveGuard<'a>(&'a Recorded);
impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl PacketPass for RecordingSink {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn send(&mut self, packet: &[u8]) {
        assert!(packet.len() <= self.mtu, "packet of length {} exceeds MTU {}", packet.len(), self.mtu);

        self.recorded.started.fetch_add(1, Ordering::AcqRel);
        let active = self.recorded.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.recorded.max_active.fetch_max(active, Ordering::AcqRel);
        let _guard = ActiveGuard(&self.recorded);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.recorded.packets.lock().unwrap().push(packet.to_vec());
        self.recorded.changed.notify_waiters();
    }
}
