//! Detect silence on a packet channel.
//!
//! [InactivityMonitor] wraps a sink and restarts a deadline every time a packet passes through.
//!  The owner holds the matching [InactivityAlarm] and awaits [InactivityAlarm::lapsed], which
//!  resolves when the deadline passed without traffic. After lapsing, the deadline is re-armed
//!  for another full interval, so an owner looping on `lapsed()` is woken once per silent
//!  interval.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;
use crate::flow::PacketPass;

/// The deadline shared between a monitored channel and its alarm. It can also be used on its own
///  where there is no channel to wrap, e.g. to track the time since something was received.
pub struct InactivityTimer {
    interval: Duration,
    deadline: Mutex<Instant>,
    changed: Notify,
}

impl InactivityTimer {
    pub fn new(interval: Duration) -> Arc<InactivityTimer> {
        Arc::new(InactivityTimer {
            interval,
            deadline: Mutex::new(Instant::now() + interval),
            changed: Notify::new(),
        })
    }

    /// an alarm for a timer that is reset by something other than an [InactivityMonitor]
    pub fn alarm(self: &Arc<Self>) -> InactivityAlarm {
        InactivityAlarm { timer: self.clone() }
    }

    /// restart the timer, i.e. register activity
    pub fn reset(&self) {
        *self.deadline.lock().unwrap() = Instant::now() + self.interval;
    }

    /// make the timer lapse at the next opportunity
    pub fn force(&self) {
        *self.deadline.lock().unwrap() = Instant::now();
        self.changed.notify_waiters();
    }

    /// Wait for the deadline to pass without a reset, then re-arm it.
    pub async fn lapsed(&self) {
        loop {
            let changed = self.changed.notified();
            let deadline = *self.deadline.lock().unwrap();

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = changed => continue,
            }

            {
                let mut current = self.deadline.lock().unwrap();
                let now = Instant::now();
                if *current <= now {
                    *current = now + self.interval;
                    return;
                }
            }
            // reset while sleeping
        }
    }
}

/// The owner's side of an [InactivityMonitor]
#[derive(Clone)]
pub struct InactivityAlarm {
    timer: Arc<InactivityTimer>,
}
impl InactivityAlarm {
    pub async fn lapsed(&self) {
        self.timer.lapsed().await
    }

    /// Make the alarm lapse at the next opportunity, e.g. to send a keepalive right after init.
    pub fn force(&self) {
        self.timer.force()
    }

    pub fn timer(&self) -> &Arc<InactivityTimer> {
        &self.timer
    }
}

/// A pass-through sink that resets an inactivity timer on every packet.
pub struct InactivityMonitor<O> {
    output: O,
    timer: Arc<InactivityTimer>,
}

impl<O: PacketPass> InactivityMonitor<O> {
    pub fn new(output: O, interval: Duration) -> (InactivityMonitor<O>, InactivityAlarm) {
        let timer = InactivityTimer::new(interval);
        (
            InactivityMonitor { output, timer: timer.clone() },
            InactivityAlarm { timer },
        )
    }
}

#[async_trait]
impl<O: PacketPass> PacketPass for InactivityMonitor<O> {
    fn mtu(&self) -> usize {
        self.output.mtu()
    }

    async fn send(&mut self, packet: &[u8]) {
        trace!("activity: {} bytes", packet.len());
        self.timer.reset();
        self.output.send(packet).await;
        self.timer.reset();
    }
}
