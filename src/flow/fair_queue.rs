//! A packet sink with many inputs ('flows') and a single output.
//!
//! The queue dispatches at most one packet to its output at any given time. Each flow can have
//!  at most one outstanding packet, and flows with a queued packet are served strictly round-robin,
//!  so with N flows sending continuously, no flow waits for more than N-1 other packets between
//!  two of its own.
//!
//! ## Cancellation and detaching
//!
//! [FairQueueFlow::submit] returns a [SendOp] that resolves to a [SendOutcome]. A sender can
//!  request cancellation through [SendOp::request_cancel] and then awaits the op as usual:
//! * a packet that is still queued is removed and the op resolves as `Cancelled` right away
//! * a packet that is being dispatched is only cancelled if the queue was created with
//!   `use_cancel` - the in-flight output operation is dropped in that case, which is only valid for
//!   datagram-like outputs. Otherwise the op resolves as `Completed` once the output is done.
//!
//! Dropping a flow while its packet is being dispatched is allowed: the flow is marked as
//!  detaching, cancellation is requested, and the queue removes the flow once the output resolves.
//!  Since at most one flow dispatches at a time, at most one flow is detaching at any time.
//!
//! Dropping the queue stops dispatching and resolves all outstanding ops as `Cancelled`.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use crate::flow::PacketPass;
use crate::util::arena::{Arena, ArenaId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Completed,
    Cancelled,
}

struct QueuedPacket {
    packet: Bytes,
    done: oneshot::Sender<SendOutcome>,
}

#[derive(Default)]
struct FlowSlot {
    queued: Option<QueuedPacket>,
    dispatching: bool,
    /// the flow's handle was dropped while it was dispatching
    detaching: bool,
}

struct Dispatch {
    flow: ArenaId,
    done: oneshot::Sender<SendOutcome>,
    cancel: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct QueueState {
    flows: Arena<FlowSlot>,
    ready: VecDeque<ArenaId>,
    dispatch: Option<Dispatch>,
    closed: bool,
}
impl QueueState {
    fn enqueue(&mut self, flow: ArenaId, packet: Bytes, done: oneshot::Sender<SendOutcome>) -> bool {
        if self.closed {
            let _ = done.send(SendOutcome::Cancelled);
            return false;
        }

        let slot = self.flows.get_mut(flow)
            .expect("flow handle outlives its slot");
        assert!(slot.queued.is_none(), "contract violation: packet submitted to a fair queue flow while its previous packet is still queued");
        slot.queued = Some(QueuedPacket { packet, done });

        if !slot.dispatching {
            self.ready.push_back(flow);
        }
        true
    }

    fn start_next_dispatch(&mut self) -> Option<(Bytes, oneshot::Receiver<()>)> {
        assert!(self.dispatch.is_none());

        while let Some(flow) = self.ready.pop_front() {
            let Some(slot) = self.flows.get_mut(flow) else {
                continue;
            };
            let Some(QueuedPacket { packet, done }) = slot.queued.take() else {
                continue;
            };

            slot.dispatching = true;
            let (cancel_tx, cancel_rx) = oneshot::channel();
            self.dispatch = Some(Dispatch {
                flow,
                done,
                cancel: Some(cancel_tx),
            });
            return Some((packet, cancel_rx));
        }
        None
    }

    fn finish_dispatch(&mut self, outcome: SendOutcome) {
        let Some(dispatch) = self.dispatch.take() else {
            return;
        };
        let _ = dispatch.done.send(outcome);

        let Some(slot) = self.flows.get_mut(dispatch.flow) else {
            return;
        };
        slot.dispatching = false;

        if slot.detaching {
            trace!("detaching flow {:?} finished dispatching - removing it", dispatch.flow);
            self.flows.remove(dispatch.flow);
        }
        else if slot.queued.is_some() {
            self.ready.push_back(dispatch.flow);
        }
    }

    fn cancel(&mut self, flow: ArenaId) {
        let Some(slot) = self.flows.get_mut(flow) else {
            return;
        };

        if let Some(queued) = slot.queued.take() {
            trace!("cancelling queued packet of flow {:?}", flow);
            self.ready.retain(|f| *f != flow);
            let _ = queued.done.send(SendOutcome::Cancelled);
            return;
        }

        if let Some(dispatch) = &mut self.dispatch {
            if dispatch.flow == flow {
                if let Some(cancel) = dispatch.cancel.take() {
                    trace!("requesting cancellation of dispatching flow {:?}", flow);
                    let _ = cancel.send(());
                }
            }
        }
    }

    fn release(&mut self, flow: ArenaId) {
        self.cancel(flow);

        let Some(slot) = self.flows.get_mut(flow) else {
            return;
        };
        if slot.dispatching {
            debug!("flow {:?} released while dispatching - detaching it when the output is done", flow);
            slot.detaching = true;
        }
        else {
            self.flows.remove(flow);
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.ready.clear();
        if let Some(dispatch) = self.dispatch.take() {
            let _ = dispatch.done.send(SendOutcome::Cancelled);
        }
        for slot in self.flows.drain() {
            if let Some(queued) = slot.queued {
                let _ = queued.done.send(SendOutcome::Cancelled);
            }
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    work: Notify,
    mtu: usize,
}

/// A packet sink arbitrating between many flows, see the module documentation.
pub struct FairQueue {
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
}

impl FairQueue {
    /// Create a queue dispatching to `output`. This spawns the dispatcher task on the current
    ///  tokio runtime.
    pub fn new<O: PacketPass + 'static>(output: O, use_cancel: bool) -> FairQueue {
        let shared = Arc::new(Shared {
            state: Default::default(),
            work: Notify::new(),
            mtu: output.mtu(),
        });

        let dispatcher = tokio::spawn(Self::dispatch_loop(shared.clone(), output, use_cancel));

        FairQueue {
            shared,
            dispatcher,
        }
    }

    pub fn mtu(&self) -> usize {
        self.shared.mtu
    }

    pub fn new_flow(&self) -> FairQueueFlow {
        self.handle().new_flow()
    }

    pub fn handle(&self) -> FairQueueHandle {
        FairQueueHandle {
            shared: self.shared.clone(),
        }
    }

    /// the number of flows that are attached, including a flow that is detaching
    pub fn num_flows(&self) -> usize {
        self.shared.state.lock().unwrap().flows.len()
    }

    async fn dispatch_loop<O: PacketPass>(shared: Arc<Shared>, mut output: O, use_cancel: bool) {
        loop {
            let next = shared.state.lock().unwrap().start_next_dispatch();
            let Some((packet, cancel_rx)) = next else {
                shared.work.notified().await;
                continue;
            };

            trace!("dispatching packet of length {}", packet.len());

            let outcome = if use_cancel {
                tokio::select! {
                    _ = output.send(&packet) => SendOutcome::Completed,
                    Ok(()) = cancel_rx => {
                        debug!("dispatch cancelled - dropping in-flight output operation");
                        SendOutcome::Cancelled
                    }
                }
            }
            else {
                output.send(&packet).await;
                SendOutcome::Completed
            };

            shared.state.lock().unwrap().finish_dispatch(outcome);
        }
    }
}

impl Drop for FairQueue {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.shared.state.lock().unwrap().close();
    }
}

/// A cloneable reference to a [FairQueue] that can create new flows, e.g. for handing out to
///  components that attach to the queue later
#[derive(Clone)]
pub struct FairQueueHandle {
    shared: Arc<Shared>,
}
impl FairQueueHandle {
    pub fn new_flow(&self) -> FairQueueFlow {
        let id = self.shared.state.lock().unwrap()
            .flows
            .insert(FlowSlot::default());
        trace!("new fair queue flow {:?}", id);

        FairQueueFlow {
            shared: self.shared.clone(),
            id,
        }
    }

    pub fn mtu(&self) -> usize {
        self.shared.mtu
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }
}

/// One input of a [FairQueue]
pub struct FairQueueFlow {
    shared: Arc<Shared>,
    id: ArenaId,
}

impl FairQueueFlow {
    pub fn mtu(&self) -> usize {
        self.shared.mtu
    }

    /// Queue a packet for dispatching. The returned op borrows the flow, so there can be no second
    ///  submission before the op resolved or was dropped.
    pub fn submit(&mut self, packet: Bytes) -> SendOp<'_> {
        assert!(packet.len() <= self.shared.mtu, "packet of length {} exceeds the queue's MTU {}", packet.len(), self.shared.mtu);

        let (done_tx, done_rx) = oneshot::channel();
        if self.shared.state.lock().unwrap().enqueue(self.id, packet, done_tx) {
            self.shared.work.notify_one();
        }

        SendOp {
            flow: self,
            done: done_rx,
            resolved: false,
        }
    }

    /// `true` while this flow has a packet queued or dispatching
    pub fn is_busy(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.flows.get(self.id)
            .map(|slot| slot.queued.is_some() || slot.dispatching)
            .unwrap_or(false)
    }
}

impl Drop for FairQueueFlow {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().release(self.id);
    }
}

#[async_trait]
impl PacketPass for FairQueueFlow {
    fn mtu(&self) -> usize {
        self.shared.mtu
    }

    async fn send(&mut self, packet: &[u8]) {
        let outcome = self.submit(Bytes::copy_from_slice(packet)).await;
        if outcome == SendOutcome::Cancelled {
            debug!("packet was cancelled by the fair queue");
        }
    }
}

/// An outstanding send on a [FairQueueFlow]. Dropping an unresolved op removes its packet from
///  the queue if it was not dispatched yet.
pub struct SendOp<'a> {
    flow: &'a mut FairQueueFlow,
    done: oneshot::Receiver<SendOutcome>,
    resolved: bool,
}

impl SendOp<'_> {
    /// Request cancellation of this op. The op must still be awaited: it resolves either as
    ///  `Cancelled` or, if the packet could not be taken back from the output, as `Completed`.
    pub fn request_cancel(&self) {
        if !self.resolved {
            self.flow.shared.state.lock().unwrap().cancel(self.flow.id);
        }
    }
}

impl Future for SendOp<'_> {
    type Output = SendOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.done).poll(cx) {
            Poll::Ready(result) => {
                this.resolved = true;
                // the sender is only dropped without an outcome when the queue is gone
                Poll::Ready(result.unwrap_or(SendOutcome::Cancelled))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SendOp<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let mut state = self.flow.shared.state.lock().unwrap();
        if let Some(slot) = state.flows.get_mut(self.flow.id) {
            if slot.queued.take().is_some() {
                let id = self.flow.id;
                state.ready.retain(|f| *f != id);
            }
        }
    }
}
