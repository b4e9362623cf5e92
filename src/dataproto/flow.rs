use std::sync::Arc;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use crate::config::DataProtoFlowConfig;
use crate::dataproto::{ser_header, DataProtoFlags, DATAPROTO_MAX_OVERHEAD};
use crate::dataproto::sink::DataProtoSinkHandle;
use crate::flow::fair_queue::{FairQueueFlow, SendOutcome};
use crate::flow::inactivity_monitor::{InactivityAlarm, InactivityTimer};

enum FlowCommand {
    Attach(DataProtoSinkHandle),
    Detach,
}

enum DispatchEnd {
    Completed,
    /// a command arrived while dispatching. The packet is returned if it was taken back from the
    ///  sink's queue before it was sent.
    Interrupted(FlowCommand, Option<Bytes>),
    /// the flow was dropped
    Freed,
}

enum Next {
    Packet(Bytes),
    Command(Option<FlowCommand>),
}

/// The packets from one source to one destination peer.
///
/// Routed frames go into a bounded buffer, and a task forwards them to the sink the flow is
///  attached to. Attaching and detaching is asynchronous: if a packet is being sent by the old
///  sink, the change takes effect once that packet is done. A packet still waiting in the old
///  sink's queue is taken back and goes to the next sink first, so a packet is never lost or
///  duplicated by re-attaching. Packets routed while detached stay buffered.
///
/// Dropping the flow discards buffered packets. A packet that is being dispatched is still
///  completed by the sink.
pub struct DataProtoFlow {
    source_id: u16,
    dest_id: u16,
    frame_mtu: usize,
    packets: mpsc::Sender<Bytes>,
    commands: mpsc::UnboundedSender<FlowCommand>,
    attached: bool,
    activity: Option<Arc<InactivityTimer>>,
}

impl DataProtoFlow {
    /// Returns the flow, and an alarm if the config asks for inactivity detection
    pub fn new(config: DataProtoFlowConfig, source_id: u16, dest_id: u16, frame_mtu: usize) -> anyhow::Result<(DataProtoFlow, Option<InactivityAlarm>)> {
        config.validate()?;

        let (packets, packets_rx) = mpsc::channel(config.num_packets);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(source_id, dest_id, packets_rx, commands_rx));

        let activity = config.inactivity_time.map(InactivityTimer::new);
        let alarm = activity.as_ref().map(|timer| timer.alarm());

        Ok((
            DataProtoFlow {
                source_id,
                dest_id,
                frame_mtu,
                packets,
                commands,
                attached: false,
                activity,
            },
            alarm,
        ))
    }

    pub fn source_id(&self) -> u16 {
        self.source_id
    }

    pub fn dest_id(&self) -> u16 {
        self.dest_id
    }

    pub fn frame_mtu(&self) -> usize {
        self.frame_mtu
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Queue a frame for the destination. Returns `false` if the buffer is full and the frame
    ///  was dropped.
    pub fn route(&self, frame: &[u8]) -> bool {
        assert!(frame.len() <= self.frame_mtu, "frame of length {} exceeds the flow's MTU {}", frame.len(), self.frame_mtu);

        if let Some(timer) = &self.activity {
            timer.reset();
        }

        let mut packet = BytesMut::with_capacity(DATAPROTO_MAX_OVERHEAD + frame.len());
        ser_header(&mut packet, DataProtoFlags::empty(), self.source_id, &[self.dest_id]);
        packet.put_slice(frame);

        match self.packets.try_send(packet.freeze()) {
            Ok(()) => {
                trace!("routed frame of length {} from {} to {}", frame.len(), self.source_id, self.dest_id);
                true
            }
            Err(_) => {
                debug!("buffer of flow from {} to {} is full - dropping frame", self.source_id, self.dest_id);
                false
            }
        }
    }

    /// Start passing buffered packets to `sink`. The flow must be detached.
    pub fn attach(&mut self, sink: &DataProtoSinkHandle) {
        assert!(!self.attached, "flow from {} to {} is already attached", self.source_id, self.dest_id);
        assert!(self.frame_mtu <= sink.frame_mtu(), "flow MTU {} exceeds the sink's frame MTU {}", self.frame_mtu, sink.frame_mtu());

        self.attached = true;
        let _ = self.commands.send(FlowCommand::Attach(sink.clone()));
    }

    /// Stop passing packets to the current sink. Packets routed afterwards stay buffered.
    pub fn detach(&mut self) {
        assert!(self.attached, "flow from {} to {} is not attached", self.source_id, self.dest_id);

        self.attached = false;
        let _ = self.commands.send(FlowCommand::Detach);
    }

    async fn run(source_id: u16, dest_id: u16, mut packets: mpsc::Receiver<Bytes>, mut commands: mpsc::UnboundedReceiver<FlowCommand>) {
        let mut target: Option<FairQueueFlow> = None;
        // taken back from a sink, goes ahead of the buffered packets
        let mut pending: Option<Bytes> = None;

        loop {
            let command = match &mut target {
                None => commands.recv().await,
                Some(queue_flow) => {
                    let next = match pending.take() {
                        Some(packet) => Next::Packet(packet),
                        None => tokio::select! {
                            biased;
                            command = commands.recv() => Next::Command(command),
                            packet = packets.recv() => match packet {
                                Some(packet) => Next::Packet(packet),
                                None => break,
                            },
                        },
                    };

                    match next {
                        Next::Command(command) => command,
                        Next::Packet(packet) => match Self::dispatch(queue_flow, packet, &mut commands).await {
                            DispatchEnd::Completed => continue,
                            DispatchEnd::Interrupted(command, taken_back) => {
                                pending = taken_back;
                                Some(command)
                            }
                            DispatchEnd::Freed => None,
                        },
                    }
                }
            };

            match command {
                Some(FlowCommand::Attach(sink)) => {
                    debug!("attaching flow from {} to {}", source_id, dest_id);
                    target = Some(sink.new_flow());
                }
                Some(FlowCommand::Detach) => {
                    debug!("detaching flow from {} to {}", source_id, dest_id);
                    target = None;
                }
                None => break,
            }
        }
        trace!("flow from {} to {} finished", source_id, dest_id);
    }

    async fn dispatch(queue_flow: &mut FairQueueFlow, packet: Bytes, commands: &mut mpsc::UnboundedReceiver<FlowCommand>) -> DispatchEnd {
        let mut op = queue_flow.submit(packet.clone());

        tokio::select! {
            outcome = &mut op => {
                if outcome == SendOutcome::Cancelled {
                    debug!("packet was dropped by a closed sink");
                }
                DispatchEnd::Completed
            }
            command = commands.recv() => {
                // the queue finishes a packet that is already dispatching when the flow is dropped
                let Some(command) = command else {
                    return DispatchEnd::Freed;
                };

                op.request_cancel();
                match op.await {
                    SendOutcome::Completed => DispatchEnd::Interrupted(command, None),
                    SendOutcome::Cancelled => {
                        trace!("packet taken back from the sink for re-attaching");
                        DispatchEnd::Interrupted(command, Some(packet))
                    }
                }
            }
        }
    }
}
