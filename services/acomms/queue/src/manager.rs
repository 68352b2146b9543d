//! The queue manager: fills transmission opportunities and tracks acknowledgements.

use crate::codec::{pack_frame, packed_len, unpack_frame, Codec};
use crate::config::{Manipulator, QueueManagerConfig, QueuedMessageEntry};
use crate::error::QueueError;
use crate::message::DynamicMessage;
use crate::priority::{default_priority_fn, PriorityFn};
use crate::queue::{MessageMeta, Queue, QueuedMessage};
use acomms_wire::{
    seconds_to_micros, Clock, ModemId, Timestamp, Transmission, TransmissionHooks, TransmissionType,
    BROADCAST_ID, QUERY_DESTINATION_ID, QUERY_SOURCE_ID,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Events raised by the queue manager
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A message was delivered to this node
    Receive {
        /// The message
        message: DynamicMessage,
    },
    /// A message was acknowledged by its recipient
    Ack {
        /// The acknowledging transmission
        ack: Transmission,
        /// The message as originally pushed
        original: DynamicMessage,
    },
    /// A queue's size changed
    QueueSize {
        /// Message type
        type_id: u32,
        /// Messages now buffered
        size: usize,
    },
    /// A message outlived its TTL
    Expire {
        /// The dropped message
        message: DynamicMessage,
    },
}

/// Forwarding seam for messages that cross subnets
pub trait MessageRouter: Send + Sync {
    /// Inbound message addressed to us on the link but to another node overall
    fn handle_in(&self, meta: &MessageMeta, msg: &DynamicMessage, local: ModemId);

    /// Rewrite `meta.dest` to the link-layer next hop before transmission
    fn handle_out(&self, meta: &mut MessageMeta, msg: &DynamicMessage, local: ModemId);
}

/// Cloneable handle for enqueueing messages from other components.
///
/// Pushed messages are applied on the owning manager's next `do_work`.
#[derive(Debug, Clone)]
pub struct QueuePushHandle {
    modem_id: ModemId,
    tx: mpsc::UnboundedSender<DynamicMessage>,
}

impl QueuePushHandle {
    /// Id of the node owning the queue manager
    pub fn modem_id(&self) -> ModemId {
        self.modem_id
    }

    /// Enqueue a message
    pub fn push(&self, msg: DynamicMessage) -> Result<(), QueueError> {
        self.tx.send(msg).map_err(|_| QueueError::Closed)
    }
}

/// Produces content for an on-demand message type when bandwidth is granted
pub type OnDemandFn = Box<dyn FnMut(&Transmission) -> Option<DynamicMessage> + Send>;

struct OnDemand {
    provider: OnDemandFn,
    cached: Option<(Timestamp, DynamicMessage)>,
}

/// Priority- and acknowledgement-aware message queueing for one node
pub struct QueueManager {
    config: QueueManagerConfig,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn Clock>,
    queues: BTreeMap<u32, Queue>,
    events: mpsc::Sender<QueueEvent>,
    inbound_tx: mpsc::UnboundedSender<DynamicMessage>,
    inbound_rx: mpsc::UnboundedReceiver<DynamicMessage>,
    on_demand: HashMap<u32, OnDemand>,
    priority_fn: PriorityFn,
    router: Option<Arc<dyn MessageRouter>>,
    outbound_acks: VecDeque<Transmission>,
}

impl QueueManager {
    /// Create a manager with a queue per configured message entry
    pub fn new(
        config: QueueManagerConfig,
        codec: Arc<dyn Codec>,
        clock: Arc<dyn Clock>,
        events: mpsc::Sender<QueueEvent>,
    ) -> Result<Self, QueueError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let entries = config.message_entries.clone();

        let mut manager = Self {
            config,
            codec,
            clock,
            queues: BTreeMap::new(),
            events,
            inbound_tx,
            inbound_rx,
            on_demand: HashMap::new(),
            priority_fn: default_priority_fn(),
            router: None,
            outbound_acks: VecDeque::new(),
        };

        for entry in entries {
            manager.add_queue(entry)?;
        }

        info!(
            "Queue manager started: modem_id={} queues={}",
            manager.config.modem_id,
            manager.queues.len()
        );
        Ok(manager)
    }

    /// Local node id
    pub fn modem_id(&self) -> ModemId {
        self.config.modem_id
    }

    /// Add a queue for a new message type
    pub fn add_queue(&mut self, entry: QueuedMessageEntry) -> Result<(), QueueError> {
        entry.validate()?;
        if self.queues.contains_key(&entry.type_id) {
            return Err(QueueError::Configuration(format!(
                "duplicate queue for type {}",
                entry.type_id
            )));
        }

        debug!("Added queue: type={} name={}", entry.type_id, entry.display_name());
        self.queues.insert(entry.type_id, Queue::new(entry, self.clock.now()));
        Ok(())
    }

    /// Register the content provider for an ON_DEMAND message type
    pub fn set_on_demand(&mut self, type_id: u32, provider: OnDemandFn) -> Result<(), QueueError> {
        let queue = self.queue(type_id)?;
        if !queue.entry().manipulators.contains(Manipulator::ON_DEMAND) {
            return Err(QueueError::Configuration(format!(
                "{} is not an on-demand type",
                queue.entry().display_name()
            )));
        }

        self.on_demand.insert(type_id, OnDemand { provider, cached: None });
        Ok(())
    }

    /// Replace the priority function
    pub fn set_priority_fn(&mut self, priority_fn: PriorityFn) {
        self.priority_fn = priority_fn;
    }

    /// Attach a router for multi-subnet forwarding
    pub fn set_router(&mut self, router: Arc<dyn MessageRouter>) {
        self.router = Some(router);
    }

    /// Handle for pushing messages from other components
    pub fn inbound_handle(&self) -> QueuePushHandle {
        QueuePushHandle {
            modem_id: self.config.modem_id,
            tx: self.inbound_tx.clone(),
        }
    }

    /// Next ACK built on receipt when `generate_acks` is enabled
    pub fn pop_outbound_ack(&mut self) -> Option<Transmission> {
        self.outbound_acks.pop_front()
    }

    fn queue(&self, type_id: u32) -> Result<&Queue, QueueError> {
        self.queues
            .get(&type_id)
            .ok_or_else(|| QueueError::Configuration(format!("no queue configured for type {}", type_id)))
    }

    fn emit(&self, event: QueueEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropping queue event: {}", e);
        }
    }

    fn emit_size(&self, type_id: u32) {
        if let Some(queue) = self.queues.get(&type_id) {
            self.emit(QueueEvent::QueueSize {
                type_id,
                size: queue.size(),
            });
        }
    }

    /// Accept a message for transmission
    pub fn push_message(&mut self, msg: DynamicMessage) -> Result<(), QueueError> {
        let now = self.clock.now();
        let local = self.config.modem_id;
        let type_id = self.codec.type_id(&msg);

        let queue = self.queue(type_id)?;
        let manipulators = queue.entry().manipulators;
        let meta = queue.meta_from_msg(&msg, local, now)?;

        if manipulators.contains(Manipulator::LOOPBACK) {
            debug!("Loopback delivery: type={}", type_id);
            self.emit(QueueEvent::Receive { message: msg.clone() });
        }

        if manipulators.contains(Manipulator::NO_QUEUE) {
            let encoded = self.codec.encode(&msg)?;
            debug!("Not queueing type={} ({} bytes encoded)", type_id, encoded.len());
            return Ok(());
        }

        if manipulators.contains(Manipulator::NO_ENCODE) {
            debug!("Not encoding type={}", type_id);
            return Ok(());
        }

        if meta.dest == local {
            debug!("Message type={} addressed to ourselves, delivering locally", type_id);
            self.emit(QueueEvent::Receive { message: msg.clone() });
            if meta.ack_requested {
                let ack = Transmission {
                    src: local,
                    dest: local,
                    time: now,
                    kind: TransmissionType::Ack,
                    ..Transmission::default()
                };
                self.emit(QueueEvent::Ack { ack, original: msg });
            }
            return Ok(());
        }

        let encoded = self.codec.encode(&msg)?;
        if encoded.len() > u16::MAX as usize {
            return Err(QueueError::Configuration(format!(
                "type {} encodes to {} bytes, more than a frame can carry",
                type_id,
                encoded.len()
            )));
        }

        let queue = self
            .queues
            .get_mut(&type_id)
            .ok_or_else(|| QueueError::Configuration(format!("no queue configured for type {}", type_id)))?;
        if let Some(dropped) = queue.push(msg, meta, encoded) {
            debug!("Queue type={} overflowed, dropped message {}", type_id, dropped.id);
        }
        debug!(
            "Queued message: type={} src={} dest={} ack={}",
            type_id, meta.src, meta.dest, meta.ack_requested
        );
        self.emit_size(type_id);
        Ok(())
    }

    /// Fill a granted transmission's frames from the queues
    pub fn handle_modem_data_request(&mut self, tx: &mut Transmission) {
        let now = self.clock.now();
        let local = self.config.modem_id;

        for (type_id, queue) in self.queues.iter_mut() {
            let released = queue.clear_ack_queue(now, self.config.minimum_ack_wait_seconds);
            if released > 0 {
                debug!("Released {} unacknowledged messages of type={} for resend", released, type_id);
            }
        }

        let frame_limit = match tx.max_frame_bytes {
            0 => None,
            limit => Some(limit as usize),
        };
        let mut served = HashSet::new();
        let mut placed = HashSet::new();
        let mut selection_dest = tx.dest;

        for frame_index in tx.frames.len()..tx.max_num_frames as usize {
            let mut parts: Vec<Bytes> = Vec::new();
            let mut used = 0;

            loop {
                self.refresh_on_demand(tx, now, &mut served);

                let remaining = frame_limit.map(|limit| limit.saturating_sub(used));
                let Some(type_id) = self.find_winner(now, selection_dest, remaining) else {
                    break;
                };
                let Some(message) = self.queues.get_mut(&type_id).and_then(|q| q.give_data(now)) else {
                    break;
                };
                if !placed.insert((type_id, message.id)) {
                    warn!("Message {} of type={} selected twice for one transmission", message.id, type_id);
                    break;
                }

                if tx.dest == QUERY_DESTINATION_ID {
                    selection_dest = message.meta.dest;
                    tx.dest = self.link_destination(&message);
                }
                if tx.src == QUERY_SOURCE_ID {
                    tx.src = local;
                }

                self.record_sent(tx, frame_index, type_id, &message);
                used += packed_len(message.encoded.len());
                parts.push(message.encoded);
            }

            if parts.is_empty() {
                break;
            }
            match pack_frame(&parts) {
                Ok(frame) => tx.frames.push(frame),
                Err(e) => {
                    warn!("Failed to pack frame {}: {}", frame_index, e);
                    break;
                }
            }
        }

        if !tx.frames.is_empty() {
            debug!(
                "Data request filled: src={} dest={} frames={} bytes={} ack={}",
                tx.src,
                tx.dest,
                tx.frames.len(),
                tx.payload_len(),
                tx.ack_requested
            );
        }
    }

    fn link_destination(&self, message: &QueuedMessage) -> ModemId {
        let mut link_meta = message.meta;
        if let Some(router) = &self.router {
            router.handle_out(&mut link_meta, &message.msg, self.config.modem_id);
        }
        link_meta.dest
    }

    fn record_sent(&mut self, tx: &mut Transmission, frame_index: usize, type_id: u32, message: &QueuedMessage) {
        let Some(queue) = self.queues.get_mut(&type_id) else {
            return;
        };
        let loopback_as_sent = queue
            .entry()
            .manipulators
            .contains(Manipulator::LOOPBACK_AS_SENT);

        if message.meta.ack_requested {
            tx.ack_requested = true;
            queue.await_ack(message.id, tx.dest, tx.frame_number(frame_index));
        } else {
            queue.pop_message(message.id);
            self.emit_size(type_id);
        }

        if loopback_as_sent {
            self.emit(QueueEvent::Receive {
                message: message.msg.clone(),
            });
        }
    }

    fn find_winner(&self, now: Timestamp, dest: ModemId, remaining: Option<usize>) -> Option<u32> {
        let mut winner: Option<(u32, f64, Timestamp)> = None;

        for (type_id, queue) in &self.queues {
            let Some(value) = queue.priority_value(now, dest, remaining, &self.priority_fn) else {
                continue;
            };
            let better = match winner {
                None => true,
                Some((_, best, best_last_send)) => {
                    value > best || (value == best && queue.last_send_time() < best_last_send)
                }
            };
            if better {
                winner = Some((*type_id, value, queue.last_send_time()));
            }
        }

        winner.map(|(type_id, _, _)| type_id)
    }

    fn refresh_on_demand(&mut self, tx: &Transmission, now: Timestamp, served: &mut HashSet<u32>) {
        let skew = seconds_to_micros(self.config.on_demand_skew_seconds);
        let pending: Vec<u32> = self
            .on_demand
            .keys()
            .copied()
            .filter(|type_id| !served.contains(type_id))
            .collect();

        for type_id in pending {
            served.insert(type_id);

            let stale = self
                .queues
                .get(&type_id)
                .map(|q| q.newest_msg_time().map_or(true, |t| t.saturating_add(skew) < now))
                .unwrap_or(false);
            if !stale {
                continue;
            }

            let Some(state) = self.on_demand.get_mut(&type_id) else {
                continue;
            };
            let cached = state
                .cached
                .as_ref()
                .filter(|(time, _)| time.saturating_add(skew) >= now)
                .map(|(_, msg)| msg.clone());

            let msg = match cached {
                Some(msg) => msg,
                None => {
                    let Some(msg) = (state.provider)(tx) else {
                        continue;
                    };
                    state.cached = Some((now, msg.clone()));
                    msg
                }
            };

            if let Err(e) = self.push_message(msg) {
                warn!("On-demand message type={} rejected: {}", type_id, e);
            }
        }
    }

    /// Process a transmission received from the driver
    pub fn handle_modem_receive(&mut self, tx: Transmission) {
        match tx.kind {
            TransmissionType::Ack => self.process_ack(&tx),
            _ => self.process_data(&tx),
        }
    }

    fn process_ack(&mut self, ack: &Transmission) {
        if ack.dest != self.config.modem_id {
            debug!("Ignoring ACK for {} (we are {})", ack.dest, self.config.modem_id);
            return;
        }

        let mut acked = Vec::new();
        for frame in &ack.acked_frames {
            for (type_id, queue) in self.queues.iter_mut() {
                for original in queue.pop_message_ack(ack.src, *frame) {
                    acked.push((*type_id, original.msg));
                }
            }
        }

        if acked.is_empty() {
            debug!("ACK from {} matched nothing: frames={:?}", ack.src, ack.acked_frames);
        }
        for (type_id, original) in acked {
            debug!("Acknowledged: type={} by={}", type_id, ack.src);
            self.emit_size(type_id);
            self.emit(QueueEvent::Ack {
                ack: ack.clone(),
                original,
            });
        }
    }

    fn process_data(&mut self, tx: &Transmission) {
        let local = self.config.modem_id;

        if self.config.generate_acks
            && tx.kind == TransmissionType::Data
            && tx.ack_requested
            && tx.dest == local
            && tx.dest != BROADCAST_ID
        {
            self.outbound_acks
                .push_back(Transmission::ack_for(tx, self.clock.now()));
        }

        for (index, frame) in tx.frames.iter().enumerate() {
            let parts = match unpack_frame(frame) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("Skipping frame {} from {}: {}", index, tx.src, e);
                    continue;
                }
            };

            for part in parts {
                match self.codec.decode(&part) {
                    Ok(msg) => self.deliver(tx, msg),
                    Err(e) => warn!("Skipping message in frame {} from {}: {}", index, tx.src, e),
                }
            }
        }
    }

    fn deliver(&self, tx: &Transmission, msg: DynamicMessage) {
        let local = self.config.modem_id;
        let type_id = self.codec.type_id(&msg);

        let Some(queue) = self.queues.get(&type_id) else {
            warn!("Received message of unknown type {} from {}", type_id, tx.src);
            return;
        };
        let manipulators = queue.entry().manipulators;
        if manipulators.contains(Manipulator::NO_DECODE) {
            debug!("Not decoding type={}", type_id);
            return;
        }

        let meta = match queue.meta_from_msg(&msg, tx.src, self.clock.now()) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Skipping message from {}: {}", tx.src, e);
                return;
            }
        };

        let for_us = meta.dest == local || meta.dest == BROADCAST_ID;
        if tx.dest == local && !for_us {
            if let Some(router) = &self.router {
                router.handle_in(&meta, &msg, local);
            }
        }

        if !for_us && !manipulators.contains(Manipulator::PROMISCUOUS) {
            debug!("Dropping message type={} for {}", type_id, meta.dest);
            return;
        }

        self.emit(QueueEvent::Receive { message: msg });
    }

    /// Apply pushes from other components and expire old messages
    pub fn do_work(&mut self) {
        while let Ok(msg) = self.inbound_rx.try_recv() {
            if let Err(e) = self.push_message(msg) {
                warn!("Rejected inbound message: {}", e);
            }
        }

        let now = self.clock.now();
        let mut expired: Vec<(u32, QueuedMessage)> = Vec::new();
        for (type_id, queue) in self.queues.iter_mut() {
            expired.extend(queue.expire(now).into_iter().map(|m| (*type_id, m)));
        }

        let mut changed = HashSet::new();
        for (type_id, message) in expired {
            debug!("Expired message: type={} id={}", type_id, message.id);
            changed.insert(type_id);
            self.emit(QueueEvent::Expire { message: message.msg });
        }
        for type_id in changed {
            self.emit_size(type_id);
        }
    }

    /// Drop every message of a type
    pub fn flush_queue(&mut self, type_id: u32) -> Result<usize, QueueError> {
        let queue = self
            .queues
            .get_mut(&type_id)
            .ok_or_else(|| QueueError::Configuration(format!("no queue configured for type {}", type_id)))?;
        let flushed = queue.flush();
        info!("Flushed {} messages of type={}", flushed, type_id);
        self.emit_size(type_id);
        Ok(flushed)
    }

    /// Messages buffered for a type
    pub fn queue_size(&self, type_id: u32) -> Result<usize, QueueError> {
        Ok(self.queue(type_id)?.size())
    }

    /// Human readable summary of every queue
    pub fn info(&self) -> String {
        let now = self.clock.now();
        let mut out = format!("modem_id={} queues={}\n", self.config.modem_id, self.queues.len());
        for (type_id, queue) in &self.queues {
            let _ = writeln!(
                out,
                "  {} [{}]: size={} awaiting_ack={} idle={:.1}s",
                queue.entry().display_name(),
                type_id,
                queue.size(),
                queue.waiting_count(),
                queue.idle_seconds(now)
            );
        }
        out
    }
}

impl TransmissionHooks for QueueManager {
    fn data_request(&mut self, transmission: &mut Transmission) {
        self.handle_modem_data_request(transmission);
    }
}
