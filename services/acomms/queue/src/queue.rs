//! A single message type's queue.

use crate::config::{QueuedMessageEntry, RoleKind, RoleSource};
use crate::error::QueueError;
use crate::message::{DynamicMessage, FieldAccess};
use crate::priority::{PriorityFn, PriorityInputs};
use acomms_wire::{
    seconds_to_micros, ModemId, Timestamp, BROADCAST_ID, MICROS_PER_SECOND, QUERY_DESTINATION_ID,
};
use bytes::Bytes;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Addressing and bookkeeping extracted from a message through its roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMeta {
    /// Originating node
    pub src: ModemId,
    /// Final destination node
    pub dest: ModemId,
    /// Creation time
    pub time: Timestamp,
    /// Whether the receiver must acknowledge the message
    pub ack_requested: bool,
    /// Last time the message went out, if ever
    pub last_sent_time: Option<Timestamp>,
    /// Encoded size in bytes
    pub encoded_size: usize,
}

/// A buffered message and its encoding
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    /// Identifier unique within the queue
    pub id: u64,
    /// The message
    pub msg: DynamicMessage,
    /// Extracted metadata
    pub meta: MessageMeta,
    /// Encoded bytes, produced once at push time
    pub encoded: Bytes,
}

/// Ordered pending messages of one type plus the set awaiting acknowledgement
#[derive(Debug)]
pub struct Queue {
    entry: QueuedMessageEntry,
    messages: VecDeque<QueuedMessage>,
    /// (link destination, frame number) -> ids of the messages packed in that frame
    waiting_for_ack: BTreeMap<(ModemId, u32), Vec<u64>>,
    last_send_time: Timestamp,
    next_id: u64,
}

impl Queue {
    /// Create an empty queue
    pub fn new(entry: QueuedMessageEntry, now: Timestamp) -> Self {
        Self {
            entry,
            messages: VecDeque::new(),
            waiting_for_ack: BTreeMap::new(),
            last_send_time: now,
            next_id: 0,
        }
    }

    /// The policy this queue follows
    pub fn entry(&self) -> &QueuedMessageEntry {
        &self.entry
    }

    /// Extract addressing and time from a message using the configured roles.
    ///
    /// Missing roles default to `local` as source, broadcast as destination
    /// and `now` as time.
    pub fn meta_from_msg(
        &self,
        msg: &DynamicMessage,
        local: ModemId,
        now: Timestamp,
    ) -> Result<MessageMeta, QueueError> {
        let mut meta = MessageMeta {
            src: local,
            dest: BROADCAST_ID,
            time: now,
            ack_requested: false,
            last_sent_time: None,
            encoded_size: 0,
        };

        for role in &self.entry.roles {
            let value = match &role.source {
                RoleSource::Static(value) => value,
                RoleSource::Field(path) => msg.get_field(path).ok_or_else(|| {
                    QueueError::Configuration(format!(
                        "{}: role field `{}` not present in message",
                        self.entry.display_name(),
                        path
                    ))
                })?,
            };

            match role.kind {
                RoleKind::SourceId => meta.src = self.modem_id_from(value)?,
                RoleKind::DestinationId => meta.dest = self.modem_id_from(value)?,
                RoleKind::Timestamp => meta.time = self.timestamp_from(value)?,
            }
        }

        meta.ack_requested = self.entry.ack && meta.dest != BROADCAST_ID;
        Ok(meta)
    }

    fn modem_id_from(&self, value: &Value) -> Result<ModemId, QueueError> {
        value
            .as_u64()
            .and_then(|v| ModemId::try_from(v).ok())
            .ok_or_else(|| {
                QueueError::Configuration(format!(
                    "{}: expected a modem id, got {}",
                    self.entry.display_name(),
                    value
                ))
            })
    }

    fn timestamp_from(&self, value: &Value) -> Result<Timestamp, QueueError> {
        let parsed = match value {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(seconds_to_micros)),
            Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.timestamp_micros().max(0) as u64),
            _ => None,
        };

        parsed.ok_or_else(|| {
            QueueError::Configuration(format!(
                "{}: unusable timestamp {}",
                self.entry.display_name(),
                value
            ))
        })
    }

    /// Buffer a message. Returns the entry dropped by overflow, if any.
    pub fn push(&mut self, msg: DynamicMessage, mut meta: MessageMeta, encoded: Bytes) -> Option<QueuedMessage> {
        meta.encoded_size = encoded.len();
        let id = self.next_id;
        self.next_id += 1;

        self.messages.push_back(QueuedMessage { id, msg, meta, encoded });

        let max = self.entry.max_queue?;
        if self.messages.len() <= max {
            return None;
        }

        let dropped = if self.entry.newest_first {
            self.messages.pop_front()
        } else {
            self.messages.pop_back()
        };

        if let Some(dropped) = &dropped {
            self.forget_ack(dropped.id);
            debug!(
                "Queue {} full ({}), dropped message {}",
                self.entry.display_name(),
                max,
                dropped.id
            );
        }
        dropped
    }

    fn is_waiting(&self, id: u64) -> bool {
        self.waiting_for_ack.values().any(|ids| ids.contains(&id))
    }

    fn forget_ack(&mut self, id: u64) {
        self.waiting_for_ack.retain(|_, ids| {
            ids.retain(|waiting| *waiting != id);
            !ids.is_empty()
        });
    }

    /// Next message that is not currently awaiting acknowledgement
    pub fn next_unsent(&self) -> Option<&QueuedMessage> {
        let unsent = |m: &&QueuedMessage| !self.is_waiting(m.id);
        if self.entry.newest_first {
            self.messages.iter().rev().find(unsent)
        } else {
            self.messages.iter().find(unsent)
        }
    }

    /// Priority for the next frame, or `None` when the queue cannot contribute.
    ///
    /// `dest` is the destination already fixed for the transmission being
    /// built, or the query sentinel if none has been chosen yet.
    pub fn priority_value(
        &self,
        now: Timestamp,
        dest: ModemId,
        remaining_bytes: Option<usize>,
        priority_fn: &PriorityFn,
    ) -> Option<f64> {
        let blackout = seconds_to_micros(self.entry.blackout_time_seconds);
        if now < self.last_send_time.saturating_add(blackout) {
            return None;
        }

        let next = self.next_unsent()?;

        if let Some(remaining) = remaining_bytes {
            if crate::codec::packed_len(next.encoded.len()) > remaining {
                return None;
            }
        }

        if dest != QUERY_DESTINATION_ID && next.meta.dest != BROADCAST_ID && next.meta.dest != dest {
            return None;
        }

        Some(priority_fn(&PriorityInputs {
            now,
            last_send_time: self.last_send_time,
            ttl_seconds: self.entry.ttl_seconds,
            value_base: self.entry.value_base,
        }))
    }

    /// Take the next unsent message for a frame, stamping the send time
    pub fn give_data(&mut self, now: Timestamp) -> Option<QueuedMessage> {
        let id = self.next_unsent()?.id;
        self.last_send_time = now;
        let message = self.messages.iter_mut().find(|m| m.id == id)?;
        message.meta.last_sent_time = Some(now);
        Some(message.clone())
    }

    /// Record that message `id` went out to `dest` as frame `frame`
    pub fn await_ack(&mut self, id: u64, dest: ModemId, frame: u32) {
        let ids = self.waiting_for_ack.entry((dest, frame)).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    /// Remove a message outright
    pub fn pop_message(&mut self, id: u64) -> Option<QueuedMessage> {
        let index = self.messages.iter().position(|m| m.id == id)?;
        self.forget_ack(id);
        self.messages.remove(index)
    }

    /// Remove every message acknowledged by `src` for `frame`
    pub fn pop_message_ack(&mut self, src: ModemId, frame: u32) -> Vec<QueuedMessage> {
        let Some(ids) = self.waiting_for_ack.remove(&(src, frame)) else {
            return Vec::new();
        };
        ids.into_iter().filter_map(|id| self.pop_message(id)).collect()
    }

    /// Remove every message older than the TTL
    pub fn expire(&mut self, now: Timestamp) -> Vec<QueuedMessage> {
        let ttl = seconds_to_micros(self.entry.ttl_seconds);
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.messages.len());

        for message in self.messages.drain(..) {
            if message.meta.time.saturating_add(ttl) < now {
                expired.push(message);
            } else {
                kept.push_back(message);
            }
        }
        self.messages = kept;

        for message in &expired {
            self.forget_ack(message.id);
        }
        expired
    }

    /// Release awaiting-ack entries older than `ack_wait_seconds`, making
    /// their messages eligible to be sent again. Returns the released count.
    pub fn clear_ack_queue(&mut self, now: Timestamp, ack_wait_seconds: f64) -> usize {
        let wait = seconds_to_micros(ack_wait_seconds);
        let messages = &self.messages;
        let before = self.waiting_count();

        self.waiting_for_ack.retain(|_, ids| {
            ids.retain(|id| {
                messages
                    .iter()
                    .find(|m| m.id == *id)
                    .and_then(|m| m.meta.last_sent_time)
                    .is_some_and(|sent| sent.saturating_add(wait) >= now)
            });
            !ids.is_empty()
        });
        before - self.waiting_count()
    }

    /// Drop every message
    pub fn flush(&mut self) -> usize {
        let count = self.messages.len();
        self.messages.clear();
        self.waiting_for_ack.clear();
        count
    }

    /// Buffered messages, including those awaiting acknowledgement
    pub fn size(&self) -> usize {
        self.messages.len()
    }

    /// Entries awaiting acknowledgement
    pub fn waiting_count(&self) -> usize {
        self.waiting_for_ack.values().map(Vec::len).sum()
    }

    /// Creation time of the newest buffered message
    pub fn newest_msg_time(&self) -> Option<Timestamp> {
        self.messages.iter().map(|m| m.meta.time).max()
    }

    /// Last time this queue contributed to a transmission
    pub fn last_send_time(&self) -> Timestamp {
        self.last_send_time
    }

    /// Seconds since the last send, for diagnostics
    pub fn idle_seconds(&self, now: Timestamp) -> f64 {
        now.saturating_sub(self.last_send_time) as f64 / MICROS_PER_SECOND as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::priority::default_priority_fn;
    use serde_json::json;

    const T0: Timestamp = 1_000 * MICROS_PER_SECOND;

    fn entry() -> QueuedMessageEntry {
        QueuedMessageEntry::new(5)
            .with_role(Role::field(RoleKind::DestinationId, "dest"))
            .with_role(Role::field(RoleKind::SourceId, "src"))
    }

    fn push(queue: &mut Queue, dest: ModemId, tag: &str) -> Option<QueuedMessage> {
        let msg = DynamicMessage::new(5, json!({"src": 1, "dest": dest, "tag": tag}));
        let meta = queue.meta_from_msg(&msg, 1, T0).unwrap();
        queue.push(msg, meta, Bytes::from(tag.as_bytes().to_vec()))
    }

    fn tag(message: &QueuedMessage) -> &str {
        message.msg.body["tag"].as_str().unwrap()
    }

    #[test]
    fn test_meta_from_roles() {
        let queue = Queue::new(entry().with_role(Role::field(RoleKind::Timestamp, "t")), T0);
        let msg = DynamicMessage::new(5, json!({"src": 3, "dest": 4, "t": 2.5}));
        let meta = queue.meta_from_msg(&msg, 1, T0).unwrap();
        assert_eq!((meta.src, meta.dest, meta.time), (3, 4, 2_500_000));
        assert!(meta.ack_requested);

        let msg = DynamicMessage::new(5, json!({"src": 3, "dest": 4, "t": "1970-01-01T00:00:10Z"}));
        assert_eq!(queue.meta_from_msg(&msg, 1, T0).unwrap().time, 10 * MICROS_PER_SECOND);
    }

    #[test]
    fn test_meta_defaults_and_broadcast() {
        let queue = Queue::new(QueuedMessageEntry::new(5), T0);
        let meta = queue.meta_from_msg(&DynamicMessage::new(5, json!({})), 7, T0).unwrap();
        assert_eq!((meta.src, meta.dest, meta.time), (7, BROADCAST_ID, T0));
        assert!(!meta.ack_requested);
    }

    #[test]
    fn test_meta_rejects_bad_fields() {
        let queue = Queue::new(entry(), T0);
        let missing = DynamicMessage::new(5, json!({"src": 1}));
        assert!(matches!(queue.meta_from_msg(&missing, 1, T0), Err(QueueError::Configuration(_))));
        let text = DynamicMessage::new(5, json!({"src": 1, "dest": "two"}));
        assert!(queue.meta_from_msg(&text, 1, T0).is_err());
    }

    #[test]
    fn test_newest_first_order_and_overflow() {
        let mut e = entry();
        e.max_queue = Some(2);
        let mut queue = Queue::new(e, T0);

        assert!(push(&mut queue, 2, "a").is_none());
        assert!(push(&mut queue, 2, "b").is_none());
        let dropped = push(&mut queue, 2, "c").unwrap();
        assert_eq!(tag(&dropped), "a");
        assert_eq!(tag(queue.next_unsent().unwrap()), "c");
    }

    #[test]
    fn test_fifo_overflow_drops_newest() {
        let mut e = entry();
        e.max_queue = Some(2);
        e.newest_first = false;
        let mut queue = Queue::new(e, T0);

        push(&mut queue, 2, "a");
        push(&mut queue, 2, "b");
        assert_eq!(tag(&push(&mut queue, 2, "c").unwrap()), "c");
        assert_eq!(tag(queue.next_unsent().unwrap()), "a");
    }

    #[test]
    fn test_ack_lifecycle() {
        let mut queue = Queue::new(entry(), T0);
        push(&mut queue, 2, "a");
        push(&mut queue, 2, "b");

        let sent = queue.give_data(T0 + 1).unwrap();
        queue.await_ack(sent.id, 2, 40);
        assert_eq!(tag(queue.next_unsent().unwrap()), "a");
        assert_eq!(queue.size(), 2);

        assert!(queue.pop_message_ack(3, 40).is_empty());
        let acked = queue.pop_message_ack(2, 40);
        assert_eq!(acked.len(), 1);
        assert_eq!(tag(&acked[0]), "b");
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.waiting_count(), 0);
    }

    #[test]
    fn test_shared_frame_acks_every_message() {
        let mut queue = Queue::new(entry(), T0);
        push(&mut queue, 2, "a");
        push(&mut queue, 2, "b");

        let first = queue.give_data(T0).unwrap();
        queue.await_ack(first.id, 2, 7);
        let second = queue.give_data(T0).unwrap();
        queue.await_ack(second.id, 2, 7);
        assert_ne!(first.id, second.id);
        assert!(queue.next_unsent().is_none());
        assert_eq!(queue.waiting_count(), 2);

        let mut acked: Vec<_> = queue.pop_message_ack(2, 7).iter().map(|m| tag(m).to_string()).collect();
        acked.sort();
        assert_eq!(acked, vec!["a", "b"]);
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.waiting_count(), 0);
    }

    #[test]
    fn test_ack_wait_timeout_releases_message() {
        let mut queue = Queue::new(entry(), T0);
        push(&mut queue, 2, "a");
        let sent = queue.give_data(T0).unwrap();
        queue.await_ack(sent.id, 2, 0);

        assert_eq!(queue.clear_ack_queue(T0 + MICROS_PER_SECOND, 5.0), 0);
        assert!(queue.next_unsent().is_none());
        assert_eq!(queue.clear_ack_queue(T0 + 6 * MICROS_PER_SECOND, 5.0), 1);
        assert_eq!(tag(queue.next_unsent().unwrap()), "a");
    }

    #[test]
    fn test_expire() {
        let mut e = entry();
        e.ttl_seconds = 10.0;
        let mut queue = Queue::new(e, T0);
        push(&mut queue, 2, "a");
        let sent = queue.give_data(T0).unwrap();
        queue.await_ack(sent.id, 2, 0);

        assert!(queue.expire(T0 + 10 * MICROS_PER_SECOND).is_empty());
        let expired = queue.expire(T0 + 11 * MICROS_PER_SECOND);
        assert_eq!(expired.len(), 1);
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.waiting_count(), 0);
    }

    #[test]
    fn test_priority_skips() {
        let priority = default_priority_fn();
        let mut e = entry();
        e.blackout_time_seconds = 5.0;
        let mut queue = Queue::new(e, T0);

        assert!(queue.priority_value(T0 + 10 * MICROS_PER_SECOND, QUERY_DESTINATION_ID, None, &priority).is_none());
        push(&mut queue, 2, "abcd");

        // blackout since creation
        assert!(queue.priority_value(T0 + MICROS_PER_SECOND, QUERY_DESTINATION_ID, None, &priority).is_none());
        let later = T0 + 10 * MICROS_PER_SECOND;
        assert!(queue.priority_value(later, QUERY_DESTINATION_ID, None, &priority).is_some());
        // does not fit
        assert!(queue.priority_value(later, QUERY_DESTINATION_ID, Some(5), &priority).is_none());
        assert!(queue.priority_value(later, QUERY_DESTINATION_ID, Some(6), &priority).is_some());
        // destination conflict
        assert!(queue.priority_value(later, 3, None, &priority).is_none());
        assert!(queue.priority_value(later, 2, None, &priority).is_some());
    }
}
