//! Behaviour shared by every transport: outbound preparation and auto-ACK.

use acomms_wire::{
    next_frame_start, Clock, ModemId, Transmission, TransmissionHooks, TransmissionType,
    BROADCAST_ID, QUERY_SOURCE_ID,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Events raised by a driver
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// A transmission arrived from the channel
    Receive(Transmission),
    /// A transmission was handed to the channel
    TransmitResult(Transmission),
    /// Raw bytes read from the channel
    RawIncoming(Bytes),
    /// Raw bytes written to the channel
    RawOutgoing(Bytes),
}

/// State and logic common to all transports
pub struct DriverCore {
    modem_id: ModemId,
    auto_ack: bool,
    payload_budget: usize,
    next_frame: u32,
    clock: Arc<dyn Clock>,
    events: mpsc::Sender<DriverEvent>,
}

impl DriverCore {
    /// Create a core for a transport that can carry `payload_budget` bytes per transmission
    pub fn new(
        modem_id: ModemId,
        auto_ack: bool,
        payload_budget: usize,
        clock: Arc<dyn Clock>,
        events: mpsc::Sender<DriverEvent>,
    ) -> Self {
        Self {
            modem_id,
            auto_ack,
            payload_budget,
            next_frame: 0,
            clock,
            events,
        }
    }

    /// Local node id
    pub fn modem_id(&self) -> ModemId {
        self.modem_id
    }

    /// Sequence number the next DATA transmission will start at
    pub fn next_frame(&self) -> u32 {
        self.next_frame
    }

    /// Current time
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Largest frame allowed when a transmission carries `max_num_frames` frames
    pub fn frame_limit(&self, max_num_frames: u32) -> u32 {
        let per_frame = self.payload_budget / max_num_frames.max(1) as usize;
        per_frame.min(u32::MAX as usize) as u32
    }

    /// Run the hooks over an outbound transmission.
    ///
    /// Returns `None` when a DATA transmission ends up with nothing to send.
    pub fn prepare(
        &mut self,
        mut tx: Transmission,
        hooks: &mut dyn TransmissionHooks,
    ) -> Option<Transmission> {
        hooks.modify_transmission(&mut tx);

        if tx.kind == TransmissionType::Data {
            let limit = self.frame_limit(tx.max_num_frames);
            if tx.max_frame_bytes == 0 || tx.max_frame_bytes > limit {
                tx.max_frame_bytes = limit;
            }
            tx.frame_start = self.next_frame;

            if tx.frames.is_empty() {
                hooks.data_request(&mut tx);
            }

            if tx.frames.first().map_or(true, |f| f.is_empty()) {
                trace!("Suppressing empty DATA transmission: dest={}", tx.dest);
                return None;
            }
            self.next_frame = next_frame_start(self.next_frame, tx.frames.len());
        }

        if tx.src == QUERY_SOURCE_ID {
            tx.src = self.modem_id;
        }
        tx.time = self.clock.now();
        Some(tx)
    }

    /// The ACK to send in answer to `received`, if one is due
    pub fn auto_ack(&self, received: &Transmission) -> Option<Transmission> {
        if !self.auto_ack
            || received.kind != TransmissionType::Data
            || !received.ack_requested
            || received.dest != self.modem_id
            || received.dest == BROADCAST_ID
        {
            return None;
        }
        debug!(
            "Auto-acknowledging DATA: src={} frame_start={} frames={}",
            received.src,
            received.frame_start,
            received.frames.len()
        );
        Some(Transmission::ack_for(received, self.clock.now()))
    }

    /// Raise an event
    pub fn emit(&self, event: DriverEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Failed to send driver event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acomms_wire::{ManualClock, FRAME_COUNT_ROLLOVER, QUERY_DESTINATION_ID};

    struct FillHooks {
        frames: Vec<Bytes>,
        requests: usize,
        seen_limit: u32,
        seen_start: u32,
    }

    impl FillHooks {
        fn new(frames: Vec<Bytes>) -> Self {
            Self {
                frames,
                requests: 0,
                seen_limit: 0,
                seen_start: 0,
            }
        }
    }

    impl TransmissionHooks for FillHooks {
        fn modify_transmission(&mut self, tx: &mut Transmission) {
            tx.rate = 7;
        }

        fn data_request(&mut self, tx: &mut Transmission) {
            self.requests += 1;
            self.seen_limit = tx.max_frame_bytes;
            self.seen_start = tx.frame_start;
            tx.dest = 2;
            tx.frames = self.frames.clone();
        }
    }

    fn core(budget: usize) -> (DriverCore, mpsc::Receiver<DriverEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let clock = Arc::new(ManualClock::new(5_000));
        (DriverCore::new(1, true, budget, clock, tx), rx)
    }

    #[test]
    fn test_prepare_requests_data_and_advances_frames() {
        let (mut core, _rx) = core(1000);
        let mut hooks = FillHooks::new(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);

        let mut request = Transmission::default();
        request.max_num_frames = 4;
        let tx = core.prepare(request, &mut hooks).unwrap();

        assert_eq!(hooks.requests, 1);
        assert_eq!(hooks.seen_limit, 250);
        assert_eq!(hooks.seen_start, 0);
        assert_eq!((tx.src, tx.dest, tx.rate, tx.time), (1, 2, 7, 5_000));
        assert_eq!(core.next_frame(), 2);

        let tx = core.prepare(Transmission::default(), &mut hooks).unwrap();
        assert_eq!(tx.frame_start, 2);
        assert_eq!(core.next_frame(), 4);
    }

    #[test]
    fn test_prepare_keeps_smaller_frame_limit() {
        let (mut core, _rx) = core(1000);
        let mut hooks = FillHooks::new(vec![Bytes::from_static(b"a")]);
        let mut request = Transmission::default();
        request.max_frame_bytes = 32;
        core.prepare(request, &mut hooks).unwrap();
        assert_eq!(hooks.seen_limit, 32);
    }

    #[test]
    fn test_prepare_suppresses_empty_data() {
        let (mut core, _rx) = core(1000);
        let mut hooks = FillHooks::new(Vec::new());
        assert!(core.prepare(Transmission::default(), &mut hooks).is_none());

        let mut hooks = FillHooks::new(vec![Bytes::new(), Bytes::from_static(b"x")]);
        assert!(core.prepare(Transmission::default(), &mut hooks).is_none());
        assert_eq!(core.next_frame(), 0);
    }

    #[test]
    fn test_prepare_passes_other_types_through() {
        let (mut core, _rx) = core(1000);
        let mut hooks = FillHooks::new(Vec::new());
        let mut ranging = Transmission::data(QUERY_SOURCE_ID, 4);
        ranging.kind = TransmissionType::Ranging;

        let tx = core.prepare(ranging, &mut hooks).unwrap();
        assert_eq!(hooks.requests, 0);
        assert_eq!((tx.src, tx.dest, tx.kind), (1, 4, TransmissionType::Ranging));
    }

    #[test]
    fn test_frame_start_wraps() {
        let (mut core, _rx) = core(1000);
        core.next_frame = FRAME_COUNT_ROLLOVER - 1;
        let mut hooks = FillHooks::new(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);

        let tx = core.prepare(Transmission::default(), &mut hooks).unwrap();
        assert_eq!(tx.frame_start, FRAME_COUNT_ROLLOVER - 1);
        assert_eq!(tx.frame_number(1), 0);
        assert_eq!(core.next_frame(), 1);
    }

    #[test]
    fn test_auto_ack_rules() {
        let (core, _rx) = core(1000);
        let mut data = Transmission::data(2, 1);
        data.ack_requested = true;
        data.frame_start = 9;
        data.frames = vec![Bytes::from_static(b"a")];

        let ack = core.auto_ack(&data).unwrap();
        assert_eq!((ack.src, ack.dest, ack.kind), (1, 2, TransmissionType::Ack));
        assert_eq!(ack.acked_frames, vec![9]);

        let mut broadcast = data.clone();
        broadcast.dest = BROADCAST_ID;
        assert!(core.auto_ack(&broadcast).is_none());

        let mut elsewhere = data.clone();
        elsewhere.dest = 3;
        assert!(core.auto_ack(&elsewhere).is_none());

        let mut unrequested = data.clone();
        unrequested.ack_requested = false;
        assert!(core.auto_ack(&unrequested).is_none());

        let mut query = data;
        query.dest = QUERY_DESTINATION_ID;
        assert!(core.auto_ack(&query).is_none());
    }

    #[test]
    fn test_auto_ack_disabled() {
        let (tx, _rx) = mpsc::channel(1);
        let core = DriverCore::new(1, false, 100, Arc::new(ManualClock::new(0)), tx);
        let mut data = Transmission::data(2, 1);
        data.ack_requested = true;
        data.frames = vec![Bytes::from_static(b"a")];
        assert!(core.auto_ack(&data).is_none());
    }
}
