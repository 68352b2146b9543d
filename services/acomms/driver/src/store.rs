//! Request/reply transport through a shore-side store server.
//!
//! The driver never blocks: every `query_interval` it sends its outbox in a
//! [`StoreRequest`] and polls for the matching [`StoreResponse`]. A request
//! that goes unanswered for `request_timeout` is dropped together with its
//! outbox, and the connection is recreated once. The server may already have
//! stored that outbox, so it is never sent a second time.
//!
//! ```text
//! node ── StoreRequest { modem_id, outbox } ──► server
//! node ◄── StoreResponse { inbox } ──────────── server
//! ```

use crate::common::{DriverCore, DriverEvent};
use crate::config::{resolve, STORE_MAX_MESSAGE_SIZE};
use crate::error::DriverError;
use crate::stream::{ByteStream, FramedConnection};
use acomms_wire::{
    seconds_to_micros, ModemId, Timestamp, Transmission, TransmissionHooks, WireError,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::TcpStream;
use tracing::{debug, info, warn};

/// Sent by a node: everything it wants delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRequest {
    /// Requesting node
    pub modem_id: ModemId,
    /// Transmissions to deliver
    pub outbox: Vec<Transmission>,
}

/// Sent by the server: everything waiting for the requester
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreResponse {
    /// Transmissions addressed to the requester
    pub inbox: Vec<Transmission>,
}

pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, DriverError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| WireError::Cbor(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DriverError> {
    Ok(ciborium::from_reader(bytes).map_err(|e| WireError::Cbor(e.to_string()))?)
}

struct InFlight {
    sent_at: Timestamp,
    outbox: Vec<Transmission>,
}

/// Driver for the store server
pub struct StoreDriver {
    core: DriverCore,
    server: String,
    query_interval: u64,
    request_timeout: u64,
    connection: Option<FramedConnection>,
    outbox: Vec<Transmission>,
    in_flight: Option<InFlight>,
    last_request: Option<Timestamp>,
}

impl StoreDriver {
    /// Create a driver that talks to `server`
    pub fn new(
        core: DriverCore,
        server: String,
        query_interval_seconds: f64,
        request_timeout_seconds: f64,
    ) -> Self {
        Self {
            core,
            server,
            query_interval: seconds_to_micros(query_interval_seconds),
            request_timeout: seconds_to_micros(request_timeout_seconds),
            connection: None,
            outbox: Vec::new(),
            in_flight: None,
            last_request: None,
        }
    }

    /// Local node id
    pub fn modem_id(&self) -> ModemId {
        self.core.modem_id()
    }

    /// Transmissions waiting for the next request
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Whether a request is waiting for its reply
    pub fn request_pending(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Connect to the server
    pub fn startup(&mut self) -> Result<(), DriverError> {
        self.connect()?;
        info!("Store driver connected: modem_id={} server={}", self.core.modem_id(), self.server);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), DriverError> {
        let addr = resolve(&self.server)?;
        let stream = TcpStream::connect(addr)
            .map_err(|e| DriverError::Connection(format!("connect to {} failed: {}", addr, e)))?;
        self.connection = Some(FramedConnection::new(ByteStream::tcp(stream)?, STORE_MAX_MESSAGE_SIZE));
        Ok(())
    }

    /// Drop the connection and any request in flight
    pub fn shutdown(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        if let Some(in_flight) = self.in_flight.take() {
            self.requeue(in_flight.outbox);
        }
        self.last_request = None;
        debug!("Store driver stopped: modem_id={}", self.core.modem_id());
    }

    /// Poll for a reply, handle a timed out request, and send the next request when due
    pub fn do_work(&mut self) -> Result<(), DriverError> {
        if self.connection.is_none() {
            return Err(DriverError::NotStarted);
        }
        let now = self.core.now();

        if self.in_flight.is_some() {
            if let Some(response) = self.poll_response()? {
                self.in_flight = None;
                debug!("Store reply: modem_id={} inbox={}", self.core.modem_id(), response.inbox.len());
                for tx in response.inbox {
                    self.receive(tx);
                }
            } else if self
                .in_flight
                .as_ref()
                .is_some_and(|f| now.saturating_sub(f.sent_at) >= self.request_timeout)
            {
                let dropped = self.in_flight.take().map_or(0, |f| f.outbox.len());
                warn!(
                    "No store reply within {}us, dropping request and resetting connection: server={} outbox={}",
                    self.request_timeout, self.server, dropped
                );
                if let Some(mut connection) = self.connection.take() {
                    connection.close();
                }
                self.connect()?;
            }
        }

        let due = self
            .last_request
            .map_or(true, |last| now.saturating_sub(last) >= self.query_interval);
        if self.in_flight.is_none() && due {
            self.send_request(now)?;
        }
        Ok(())
    }

    fn poll_response(&mut self) -> Result<Option<StoreResponse>, DriverError> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(DriverError::NotStarted);
        };
        connection.flush()?;
        if let Some(raw) = connection.fill()? {
            self.core.emit(DriverEvent::RawIncoming(raw));
        }
        while let Some(payload) = connection.next_message() {
            match from_cbor::<StoreResponse>(&payload) {
                Ok(response) => return Ok(Some(response)),
                Err(e) => warn!("Discarding store reply: {}", e),
            }
        }
        Ok(None)
    }

    fn send_request(&mut self, now: Timestamp) -> Result<(), DriverError> {
        let request = StoreRequest {
            modem_id: self.core.modem_id(),
            outbox: std::mem::take(&mut self.outbox),
        };
        let payload = match to_cbor(&request) {
            Ok(payload) => payload,
            Err(e) => {
                self.requeue(request.outbox);
                return Err(e);
            }
        };
        let Some(connection) = self.connection.as_mut() else {
            self.requeue(request.outbox);
            return Err(DriverError::NotStarted);
        };
        let raw = match connection.send(&payload) {
            Ok(raw) => raw,
            Err(e) => {
                self.requeue(request.outbox);
                return Err(e);
            }
        };

        self.core.emit(DriverEvent::RawOutgoing(raw));
        for tx in &request.outbox {
            self.core.emit(DriverEvent::TransmitResult(tx.clone()));
        }
        self.in_flight = Some(InFlight {
            sent_at: now,
            outbox: request.outbox,
        });
        self.last_request = Some(now);
        Ok(())
    }

    fn requeue(&mut self, mut outbox: Vec<Transmission>) {
        outbox.append(&mut self.outbox);
        self.outbox = outbox;
    }

    fn receive(&mut self, tx: Transmission) {
        if let Some(ack) = self.core.auto_ack(&tx) {
            self.outbox.push(ack);
        }
        self.core.emit(DriverEvent::Receive(tx));
    }

    /// Prepare a transmission the MAC granted and hold it for the next request
    pub fn handle_initiate_transmission(
        &mut self,
        tx: Transmission,
        hooks: &mut dyn TransmissionHooks,
    ) -> Result<(), DriverError> {
        if self.connection.is_none() {
            return Err(DriverError::NotStarted);
        }
        if let Some(tx) = self.core.prepare(tx, hooks) {
            debug!("Queued {:?} transmission for store: dest={}", tx.kind, tx.dest);
            self.outbox.push(tx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_server::StoreServer;
    use acomms_wire::{ManualClock, TransmissionType, MICROS_PER_SECOND};
    use bytes::Bytes;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Payload(&'static [u8], bool);

    impl TransmissionHooks for Payload {
        fn data_request(&mut self, tx: &mut Transmission) {
            tx.ack_requested = self.1;
            tx.frames = vec![Bytes::from_static(self.0)];
        }
    }

    fn driver(
        modem_id: ModemId,
        server: String,
        clock: &ManualClock,
    ) -> (StoreDriver, mpsc::Receiver<DriverEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let core = DriverCore::new(modem_id, true, 1024, Arc::new(clock.clone()), tx);
        let mut driver = StoreDriver::new(core, server, 1.0, 5.0);
        driver.startup().unwrap();
        (driver, rx)
    }

    /// Run driver and server passes until the driver's request is answered
    fn exchange(driver: &mut StoreDriver, server: &mut StoreServer) {
        driver.do_work().unwrap();
        for _ in 0..200 {
            server.do_work().unwrap();
            driver.do_work().unwrap();
            if !driver.request_pending() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("store request not answered");
    }

    fn received(rx: &mut mpsc::Receiver<DriverEvent>) -> Vec<Transmission> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DriverEvent::Receive(tx) = event {
                out.push(tx);
            }
        }
        out
    }

    #[test]
    fn test_request_reply_delivers_and_acks() {
        let mut server = StoreServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let clock = ManualClock::new(100 * MICROS_PER_SECOND);
        let (mut one, mut one_rx) = driver(1, addr.clone(), &clock);
        let (mut two, mut two_rx) = driver(2, addr, &clock);

        // both nodes make themselves known
        exchange(&mut one, &mut server);
        exchange(&mut two, &mut server);

        one.handle_initiate_transmission(Transmission::data(1, 2), &mut Payload(b"fix", true))
            .unwrap();
        assert_eq!(one.outbox_len(), 1);

        clock.advance(Duration::from_secs(1));
        exchange(&mut one, &mut server);
        assert_eq!(one.outbox_len(), 0);
        exchange(&mut two, &mut server);

        let got = received(&mut two_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].frames[0].as_ref(), b"fix");
        assert_eq!(two.outbox_len(), 1);

        clock.advance(Duration::from_secs(1));
        exchange(&mut two, &mut server);
        exchange(&mut one, &mut server);
        let acks = received(&mut one_rx);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind, TransmissionType::Ack);
        assert_eq!(acks[0].acked_frames, vec![0]);
    }

    #[test]
    fn test_request_waits_for_interval() {
        let mut server = StoreServer::bind("127.0.0.1:0").unwrap();
        let clock = ManualClock::new(0);
        let (mut one, _rx) = driver(1, server.local_addr().unwrap().to_string(), &clock);

        exchange(&mut one, &mut server);
        one.do_work().unwrap();
        assert!(!one.request_pending());

        clock.advance(Duration::from_secs(1));
        one.do_work().unwrap();
        assert!(one.request_pending());
    }

    #[test]
    fn test_unanswered_request_is_dropped() {
        // a listener that never replies
        let silent = TcpListener::bind("127.0.0.1:0").unwrap();
        let clock = ManualClock::new(0);
        let (mut one, _rx) = driver(1, silent.local_addr().unwrap().to_string(), &clock);

        one.handle_initiate_transmission(Transmission::data(1, 2), &mut Payload(b"x", false))
            .unwrap();
        one.do_work().unwrap();
        assert!(one.request_pending());
        assert_eq!(one.outbox_len(), 0);

        clock.advance(Duration::from_secs(4));
        one.do_work().unwrap();
        assert!(one.request_pending());

        clock.advance(Duration::from_secs(1));
        one.do_work().unwrap();
        // a fresh request goes out on the new connection without the dropped outbox
        assert!(one.request_pending());
        assert_eq!(one.in_flight.as_ref().map(|f| f.outbox.len()), Some(0));
        assert_eq!(one.outbox_len(), 0);
    }

    #[test]
    fn test_not_started() {
        let (tx, _rx) = mpsc::channel(1);
        let core = DriverCore::new(1, true, 100, Arc::new(ManualClock::new(0)), tx);
        let mut driver = StoreDriver::new(core, "127.0.0.1:1".to_string(), 1.0, 1.0);
        assert!(matches!(driver.do_work(), Err(DriverError::NotStarted)));
    }
}
