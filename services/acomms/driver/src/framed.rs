//! Byte-stream transport: one CBOR transmission per byte-stuffed message.

use crate::common::{DriverCore, DriverEvent};
use crate::config::{resolve, StreamEndpoint};
use crate::error::DriverError;
use crate::stream::{ByteStream, FramedConnection};
use acomms_wire::{decode_transmission, encode_transmission, Transmission, TransmissionHooks};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Driver for a framed byte stream
pub struct FramedDriver {
    core: DriverCore,
    endpoint: Option<StreamEndpoint>,
    max_message_size: usize,
    listener: Option<TcpListener>,
    connection: Option<FramedConnection>,
    started: bool,
}

impl FramedDriver {
    /// Create a driver that opens `endpoint` on startup
    pub fn new(core: DriverCore, endpoint: StreamEndpoint, max_message_size: usize) -> Self {
        Self {
            core,
            endpoint: Some(endpoint),
            max_message_size,
            listener: None,
            connection: None,
            started: false,
        }
    }

    /// Create a driver over an already open stream
    pub fn with_stream(core: DriverCore, stream: ByteStream, max_message_size: usize) -> Self {
        Self {
            core,
            endpoint: None,
            max_message_size,
            listener: None,
            connection: Some(FramedConnection::new(stream, max_message_size)),
            started: false,
        }
    }

    /// Local node id
    pub fn modem_id(&self) -> u32 {
        self.core.modem_id()
    }

    /// Address the server endpoint is listening on
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Whether a peer is connected
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Open the channel
    pub fn startup(&mut self) -> Result<(), DriverError> {
        match &self.endpoint {
            Some(StreamEndpoint::TcpClient { address }) => {
                let addr = resolve(address)?;
                let stream = TcpStream::connect(addr)
                    .map_err(|e| DriverError::Connection(format!("connect to {} failed: {}", addr, e)))?;
                let stream = ByteStream::tcp(stream)?;
                info!("Framed driver connected: modem_id={} peer={}", self.core.modem_id(), addr);
                self.connection = Some(FramedConnection::new(stream, self.max_message_size));
            }
            Some(StreamEndpoint::TcpServer { bind }) => {
                let listener = TcpListener::bind(resolve(bind)?)?;
                listener.set_nonblocking(true)?;
                info!(
                    "Framed driver listening: modem_id={} addr={}",
                    self.core.modem_id(),
                    listener.local_addr()?
                );
                self.listener = Some(listener);
            }
            None => {}
        }
        self.started = true;
        Ok(())
    }

    /// Release the channel
    pub fn shutdown(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.listener = None;
        self.started = false;
        debug!("Framed driver stopped: modem_id={}", self.core.modem_id());
    }

    /// One nonblocking pass over the channel
    pub fn do_work(&mut self) -> Result<(), DriverError> {
        if !self.started {
            return Err(DriverError::NotStarted);
        }
        self.accept()?;

        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };
        connection.flush()?;
        if let Some(raw) = connection.fill()? {
            self.core.emit(DriverEvent::RawIncoming(raw));
        }

        while let Some(payload) = self.connection.as_mut().and_then(FramedConnection::next_message) {
            match decode_transmission(&payload) {
                Ok(tx) => self.receive(tx)?,
                Err(e) => warn!("Discarding undecodable transmission: {}", e),
            }
        }
        Ok(())
    }

    fn accept(&mut self) -> Result<(), DriverError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let Some(listener) = &self.listener else {
            return Ok(());
        };
        match listener.accept() {
            Ok((stream, addr)) => {
                info!("Framed driver accepted peer: {}", addr);
                self.connection = Some(FramedConnection::new(ByteStream::tcp(stream)?, self.max_message_size));
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn receive(&mut self, tx: Transmission) -> Result<(), DriverError> {
        debug!(
            "Received {:?} transmission: src={} dest={} frames={}",
            tx.kind,
            tx.src,
            tx.dest,
            tx.frames.len()
        );
        if let Some(ack) = self.core.auto_ack(&tx) {
            self.send(ack)?;
        }
        self.core.emit(DriverEvent::Receive(tx));
        Ok(())
    }

    /// Prepare and send a transmission the MAC granted
    pub fn handle_initiate_transmission(
        &mut self,
        tx: Transmission,
        hooks: &mut dyn TransmissionHooks,
    ) -> Result<(), DriverError> {
        if !self.started {
            return Err(DriverError::NotStarted);
        }
        match self.core.prepare(tx, hooks) {
            Some(tx) => self.send(tx),
            None => Ok(()),
        }
    }

    fn send(&mut self, tx: Transmission) -> Result<(), DriverError> {
        let Some(connection) = self.connection.as_mut() else {
            warn!("No peer connected, dropping {:?} transmission to {}", tx.kind, tx.dest);
            return Ok(());
        };
        let payload = encode_transmission(&tx)?;
        let raw = connection.send(&payload)?;

        debug!(
            "Sent {:?} transmission: src={} dest={} frames={} bytes={}",
            tx.kind,
            tx.src,
            tx.dest,
            tx.frames.len(),
            raw.len()
        );
        self.core.emit(DriverEvent::RawOutgoing(raw));
        self.core.emit(DriverEvent::TransmitResult(tx));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::pipe;
    use acomms_wire::{ManualClock, TransmissionType, DEFAULT_MAX_MESSAGE_SIZE, MAGIC};
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Payload(Vec<Bytes>);

    impl TransmissionHooks for Payload {
        fn data_request(&mut self, tx: &mut Transmission) {
            tx.frames = self.0.clone();
        }
    }

    fn driver(modem_id: u32, stream: ByteStream) -> (FramedDriver, mpsc::Receiver<DriverEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let core = DriverCore::new(modem_id, true, 1024, Arc::new(ManualClock::new(77)), tx);
        let mut driver = FramedDriver::with_stream(core, stream, DEFAULT_MAX_MESSAGE_SIZE);
        driver.startup().unwrap();
        (driver, rx)
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
    fn test_data_and_auto_ack_over_pipe() {
        let (a, b) = pipe();
        let (mut one, mut one_rx) = driver(1, a);
        let (mut two, mut two_rx) = driver(2, b);

        let mut request = Transmission::data(1, 2);
        request.max_num_frames = 1;
        let mut hooks = Payload(vec![Bytes::from_static(&[MAGIC, 0x7D, 1])]);
        one.handle_initiate_transmission(request, &mut hooks).unwrap();

        let mut sent = Vec::new();
        while let Ok(event) = one_rx.try_recv() {
            sent.push(event);
        }
        assert!(matches!(sent[0], DriverEvent::RawOutgoing(_)));
        assert!(matches!(sent[1], DriverEvent::TransmitResult(_)));

        two.do_work().unwrap();
        let got = received(&mut two_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].frames[0].as_ref(), &[MAGIC, 0x7D, 1]);
        assert_eq!(got[0].time, 77);
        assert!(!got[0].ack_requested);

        one.do_work().unwrap();
        assert!(received(&mut one_rx).is_empty());
    }

    #[test]
    fn test_ack_requested_is_answered() {
        let (a, b) = pipe();
        let (mut one, mut one_rx) = driver(1, a);
        let (mut two, _two_rx) = driver(2, b);

        struct AckedPayload;
        impl TransmissionHooks for AckedPayload {
            fn data_request(&mut self, tx: &mut Transmission) {
                tx.ack_requested = true;
                tx.frames = vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")];
            }
        }

        let mut request = Transmission::data(1, 2);
        request.max_num_frames = 2;
        one.handle_initiate_transmission(request, &mut AckedPayload).unwrap();
        two.do_work().unwrap();
        one.do_work().unwrap();

        let got = received(&mut one_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, TransmissionType::Ack);
        assert_eq!((got[0].src, got[0].dest), (2, 1));
        assert_eq!(got[0].acked_frames, vec![0, 1]);
    }

    #[test]
    fn test_undecodable_transmission_does_not_stop_stream() {
        let (a, b) = pipe();
        let (mut two, mut two_rx) = driver(2, b);
        let mut raw = FramedConnection::new(a, DEFAULT_MAX_MESSAGE_SIZE);

        raw.send(&[0xFF, 0x00, 0x13]).unwrap();
        raw.send(&encode_transmission(&Transmission::data(1, 2)).unwrap()).unwrap();

        two.do_work().unwrap();
        assert_eq!(received(&mut two_rx).len(), 1);
    }

    #[test]
    fn test_not_started() {
        let (a, _b) = pipe();
        let (tx, _rx) = mpsc::channel(1);
        let core = DriverCore::new(1, true, 1024, Arc::new(ManualClock::new(0)), tx);
        let mut driver = FramedDriver::with_stream(core, a, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(matches!(driver.do_work(), Err(DriverError::NotStarted)));
    }

    #[test]
    fn test_tcp_server_accepts_client() {
        let (tx, mut rx) = mpsc::channel(16);
        let clock = Arc::new(ManualClock::new(0));
        let core = DriverCore::new(2, true, 1024, clock.clone(), tx);
        let mut server = FramedDriver::new(
            core,
            StreamEndpoint::TcpServer {
                bind: "127.0.0.1:0".to_string(),
            },
            DEFAULT_MAX_MESSAGE_SIZE,
        );
        server.startup().unwrap();
        let addr = server.listen_addr().unwrap();

        let (client_tx, _client_rx) = mpsc::channel(16);
        let core = DriverCore::new(1, true, 1024, clock, client_tx);
        let mut client = FramedDriver::new(
            core,
            StreamEndpoint::TcpClient {
                address: addr.to_string(),
            },
            DEFAULT_MAX_MESSAGE_SIZE,
        );
        client.startup().unwrap();

        let mut hooks = Payload(vec![Bytes::from_static(b"hello")]);
        client
            .handle_initiate_transmission(Transmission::data(1, 2), &mut hooks)
            .unwrap();

        let mut got = Vec::new();
        for _ in 0..200 {
            server.do_work().unwrap();
            got.extend(received(&mut rx));
            if !got.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(server.is_connected());
        assert_eq!(got[0].frames[0].as_ref(), b"hello");
    }
}
