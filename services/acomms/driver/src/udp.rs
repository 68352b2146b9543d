//! Datagram transport: one CBOR transmission per UDP packet.

use crate::common::{DriverCore, DriverEvent};
use crate::config::{resolve, UdpPeer};
use crate::error::DriverError;
use acomms_wire::{
    decode_transmission, encode_datagram, ModemId, Transmission, TransmissionHooks, BROADCAST_ID,
    UDP_MAX_PACKET_SIZE,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use tracing::{debug, info, warn};

/// Driver for UDP datagrams
pub struct UdpDriver {
    core: DriverCore,
    bind: String,
    configured_peers: Vec<UdpPeer>,
    peers: HashMap<ModemId, SocketAddr>,
    socket: Option<UdpSocket>,
    receive_buffer: Vec<u8>,
}

impl UdpDriver {
    /// Create a driver that binds `bind` on startup
    pub fn new(core: DriverCore, bind: String, peers: Vec<UdpPeer>) -> Self {
        Self {
            core,
            bind,
            configured_peers: peers,
            peers: HashMap::new(),
            socket: None,
            receive_buffer: vec![0u8; UDP_MAX_PACKET_SIZE],
        }
    }

    /// Local node id
    pub fn modem_id(&self) -> ModemId {
        self.core.modem_id()
    }

    /// Bound address, once started
    pub fn local_addr(&self) -> Result<SocketAddr, DriverError> {
        let socket = self.socket.as_ref().ok_or(DriverError::NotStarted)?;
        Ok(socket.local_addr()?)
    }

    /// Route datagrams for `modem_id` to `addr`
    pub fn add_peer(&mut self, modem_id: ModemId, addr: SocketAddr) {
        if let Some(previous) = self.peers.insert(modem_id, addr) {
            debug!("Replaced UDP peer: modem_id={} old={} new={}", modem_id, previous, addr);
        }
    }

    /// Bind the socket and resolve peers
    pub fn startup(&mut self) -> Result<(), DriverError> {
        let socket = UdpSocket::bind(resolve(&self.bind)?)?;
        socket.set_nonblocking(true)?;
        for peer in &self.configured_peers {
            self.peers.insert(peer.modem_id, resolve(&peer.address)?);
        }
        info!(
            "UDP driver bound: modem_id={} addr={} peers={}",
            self.core.modem_id(),
            socket.local_addr()?,
            self.peers.len()
        );
        self.socket = Some(socket);
        Ok(())
    }

    /// Close the socket
    pub fn shutdown(&mut self) {
        self.socket = None;
        debug!("UDP driver stopped: modem_id={}", self.core.modem_id());
    }

    /// Read every datagram currently queued on the socket
    pub fn do_work(&mut self) -> Result<(), DriverError> {
        loop {
            let socket = self.socket.as_ref().ok_or(DriverError::NotStarted)?;
            let (len, from) = match socket.recv_from(&mut self.receive_buffer) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // ICMP port unreachable from an earlier send surfaces here on some platforms
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    warn!("UDP receive error: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let raw = Bytes::copy_from_slice(&self.receive_buffer[..len]);
            debug!("Received {} bytes from {}", len, from);
            self.core.emit(DriverEvent::RawIncoming(raw.clone()));

            match decode_transmission(&raw) {
                Ok(tx) => self.receive(tx)?,
                Err(e) => warn!("Discarding datagram from {}: {}", from, e),
            }
        }
    }

    fn receive(&mut self, tx: Transmission) -> Result<(), DriverError> {
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
        if self.socket.is_none() {
            return Err(DriverError::NotStarted);
        }
        match self.core.prepare(tx, hooks) {
            Some(tx) => self.send(tx),
            None => Ok(()),
        }
    }

    fn destinations(&self, dest: ModemId) -> Vec<SocketAddr> {
        match self.peers.get(&dest) {
            Some(addr) if dest != BROADCAST_ID => vec![*addr],
            _ => self
                .peers
                .iter()
                .filter(|(id, _)| **id != self.core.modem_id())
                .map(|(_, addr)| *addr)
                .collect(),
        }
    }

    fn send(&mut self, tx: Transmission) -> Result<(), DriverError> {
        let socket = self.socket.as_ref().ok_or(DriverError::NotStarted)?;
        let datagram = encode_datagram(&tx)?;

        let destinations = self.destinations(tx.dest);
        if destinations.is_empty() {
            warn!("No UDP peer for dest={}, dropping {:?} transmission", tx.dest, tx.kind);
            return Ok(());
        }
        for addr in destinations {
            match socket.send_to(&datagram, addr) {
                Ok(sent) => debug!("Sent {} bytes to {}", sent, addr),
                Err(e) => warn!("Send error to {}: {}", addr, e),
            }
        }

        self.core.emit(DriverEvent::RawOutgoing(datagram));
        self.core.emit(DriverEvent::TransmitResult(tx));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TRANSMISSION_OVERHEAD;
    use acomms_wire::{ManualClock, TransmissionType};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Payload(Vec<Bytes>, bool);

    impl TransmissionHooks for Payload {
        fn data_request(&mut self, tx: &mut Transmission) {
            tx.ack_requested = self.1;
            tx.frames = self.0.clone();
        }
    }

    fn driver(modem_id: ModemId) -> (UdpDriver, mpsc::Receiver<DriverEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let core = DriverCore::new(
            modem_id,
            true,
            UDP_MAX_PACKET_SIZE - TRANSMISSION_OVERHEAD,
            Arc::new(ManualClock::new(0)),
            tx,
        );
        let mut driver = UdpDriver::new(core, "127.0.0.1:0".to_string(), Vec::new());
        driver.startup().unwrap();
        (driver, rx)
    }

    fn pair() -> ((UdpDriver, mpsc::Receiver<DriverEvent>), (UdpDriver, mpsc::Receiver<DriverEvent>)) {
        let (mut one, one_rx) = driver(1);
        let (mut two, two_rx) = driver(2);
        let one_addr = one.local_addr().unwrap();
        let two_addr = two.local_addr().unwrap();
        one.add_peer(2, two_addr);
        two.add_peer(1, one_addr);
        ((one, one_rx), (two, two_rx))
    }

    fn wait_for_receive(driver: &mut UdpDriver, rx: &mut mpsc::Receiver<DriverEvent>) -> Transmission {
        for _ in 0..200 {
            driver.do_work().unwrap();
            while let Ok(event) = rx.try_recv() {
                if let DriverEvent::Receive(tx) = event {
                    return tx;
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("no transmission received");
    }

    #[test]
    fn test_datagram_round_trip_with_auto_ack() {
        let ((mut one, mut one_rx), (mut two, mut two_rx)) = pair();

        let mut hooks = Payload(vec![Bytes::from_static(b"ping")], true);
        one.handle_initiate_transmission(Transmission::data(1, 2), &mut hooks)
            .unwrap();

        let got = wait_for_receive(&mut two, &mut two_rx);
        assert_eq!(got.frames[0].as_ref(), b"ping");
        assert_eq!(got.max_frame_bytes as usize, UDP_MAX_PACKET_SIZE - TRANSMISSION_OVERHEAD);

        let ack = wait_for_receive(&mut one, &mut one_rx);
        assert_eq!(ack.kind, TransmissionType::Ack);
        assert_eq!(ack.acked_frames, vec![0]);
    }

    #[test]
    fn test_broadcast_reaches_all_peers() {
        let ((mut one, _one_rx), (mut two, mut two_rx)) = pair();
        let (mut three, mut three_rx) = driver(3);
        one.add_peer(3, three.local_addr().unwrap());

        let mut hooks = Payload(vec![Bytes::from_static(b"all")], false);
        one.handle_initiate_transmission(Transmission::data(1, BROADCAST_ID), &mut hooks)
            .unwrap();

        assert_eq!(wait_for_receive(&mut two, &mut two_rx).dest, BROADCAST_ID);
        assert_eq!(wait_for_receive(&mut three, &mut three_rx).dest, BROADCAST_ID);
    }

    #[test]
    fn test_garbage_datagram_ignored() {
        let (mut two, mut two_rx) = driver(2);
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[0xFF, 0x01], two.local_addr().unwrap()).unwrap();
        sender
            .send_to(
                &encode_datagram(&Transmission::data(1, 2)).unwrap(),
                two.local_addr().unwrap(),
            )
            .unwrap();

        assert_eq!(wait_for_receive(&mut two, &mut two_rx).src, 1);
    }

    #[test]
    fn test_not_started() {
        let (tx, _rx) = mpsc::channel(1);
        let core = DriverCore::new(1, true, 100, Arc::new(ManualClock::new(0)), tx);
        let mut driver = UdpDriver::new(core, "127.0.0.1:0".to_string(), Vec::new());
        assert!(matches!(driver.do_work(), Err(DriverError::NotStarted)));
        assert!(driver.local_addr().is_err());
    }
}
