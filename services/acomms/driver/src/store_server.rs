//! Shore-side server holding per-modem inboxes for [`StoreDriver`](crate::StoreDriver) clients.

use crate::config::{resolve, STORE_MAX_MESSAGE_SIZE};
use crate::error::DriverError;
use crate::store::{from_cbor, to_cbor, StoreRequest, StoreResponse};
use crate::stream::{ByteStream, FramedConnection};
use acomms_wire::{ModemId, Transmission, BROADCAST_ID};
use dashmap::DashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Request/reply store server
pub struct StoreServer {
    listener: TcpListener,
    clients: Vec<FramedConnection>,
    inboxes: Arc<DashMap<ModemId, Vec<Transmission>>>,
}

impl StoreServer {
    /// Listen on `address`
    pub fn bind(address: &str) -> Result<Self, DriverError> {
        let listener = TcpListener::bind(resolve(address)?)?;
        listener.set_nonblocking(true)?;
        info!("Store server listening: addr={}", listener.local_addr()?);
        Ok(Self {
            listener,
            clients: Vec::new(),
            inboxes: Arc::new(DashMap::new()),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> Result<SocketAddr, DriverError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared view of the inboxes
    pub fn inboxes(&self) -> Arc<DashMap<ModemId, Vec<Transmission>>> {
        Arc::clone(&self.inboxes)
    }

    /// Connected clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Accept new clients and answer every complete request
    pub fn do_work(&mut self) -> Result<(), DriverError> {
        self.accept()?;

        let mut index = 0;
        while index < self.clients.len() {
            match self.serve(index) {
                Ok(()) => index += 1,
                Err(e) => {
                    let client = self.clients.swap_remove(index);
                    debug!("Dropping store client {}: {}", client.peer(), e);
                }
            }
        }
        Ok(())
    }

    fn accept(&mut self) -> Result<(), DriverError> {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!("Store client connected: {}", addr);
                    self.clients
                        .push(FramedConnection::new(ByteStream::tcp(stream)?, STORE_MAX_MESSAGE_SIZE));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn serve(&mut self, index: usize) -> Result<(), DriverError> {
        let client = &mut self.clients[index];
        client.flush()?;
        client.fill()?;

        while let Some(payload) = client.next_message() {
            let request: StoreRequest = match from_cbor(&payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Discarding store request from {}: {}", client.peer(), e);
                    continue;
                }
            };
            let response = handle_request(&self.inboxes, request);
            client.send(&to_cbor(&response)?)?;
        }
        Ok(())
    }

    /// File a request's outbox and collect the requester's inbox
    pub fn handle_request(&self, request: StoreRequest) -> StoreResponse {
        handle_request(&self.inboxes, request)
    }
}

fn handle_request(
    inboxes: &DashMap<ModemId, Vec<Transmission>>,
    request: StoreRequest,
) -> StoreResponse {
    let requester = request.modem_id;
    inboxes.entry(requester).or_default();

    for tx in request.outbox {
        if tx.dest == BROADCAST_ID {
            for mut inbox in inboxes.iter_mut().filter(|entry| *entry.key() != requester) {
                inbox.value_mut().push(tx.clone());
            }
        } else {
            inboxes.entry(tx.dest).or_default().push(tx);
        }
    }

    let inbox = inboxes
        .get_mut(&requester)
        .map(|mut inbox| std::mem::take(inbox.value_mut()))
        .unwrap_or_default();
    if !inbox.is_empty() {
        debug!("Delivering store inbox: modem_id={} count={}", requester, inbox.len());
    }
    StoreResponse { inbox }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(modem_id: ModemId, outbox: Vec<Transmission>) -> StoreRequest {
        StoreRequest { modem_id, outbox }
    }

    #[test]
    fn test_directed_transmission_waits_for_destination() {
        let server = StoreServer::bind("127.0.0.1:0").unwrap();

        let response = server.handle_request(request(1, vec![Transmission::data(1, 2)]));
        assert!(response.inbox.is_empty());
        assert_eq!(server.inboxes().get(&2).unwrap().len(), 1);

        let response = server.handle_request(request(2, Vec::new()));
        assert_eq!(response.inbox, vec![Transmission::data(1, 2)]);
        assert!(server.handle_request(request(2, Vec::new())).inbox.is_empty());
    }

    #[test]
    fn test_broadcast_copies_to_known_modems() {
        let server = StoreServer::bind("127.0.0.1:0").unwrap();
        for id in [1, 2, 3] {
            server.handle_request(request(id, Vec::new()));
        }

        server.handle_request(request(1, vec![Transmission::data(1, BROADCAST_ID)]));

        assert!(server.handle_request(request(1, Vec::new())).inbox.is_empty());
        assert_eq!(server.handle_request(request(2, Vec::new())).inbox.len(), 1);
        assert_eq!(server.handle_request(request(3, Vec::new())).inbox.len(), 1);
    }

    #[test]
    fn test_disconnected_client_dropped() {
        let mut server = StoreServer::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();

        for _ in 0..200 {
            server.do_work().unwrap();
            if server.client_count() == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(server.client_count(), 1);

        drop(client);
        for _ in 0..200 {
            server.do_work().unwrap();
            if server.client_count() == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(server.client_count(), 0);
    }
}
