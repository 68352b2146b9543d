//! The closed set of transports behind one interface.

use crate::common::{DriverCore, DriverEvent};
use crate::config::{DriverConfig, TransportConfig};
use crate::error::DriverError;
use crate::framed::FramedDriver;
use crate::store::StoreDriver;
use crate::udp::UdpDriver;
use acomms_wire::{Clock, ModemId, Transmission, TransmissionHooks};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A transport driver
pub enum Driver {
    /// Byte-stuffed messages over a byte stream
    Framed(FramedDriver),
    /// UDP datagrams
    Udp(UdpDriver),
    /// Request/reply exchange with a store server
    Store(StoreDriver),
}

impl Driver {
    /// Build the driver a configuration selects
    pub fn new(
        config: &DriverConfig,
        clock: Arc<dyn Clock>,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<Self, DriverError> {
        config.validate()?;
        let core = DriverCore::new(
            config.modem_id,
            config.auto_ack,
            config.transport.payload_budget(),
            clock,
            events,
        );

        Ok(match &config.transport {
            TransportConfig::Framed {
                endpoint,
                max_message_size,
            } => Driver::Framed(FramedDriver::new(core, endpoint.clone(), *max_message_size)),
            TransportConfig::Udp { bind, peers } => {
                Driver::Udp(UdpDriver::new(core, bind.clone(), peers.clone()))
            }
            TransportConfig::Store {
                server,
                query_interval_seconds,
                request_timeout_seconds,
            } => Driver::Store(StoreDriver::new(
                core,
                server.clone(),
                *query_interval_seconds,
                *request_timeout_seconds,
            )),
        })
    }

    /// Local node id
    pub fn modem_id(&self) -> ModemId {
        match self {
            Driver::Framed(driver) => driver.modem_id(),
            Driver::Udp(driver) => driver.modem_id(),
            Driver::Store(driver) => driver.modem_id(),
        }
    }

    /// Transport name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Driver::Framed(_) => "framed",
            Driver::Udp(_) => "udp",
            Driver::Store(_) => "store",
        }
    }

    /// Acquire the channel. Failure is fatal.
    pub fn startup(&mut self) -> Result<(), DriverError> {
        match self {
            Driver::Framed(driver) => driver.startup(),
            Driver::Udp(driver) => driver.startup(),
            Driver::Store(driver) => driver.startup(),
        }
    }

    /// Release the channel
    pub fn shutdown(&mut self) {
        match self {
            Driver::Framed(driver) => driver.shutdown(),
            Driver::Udp(driver) => driver.shutdown(),
            Driver::Store(driver) => driver.shutdown(),
        }
    }

    /// One nonblocking pass of pending I/O
    pub fn do_work(&mut self) -> Result<(), DriverError> {
        match self {
            Driver::Framed(driver) => driver.do_work(),
            Driver::Udp(driver) => driver.do_work(),
            Driver::Store(driver) => driver.do_work(),
        }
    }

    /// Send a transmission the MAC granted, asking `hooks` for payload first
    pub fn handle_initiate_transmission(
        &mut self,
        tx: Transmission,
        hooks: &mut dyn TransmissionHooks,
    ) -> Result<(), DriverError> {
        match self {
            Driver::Framed(driver) => driver.handle_initiate_transmission(tx, hooks),
            Driver::Udp(driver) => driver.handle_initiate_transmission(tx, hooks),
            Driver::Store(driver) => driver.handle_initiate_transmission(tx, hooks),
        }
    }
}
