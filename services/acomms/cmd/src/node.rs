//! One acomms node: queue manager, MAC, driver and optional router wired together.
//!
//! Every component is polled from [`Node::tick`]; their events travel over
//! bounded channels that the node drains in a fixed order:
//!
//! ```text
//! mac.do_work ──InitiateTransmission──► driver (queue manager as hooks)
//! driver.do_work ──Receive──► mac (discovery) ──► queue manager
//! queue.do_work ──QueueEvent──► caller
//! ```

use crate::config::NodeConfig;
use crate::{component_debug, component_info, component_warn};
use acomms_driver::{Driver, DriverError, DriverEvent};
use acomms_mac::{MacEvent, MacManager};
use acomms_queue::{CborCodec, DynamicMessage, QueueError, QueueEvent, QueueManager};
use acomms_route::RouteManager;
use acomms_wire::{Clock, ModemId};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

const QUEUE_EVENT_CAPACITY: usize = 1024;
const MAC_EVENT_CAPACITY: usize = 64;
const DRIVER_EVENT_CAPACITY: usize = 1024;

/// A running node
pub struct Node {
    modem_id: ModemId,
    config: NodeConfig,
    queue: QueueManager,
    mac: MacManager,
    driver: Driver,
    router: Option<Arc<RouteManager>>,
    queue_events: mpsc::Receiver<QueueEvent>,
    mac_events: mpsc::Receiver<MacEvent>,
    driver_events: mpsc::Receiver<DriverEvent>,
}

impl Node {
    /// Build every component from `config`
    pub fn new(config: NodeConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let modem_id = config.queue.modem_id;

        let (queue_tx, queue_events) = mpsc::channel(QUEUE_EVENT_CAPACITY);
        let mut queue = QueueManager::new(config.queue.clone(), Arc::new(CborCodec), clock.clone(), queue_tx)?;

        let (mac_tx, mac_events) = mpsc::channel(MAC_EVENT_CAPACITY);
        let mac = MacManager::new(clock.clone(), mac_tx);

        let (driver_tx, driver_events) = mpsc::channel(DRIVER_EVENT_CAPACITY);
        let driver = Driver::new(&config.driver, clock, driver_tx)?;

        let router = config.route.clone().map(|route| {
            let router = Arc::new(RouteManager::new(route));
            router.add_subnet_queue(modem_id, Some(queue.inbound_handle()));
            queue.set_router(router.clone());
            router
        });

        Ok(Self {
            modem_id,
            config,
            queue,
            mac,
            driver,
            router,
            queue_events,
            mac_events,
            driver_events,
        })
    }

    /// Local node id
    pub fn modem_id(&self) -> ModemId {
        self.modem_id
    }

    /// The queue manager
    pub fn queue(&mut self) -> &mut QueueManager {
        &mut self.queue
    }

    /// The MAC
    pub fn mac(&mut self) -> &mut MacManager {
        &mut self.mac
    }

    /// The driver
    pub fn driver(&mut self) -> &mut Driver {
        &mut self.driver
    }

    /// The router, when relaying is configured
    pub fn router(&self) -> Option<&Arc<RouteManager>> {
        self.router.as_ref()
    }

    /// Queue a message for transmission
    pub fn push_message(&mut self, msg: DynamicMessage) -> Result<(), QueueError> {
        self.queue.push_message(msg)
    }

    /// Open the channel and start the MAC cycle
    pub fn startup(&mut self) -> Result<()> {
        self.driver.startup()?;
        self.mac.startup(self.config.mac.clone())?;
        component_info!(
            "node",
            "Node started: modem_id={} driver={} mac={:?}",
            self.modem_id,
            self.driver.kind(),
            self.config.mac.mode
        );
        Ok(())
    }

    /// Stop the MAC and release the channel
    pub fn shutdown(&mut self) {
        self.mac.shutdown();
        self.driver.shutdown();
        component_info!("node", "Node stopped: modem_id={}", self.modem_id);
    }

    /// One pass over every component. Returns the queue events raised.
    ///
    /// Only fatal driver errors are returned; the rest are logged.
    pub fn tick(&mut self) -> Result<Vec<QueueEvent>, DriverError> {
        self.mac.do_work();
        while let Ok(event) = self.mac_events.try_recv() {
            match event {
                MacEvent::InitiateTransmission(tx) => {
                    let result = self.driver.handle_initiate_transmission(tx, &mut self.queue);
                    self.check(result)?;
                }
                MacEvent::SlotStart(tx) => trace!("Slot start: src={} dest={}", tx.src, tx.dest),
            }
        }

        let result = self.driver.do_work();
        self.check(result)?;
        while let Ok(event) = self.driver_events.try_recv() {
            match event {
                DriverEvent::Receive(tx) => {
                    self.mac.handle_modem_all_incoming(&tx);
                    self.queue.handle_modem_receive(tx);
                }
                DriverEvent::TransmitResult(tx) => component_debug!(
                    "driver",
                    "Transmitted {:?}: src={} dest={} frames={}",
                    tx.kind,
                    tx.src,
                    tx.dest,
                    tx.frames.len()
                ),
                DriverEvent::RawIncoming(raw) => trace!("Raw incoming: {} bytes", raw.len()),
                DriverEvent::RawOutgoing(raw) => trace!("Raw outgoing: {} bytes", raw.len()),
            }
        }

        while let Some(ack) = self.queue.pop_outbound_ack() {
            let result = self.driver.handle_initiate_transmission(ack, &mut self.queue);
            self.check(result)?;
        }

        self.queue.do_work();
        let mut events = Vec::new();
        while let Ok(event) = self.queue_events.try_recv() {
            events.push(event);
        }
        Ok(events)
    }

    fn check(&self, result: Result<(), DriverError>) -> Result<(), DriverError> {
        match result {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                component_warn!("driver", "Driver error on modem_id={}: {}", self.modem_id, e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}

/// Log a queue event
pub fn log_queue_event(event: &QueueEvent) {
    match event {
        QueueEvent::Receive { message } => {
            component_info!("queue", "Received message type={}: {}", message.type_id, message.body)
        }
        QueueEvent::Ack { ack, original } => component_info!(
            "queue",
            "Message type={} acknowledged by {}",
            original.type_id,
            ack.src
        ),
        QueueEvent::QueueSize { type_id, size } => {
            component_debug!("queue", "Queue size: type={} size={}", type_id, size)
        }
        QueueEvent::Expire { message } => {
            component_warn!("queue", "Message type={} expired: {}", message.type_id, message.body)
        }
    }
}
