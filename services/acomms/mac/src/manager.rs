//! The MAC manager: wall-clock aligned TDMA cycling.

use crate::config::{MacConfig, MacMode};
use crate::error::MacError;
use crate::schedule::{Schedule, ScheduleChangeSet, Slot};
use acomms_wire::{
    seconds_to_micros, Clock, ModemId, Timestamp, Transmission, TransmissionType, BROADCAST_ID,
    QUERY_DESTINATION_ID, QUERY_SOURCE_ID,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Modulus used to rotate the blank slot in discovery mode
const BLANK_ENTROPY: u64 = 5;

/// Events raised by the MAC manager
#[derive(Debug, Clone, PartialEq)]
pub enum MacEvent {
    /// This node owns the slot that just began
    InitiateTransmission(Transmission),
    /// A slot began, whoever owns it
    SlotStart(Transmission),
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacState {
    /// No schedule running
    Idle,
    /// Cycling through the schedule
    Cycling,
}

/// TDMA scheduler
pub struct MacManager {
    config: MacConfig,
    clock: Arc<dyn Clock>,
    events: mpsc::Sender<MacEvent>,
    state: MacState,
    schedule: Schedule,
    current_slot: usize,
    next_slot_time: Option<Timestamp>,
    cycle_number: u64,
    /// Discovery mode peer table: id -> last heard
    peers: BTreeMap<ModemId, Timestamp>,
}

impl MacManager {
    /// Create an idle scheduler
    pub fn new(clock: Arc<dyn Clock>, events: mpsc::Sender<MacEvent>) -> Self {
        Self {
            config: MacConfig::default(),
            clock,
            events,
            state: MacState::Idle,
            schedule: Schedule::empty(),
            current_slot: 0,
            next_slot_time: None,
            cycle_number: 0,
            peers: BTreeMap::new(),
        }
    }

    /// Begin cycling with `config`.
    ///
    /// In fixed and polled modes the configured slots are appended to any
    /// installed with [`MacManager::update`] beforehand.
    pub fn startup(&mut self, config: MacConfig) -> Result<(), MacError> {
        if self.state == MacState::Cycling {
            warn!("MAC startup requested while already cycling");
            return Ok(());
        }
        config.validate()?;
        let now = self.clock.now();

        match config.mode {
            MacMode::Discovery => {
                info!("Using decentralized TDMA with peer discovery: modem_id={}", config.modem_id);
                self.peers.clear();
                self.peers.insert(config.modem_id, now);
            }
            MacMode::Fixed | MacMode::Polled => {
                info!(
                    "Using {} TDMA: modem_id={} slots={}",
                    if config.mode == MacMode::Polled { "polled" } else { "fixed" },
                    config.modem_id,
                    self.schedule.len() + config.slots.len()
                );
                let mut changes = self.schedule.change_set();
                for slot in &config.slots {
                    changes = changes.push(slot.clone());
                }
                self.schedule = changes.commit()?;
            }
        }

        self.config = config;
        self.state = MacState::Cycling;
        self.align(now);
        Ok(())
    }

    /// Stop cycling and forget the schedule
    pub fn shutdown(&mut self) {
        self.state = MacState::Idle;
        self.schedule = Schedule::empty();
        self.peers.clear();
        self.current_slot = 0;
        self.next_slot_time = None;
        info!("MAC shut down");
    }

    /// Install a new schedule. Only valid outside discovery mode.
    pub fn update(&mut self, changes: ScheduleChangeSet) -> Result<(), MacError> {
        if self.state == MacState::Cycling && self.config.mode == MacMode::Discovery {
            return Err(MacError::Configuration(
                "the schedule is managed by discovery".to_string(),
            ));
        }

        self.schedule = changes.commit()?;
        debug!("Installed schedule with {} slots", self.schedule.len());
        if self.state == MacState::Cycling {
            self.align(self.clock.now());
        }
        Ok(())
    }

    /// Start staging changes from the active schedule
    pub fn change_set(&self) -> ScheduleChangeSet {
        self.schedule.change_set()
    }

    /// The active schedule
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Scheduler state
    pub fn state(&self) -> MacState {
        self.state
    }

    /// Index, counted from the reference time, of the cycle the next slot belongs to
    pub fn cycle_count(&self) -> u64 {
        self.cycle_number
    }

    /// Cycle length in seconds
    pub fn cycle_duration(&self) -> f64 {
        self.schedule.cycle_micros() as f64 / 1e6
    }

    /// Start time of the next slot
    pub fn next_slot_time(&self) -> Option<Timestamp> {
        self.next_slot_time
    }

    /// Index of the next slot within the cycle
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    fn emit(&self, event: MacEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropping MAC event: {}", e);
        }
    }

    /// Fire the slot that has begun, if any
    pub fn do_work(&mut self) {
        if self.state != MacState::Cycling {
            return;
        }
        let Some(next) = self.next_slot_time else {
            return;
        };

        let now = self.clock.now();
        if now < next {
            return;
        }

        let late = now - next;
        if late > seconds_to_micros(self.config.allowed_skew_seconds) {
            warn!(
                "Slot start missed by {:.3}s (allowed {}s), realigning",
                late as f64 / 1e6,
                self.config.allowed_skew_seconds
            );
            self.align(now);
            return;
        }

        self.begin_slot(now);
        self.increment_slot();
        if self.config.mode == MacMode::Discovery {
            self.expire_ids(now);
        }
    }

    /// Note a transmission heard on the channel, whoever it was addressed to
    pub fn handle_modem_all_incoming(&mut self, tx: &Transmission) {
        if self.config.mode != MacMode::Discovery || self.state != MacState::Cycling {
            return;
        }
        let id = tx.src;
        if id == BROADCAST_ID || id == QUERY_SOURCE_ID {
            return;
        }

        let now = self.clock.now();
        if self.peers.insert(id, now).is_none() {
            info!("Discovered modem {}", id);
            self.align(now);
        }
    }

    fn begin_slot(&mut self, now: Timestamp) {
        let Some(slot) = self.schedule.get(self.current_slot) else {
            return;
        };

        let transmitting = match self.config.mode {
            MacMode::Fixed => slot.src == self.config.modem_id || slot.always_initiate,
            MacMode::Discovery => slot.src == self.config.modem_id,
            MacMode::Polled => slot.src != BROADCAST_ID,
        };

        let tx = slot.to_transmission(now);
        debug!(
            "Starting slot {}/{}: src={} dest={} cycle={} transmitting={}",
            self.current_slot + 1,
            self.schedule.len(),
            slot.src,
            slot.dest,
            self.cycle_number,
            transmitting
        );

        self.emit(MacEvent::SlotStart(tx.clone()));
        if transmitting {
            self.emit(MacEvent::InitiateTransmission(tx));
        }
    }

    fn increment_slot(&mut self) {
        let length = self.schedule.get(self.current_slot).map(Slot::micros).unwrap_or(0);
        if let Some(next) = self.next_slot_time.as_mut() {
            *next += length;
        }

        self.current_slot += 1;
        if self.current_slot >= self.schedule.len() {
            self.current_slot = 0;
            self.cycle_number += 1;
            if self.config.mode == MacMode::Discovery {
                self.position_blank();
            }
        }
    }

    /// Restart at the next wall-clock aligned cycle boundary
    fn align(&mut self, now: Timestamp) {
        self.current_slot = 0;

        if self.config.mode == MacMode::Discovery {
            // cycle length does not depend on slot order
            self.rebuild_discovery_schedule(0);
        }

        let cycle = self.schedule.cycle_micros();
        if cycle == 0 {
            self.next_slot_time = None;
            debug!("Schedule is empty, nothing to cycle");
            return;
        }

        let reference = self.config.reference.at(now);
        if now < reference {
            self.cycle_number = 0;
            self.next_slot_time = Some(reference);
        } else {
            self.cycle_number = (now - reference) / cycle + 1;
            self.next_slot_time = Some(reference + self.cycle_number * cycle);
        }

        if self.config.mode == MacMode::Discovery {
            self.position_blank();
        }

        if self.config.start_cycle_in_middle
            && self.config.mode == MacMode::Fixed
            && self.schedule.len() > 1
            && self.cycle_number > 0
        {
            self.cycle_number -= 1;
            if let Some(next) = self.next_slot_time.as_mut() {
                *next -= cycle;
            }
            while self.next_slot_time.map_or(false, |next| next < now) {
                self.increment_slot();
            }
        }

        info!(
            "Next TDMA slot {} begins at {:.3} (cycle {}, {:.1}s long)",
            self.current_slot,
            self.next_slot_time.unwrap_or_default() as f64 / 1e6,
            self.cycle_number,
            cycle as f64 / 1e6
        );
    }

    fn expire_ids(&mut self, now: Timestamp) {
        let expire_cycles = self.config.expire_cycles;
        let window = self.schedule.cycle_micros() * expire_cycles as u64;
        let local = self.config.modem_id;
        let before = self.peers.len();

        self.peers.retain(|id, last_heard| {
            let keep = *id == local || last_heard.saturating_add(window) >= now;
            if !keep {
                info!("Removed modem {} after {} silent cycles", id, expire_cycles);
            }
            keep
        });

        if self.peers.len() != before {
            self.align(now);
        }
    }

    fn position_blank(&mut self) {
        let count = self.peers.len() as u64 + 1;
        let sum: u64 = self.peers.keys().map(|id| *id as u64).sum();
        let shift = u64::from(self.cycle_number % BLANK_ENTROPY == sum % BLANK_ENTROPY);
        let blank_pos = (count - shift - 1) as usize;
        debug!("Blank slot goes in position {}", blank_pos);
        self.rebuild_discovery_schedule(blank_pos);
    }

    fn rebuild_discovery_schedule(&mut self, blank_pos: usize) {
        let slot = |src: ModemId| Slot {
            src,
            dest: QUERY_DESTINATION_ID,
            kind: TransmissionType::Data,
            rate: self.config.rate,
            slot_seconds: self.config.slot_seconds,
            always_initiate: false,
        };

        let mut slots: Vec<Slot> = self.peers.keys().map(|id| slot(*id)).collect();
        slots.insert(blank_pos.min(slots.len()), slot(BROADCAST_ID));

        match slots.into_iter().collect::<ScheduleChangeSet>().commit() {
            Ok(schedule) => self.schedule = schedule,
            Err(e) => warn!("Discovery schedule rejected: {}", e),
        }
    }
}
