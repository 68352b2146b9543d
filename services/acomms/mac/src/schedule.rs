//! Slots and the immutable cycle schedule.
//!
//! A [`Schedule`] is never edited in place. Changes are staged on a
//! [`ScheduleChangeSet`] and only become visible once [`ScheduleChangeSet::commit`]
//! has validated them and produced a new schedule.

use crate::error::MacError;
use acomms_wire::{
    seconds_to_micros, ModemId, Timestamp, Transmission, TransmissionType, BROADCAST_ID,
    QUERY_DESTINATION_ID,
};
use serde::{Deserialize, Serialize};

/// A reserved window in the TDMA cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Slot {
    /// Node allowed to transmit
    pub src: ModemId,
    /// Destination, or the query sentinel to let the queue manager decide
    pub dest: ModemId,
    /// What the slot is used for
    pub kind: TransmissionType,
    /// Modem rate index
    pub rate: u32,
    /// Slot length
    pub slot_seconds: f64,
    /// Initiate in fixed mode even when the slot belongs to another node
    pub always_initiate: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            src: BROADCAST_ID,
            dest: QUERY_DESTINATION_ID,
            kind: TransmissionType::Data,
            rate: 0,
            slot_seconds: 10.0,
            always_initiate: false,
        }
    }
}

impl Slot {
    /// DATA slot for `src`
    pub fn data(src: ModemId, slot_seconds: f64) -> Self {
        Self {
            src,
            slot_seconds,
            ..Self::default()
        }
    }

    /// Slot length in microseconds
    pub fn micros(&self) -> u64 {
        seconds_to_micros(self.slot_seconds)
    }

    /// Check the slot can be scheduled
    pub fn validate(&self) -> Result<(), MacError> {
        if !(self.slot_seconds.is_finite() && self.slot_seconds > 0.0) || self.micros() == 0 {
            return Err(MacError::InvalidSlot(format!(
                "slot for {} has non-positive length {}",
                self.src, self.slot_seconds
            )));
        }
        Ok(())
    }

    /// Transmission template for the start of this slot
    pub fn to_transmission(&self, time: Timestamp) -> Transmission {
        Transmission {
            src: self.src,
            dest: self.dest,
            time,
            kind: self.kind,
            rate: self.rate,
            ..Transmission::default()
        }
    }
}

/// An ordered, validated list of slots making up one cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    slots: Vec<Slot>,
}

impl Schedule {
    /// Empty schedule
    pub fn empty() -> Self {
        Self::default()
    }

    /// Slots in cycle order
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Slot at `index`
    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Number of slots per cycle
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the schedule has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Cycle length in microseconds
    pub fn cycle_micros(&self) -> u64 {
        self.slots.iter().map(Slot::micros).sum()
    }

    /// Start staging changes from this schedule
    pub fn change_set(&self) -> ScheduleChangeSet {
        ScheduleChangeSet {
            slots: self.slots.clone(),
        }
    }
}

/// Staged edits to a schedule
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleChangeSet {
    slots: Vec<Slot>,
}

impl ScheduleChangeSet {
    /// Empty change set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a slot
    pub fn push(mut self, slot: Slot) -> Self {
        self.slots.push(slot);
        self
    }

    /// Remove the first slot equal to `slot`
    pub fn remove(mut self, slot: &Slot) -> Self {
        if let Some(index) = self.slots.iter().position(|s| s == slot) {
            self.slots.remove(index);
        }
        self
    }

    /// Remove every slot
    pub fn clear(mut self) -> Self {
        self.slots.clear();
        self
    }

    /// Keep only slots matching `keep`
    pub fn retain(mut self, keep: impl FnMut(&Slot) -> bool) -> Self {
        self.slots.retain(keep);
        self
    }

    /// Validate the staged slots and produce a schedule
    pub fn commit(self) -> Result<Schedule, MacError> {
        for slot in &self.slots {
            slot.validate()?;
        }
        Ok(Schedule { slots: self.slots })
    }
}

impl FromIterator<Slot> for ScheduleChangeSet {
    fn from_iter<T: IntoIterator<Item = Slot>>(iter: T) -> Self {
        Self {
            slots: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_validates() {
        let bad = ScheduleChangeSet::new().push(Slot::data(1, 0.0)).commit();
        assert!(matches!(bad, Err(MacError::InvalidSlot(_))));
        let bad = ScheduleChangeSet::new().push(Slot::data(1, f64::NAN)).commit();
        assert!(bad.is_err());
    }

    #[test]
    fn test_change_set_leaves_schedule_untouched() {
        let schedule = ScheduleChangeSet::new()
            .push(Slot::data(1, 10.0))
            .push(Slot::data(3, 5.0))
            .commit()
            .unwrap();
        assert_eq!(schedule.cycle_micros(), 15_000_000);

        let staged = schedule.change_set().remove(&Slot::data(1, 10.0)).push(Slot::data(1, 10.0));
        assert_eq!(schedule.slots()[0].src, 1);

        let updated = staged.commit().unwrap();
        let order: Vec<ModemId> = updated.slots().iter().map(|s| s.src).collect();
        assert_eq!(order, vec![3, 1]);
    }

    #[test]
    fn test_retain_and_clear() {
        let staged: ScheduleChangeSet = (1..=4).map(|id| Slot::data(id, 1.0)).collect();
        let schedule = staged.clone().retain(|s| s.src % 2 == 0).commit().unwrap();
        assert_eq!(schedule.len(), 2);
        assert!(staged.clear().commit().unwrap().is_empty());
    }

    #[test]
    fn test_slot_transmission() {
        let slot = Slot {
            src: 2,
            dest: 4,
            kind: TransmissionType::Ranging,
            rate: 1,
            ..Slot::default()
        };
        let tx = slot.to_transmission(99);
        assert_eq!((tx.src, tx.dest, tx.kind, tx.rate, tx.time), (2, 4, TransmissionType::Ranging, 1, 99));
    }
}
