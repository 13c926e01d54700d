//! Occupancy table for the bounded resource.
//!
//! Each of the N places is either open or used. [`SlotTable::assign`] hands
//! out the lowest open index; [`SlotTable::free`] gives it back. The table is
//! not synchronized itself: [`AdmissionController`] keeps it behind a mutex
//! and only touches it while holding a resource permit.
//!
//! [`AdmissionController`]: super::controller::AdmissionController

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Open,
    Used,
}

#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::Open; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Marks the lowest open index as used and returns it, or `None` if
    /// every slot is taken.
    pub fn assign(&mut self) -> Option<usize> {
        let index = self.slots.iter().position(|slot| *slot == Slot::Open)?;
        self.slots[index] = Slot::Used;
        Some(index)
    }

    /// Marks `index` open again. Out-of-range indices are ignored.
    pub fn free(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Slot::Open;
        }
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| **slot == Slot::Used).count()
    }

    pub fn is_used(&self, index: usize) -> bool {
        self.slots.get(index) == Some(&Slot::Used)
    }
}
