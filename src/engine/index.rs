use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::MAX_SLOTS_PER_COMPUTER;
use crate::model::Span;

use super::EngineError;

/// One reserved window on a computer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub reservation_id: Ulid,
    pub window: Span,
}

/// Reserved windows sorted by `window.start`.
#[derive(Debug, Clone, Default)]
pub struct SlotList {
    slots: Vec<Slot>,
}

impl SlotList {
    fn insert(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.window.start, |s| s.window.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    fn remove(&mut self, reservation_id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.reservation_id == reservation_id)?;
        Some(self.slots.remove(pos))
    }

    fn get(&self, reservation_id: Ulid) -> Option<&Slot> {
        self.slots.iter().find(|s| s.reservation_id == reservation_id)
    }

    /// Slots whose window overlaps `query`.
    /// Everything at index >= right_bound starts at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.window.start < query.end);
        let query_start = query.start;
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.window.end > query_start)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }
}

/// Per-computer ordered set of reserved windows.
///
/// The check-and-insert in [`IntervalIndex::reserve`] runs under the
/// computer's map shard lock, so two reservations racing for the same
/// computer cannot both land.
#[derive(Debug, Default)]
pub struct IntervalIndex {
    computers: DashMap<Ulid, SlotList>,
}

impl IntervalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_free(&self, computer_id: Ulid, window: &Span) -> bool {
        self.computers
            .get(&computer_id)
            .is_none_or(|slots| slots.overlapping(window).next().is_none())
    }

    /// Claim `window` on `computer_id` for `reservation_id`.
    ///
    /// Re-reserving an id with its current window is a no-op. Re-reserving it
    /// with a different window moves the slot if the new window is free.
    pub(crate) fn reserve(
        &self,
        computer_id: Ulid,
        window: Span,
        reservation_id: Ulid,
    ) -> Result<(), EngineError> {
        if !window.is_valid() {
            return Err(EngineError::InvalidWindow(window));
        }
        let mut slots = self.computers.entry(computer_id).or_default();

        let existing = slots.get(reservation_id).copied();
        if existing.is_some_and(|s| s.window == window) {
            return Ok(());
        }
        if slots
            .overlapping(&window)
            .any(|s| s.reservation_id != reservation_id)
        {
            return Err(EngineError::SlotConflict(computer_id));
        }
        if existing.is_none() && slots.len() >= MAX_SLOTS_PER_COMPUTER {
            return Err(EngineError::LimitExceeded("too many reservations on computer"));
        }

        slots.remove(reservation_id);
        slots.insert(Slot { reservation_id, window });
        Ok(())
    }

    /// Drop the slot held by `reservation_id`. Returns false if it held none.
    pub(crate) fn release(&self, computer_id: Ulid, reservation_id: Ulid) -> bool {
        self.computers
            .get_mut(&computer_id)
            .and_then(|mut slots| slots.remove(reservation_id))
            .is_some()
    }

    /// Reserved windows on a computer that overlap `query`, in start order.
    pub fn booked(&self, computer_id: Ulid, query: &Span) -> Vec<Span> {
        self.computers
            .get(&computer_id)
            .map(|slots| slots.overlapping(query).map(|s| s.window).collect())
            .unwrap_or_default()
    }

    pub fn slots(&self, computer_id: Ulid) -> Vec<Slot> {
        self.computers
            .get(&computer_id)
            .map(|slots| slots.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of live slots on the computer.
    pub fn load(&self, computer_id: Ulid) -> usize {
        self.computers.get(&computer_id).map_or(0, |s| s.len())
    }
}

/// Live windows per image, used to enforce concurrent-instance caps.
/// Unlike [`IntervalIndex`], windows here may overlap.
#[derive(Debug, Default)]
pub struct UsageIndex {
    images: DashMap<Ulid, SlotList>,
}

impl UsageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, image_id: Ulid, window: Span, reservation_id: Ulid) {
        let mut slots = self.images.entry(image_id).or_default();
        if slots.get(reservation_id).is_none() {
            slots.insert(Slot { reservation_id, window });
        }
    }

    pub(crate) fn remove(&self, image_id: Ulid, reservation_id: Ulid) -> bool {
        self.images
            .get_mut(&image_id)
            .and_then(|mut slots| slots.remove(reservation_id))
            .is_some()
    }

    /// Live reservations of the image overlapping `window`.
    pub fn concurrent(&self, image_id: Ulid, window: &Span) -> usize {
        self.images
            .get(&image_id)
            .map_or(0, |slots| slots.overlapping(window).count())
    }
}
