use std::collections::BTreeSet;

use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Queryable view of computers and images.
///
/// Writes only arrive through journal events applied by the engine.
#[derive(Debug, Default)]
pub struct Catalog {
    computers: DashMap<Ulid, Computer>,
    images: DashMap<Ulid, Image>,
    /// computer id → acknowledged or active reservations using the machine
    occupants: DashMap<Ulid, BTreeSet<Ulid>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computers that could run `image_id` for a requester who sees `required_groups`.
    ///
    /// Time availability is not considered here. An unknown image, or a
    /// deleted one when `exclude_deleted` is set, yields the empty set.
    pub fn list_eligible_computers(
        &self,
        image_id: Ulid,
        required_groups: &BTreeSet<GroupId>,
        exclude_deleted: bool,
    ) -> BTreeSet<Ulid> {
        let Some(image) = self.get_image(&image_id) else {
            return BTreeSet::new();
        };
        if exclude_deleted && image.deleted {
            return BTreeSet::new();
        }
        self.computers
            .iter()
            .filter(|entry| is_eligible(entry.value(), &image, required_groups))
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn get_computer(&self, id: &Ulid) -> Option<Computer> {
        self.computers.get(id).map(|e| e.value().clone())
    }

    pub fn get_image(&self, id: &Ulid) -> Option<Image> {
        self.images.get(id).map(|e| e.value().clone())
    }

    pub fn contains_computer(&self, id: &Ulid) -> bool {
        self.computers.contains_key(id)
    }

    pub fn contains_image(&self, id: &Ulid) -> bool {
        self.images.contains_key(id)
    }

    pub fn computer_count(&self) -> usize {
        self.computers.len()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn occupants(&self, computer_id: &Ulid) -> BTreeSet<Ulid> {
        self.occupants
            .get(computer_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn computers(&self) -> Vec<Computer> {
        let mut out: Vec<Computer> = self.computers.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|c| c.id);
        out
    }

    pub fn images(&self) -> Vec<Image> {
        let mut out: Vec<Image> = self.images.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|i| i.id);
        out
    }

    // ── Event application ────────────────────────────────────

    pub(super) fn put_computer(&self, computer: Computer) {
        self.computers.insert(computer.id, computer);
    }

    pub(super) fn put_image(&self, image: Image) {
        self.images.insert(image.id, image);
    }

    pub(super) fn set_state(&self, id: &Ulid, state: ComputerState) -> bool {
        match self.computers.get_mut(id) {
            Some(mut c) => {
                c.state = state;
                true
            }
            None => false,
        }
    }

    pub(super) fn mark_image_deleted(&self, id: &Ulid) -> bool {
        match self.images.get_mut(id) {
            Some(mut img) => {
                img.deleted = true;
                true
            }
            None => false,
        }
    }

    pub(super) fn occupy(&self, computer_id: Ulid, reservation_id: Ulid) {
        self.occupants.entry(computer_id).or_default().insert(reservation_id);
    }

    /// The preparation subsystem finished loading `image_id` for `reservation_id`.
    pub(super) fn load_image(&self, computer_id: &Ulid, image_id: Ulid, reservation_id: Ulid) {
        if let Some(mut c) = self.computers.get_mut(computer_id) {
            c.image_id = Some(image_id);
            if c.state.is_schedulable() {
                c.state = ComputerState::Reserved;
            }
        }
        self.occupy(*computer_id, reservation_id);
    }

    /// Drop `reservation_id` from the machine's occupants. The machine is
    /// given back only once no occupant is left. Out-of-band states are kept.
    pub(super) fn vacate(&self, computer_id: &Ulid, reservation_id: Ulid) -> bool {
        let Some(mut set) = self.occupants.get_mut(computer_id) else {
            return false;
        };
        if !set.remove(&reservation_id) {
            return false;
        }
        let now_empty = set.is_empty();
        drop(set);
        if !now_empty {
            return true;
        }
        self.occupants.remove_if(computer_id, |_, set| set.is_empty());
        if let Some(mut c) = self.computers.get_mut(computer_id)
            && matches!(c.state, ComputerState::Reserved | ComputerState::Pending)
        {
            c.state = ComputerState::Available;
        }
        true
    }
}

fn is_eligible(computer: &Computer, image: &Image, required_groups: &BTreeSet<GroupId>) -> bool {
    if !computer.state.is_schedulable() {
        return false;
    }
    let image_compatible = computer.image_id == Some(image.id)
        || !computer.groups.is_disjoint(&image.groups);
    image_compatible
        && !computer.groups.is_disjoint(required_groups)
        && computer.spec.covers(&image.requirements)
}
