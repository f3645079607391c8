use std::collections::BTreeSet;

use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::observability::RESOLVE_CANDIDATES;
use crate::privilege::PrivilegeSnapshot;

use super::validate::validate_window;
use super::{CandidateComputer, Engine, EngineError};

/// Outcome of resolving a request against the current state.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Free eligible computers, best first. Never empty.
    Candidates(Vec<CandidateComputer>),
    NoAvailability,
}

impl Resolution {
    pub fn candidates(&self) -> &[CandidateComputer] {
        match self {
            Resolution::Candidates(c) => c,
            Resolution::NoAvailability => &[],
        }
    }
}

impl Engine {
    /// Ranked computers that could take `request` right now.
    ///
    /// Reads only; the answer may be stale by the time the caller commits,
    /// which is why `create` re-checks every candidate under its locks.
    pub fn resolve(
        &self,
        request: &ReservationRequest,
        snapshot: &PrivilegeSnapshot,
    ) -> Result<Resolution, EngineError> {
        validate_window(&request.window)?;
        if !snapshot.is_fresh() {
            return Err(EngineError::StalePrivileges);
        }
        let Some(image) = self.catalog.get_image(&request.image_id) else {
            return Ok(Resolution::NoAvailability);
        };
        if self.cap_reached(&image, &request.window, 1) {
            debug!("image {}: concurrent cap reached for {:?}", image.id, request.window);
            return Ok(Resolution::NoAvailability);
        }

        let candidates = self.free_candidates(
            &image,
            snapshot.visible_groups(),
            &request.window,
            request.explicit_computer,
        );
        if candidates.is_empty() {
            return Ok(Resolution::NoAvailability);
        }
        Ok(Resolution::Candidates(candidates))
    }

    /// True if `extra` more reservations of `image` over `window` would exceed its cap.
    pub(super) fn cap_reached(&self, image: &Image, window: &Span, extra: usize) -> bool {
        image
            .max_concurrent
            .is_some_and(|cap| self.usage.concurrent(image.id, window) + extra > cap as usize)
    }

    pub(super) fn free_candidates(
        &self,
        image: &Image,
        groups: &BTreeSet<GroupId>,
        window: &Span,
        explicit: Option<Ulid>,
    ) -> Vec<CandidateComputer> {
        let mut candidates: Vec<CandidateComputer> = self
            .catalog
            .list_eligible_computers(image.id, groups, true)
            .into_iter()
            .filter(|id| explicit.is_none_or(|e| e == *id))
            .filter(|id| self.index.is_free(*id, window))
            .filter_map(|id| {
                self.catalog.get_computer(&id).map(|c| CandidateComputer {
                    computer_id: id,
                    spec: c.spec,
                    load: self.index.load(id),
                    score: 0.0,
                })
            })
            .collect();
        self.ranking.rank(image, &mut candidates);
        metrics::histogram!(RESOLVE_CANDIDATES).record(candidates.len() as f64);
        candidates
    }
}
