use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{ALLOCATIONS_TOTAL, ALLOCATION_DURATION_SECONDS, TRANSITIONS_TOTAL};
use crate::privilege::{PrivilegeSnapshot, PrivilegeSource};

use super::resolver::Resolution;
use super::validate::{now_ms, validate_window};
use super::{CandidateComputer, Engine, EngineError};

/// Result of an allocation that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation<G> {
    Granted(G),
    /// The request is valid but nothing can take it; offer other windows.
    NoAvailability,
}

impl<G> Allocation<G> {
    pub fn granted(self) -> Option<G> {
        match self {
            Allocation::Granted(g) => Some(g),
            Allocation::NoAvailability => None,
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Allocation::Granted(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub reservation_id: Ulid,
    pub computer_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockGrant {
    pub block_id: Ulid,
    pub grants: Vec<Grant>,
}

/// In-flight registration of one allocation. Ids are deregistered on drop.
struct InFlight<'a> {
    engine: &'a Engine,
    ids: Vec<Ulid>,
    token: CancellationToken,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.engine.in_flight.remove(id);
        }
    }
}

fn record_allocation<G>(kind: &'static str, result: &Result<Allocation<G>, EngineError>, started: Instant) {
    let outcome = match result {
        Ok(Allocation::Granted(_)) => "granted",
        Ok(Allocation::NoAvailability) => "no_availability",
        Err(e) => e.kind(),
    };
    metrics::counter!(ALLOCATIONS_TOTAL, "kind" => kind, "outcome" => outcome).increment(1);
    metrics::histogram!(ALLOCATION_DURATION_SECONDS, "kind" => kind)
        .record(started.elapsed().as_secs_f64());
}

/// Candidate computers, plus the image itself when it is capped so that
/// two allocations of one capped image cannot both pass the cap check.
fn lock_keys(candidates: &[CandidateComputer], image: &Image) -> Vec<Ulid> {
    let mut keys: Vec<Ulid> = candidates.iter().map(|c| c.computer_id).collect();
    if image.max_concurrent.is_some() {
        keys.push(image.id);
    }
    keys
}

impl Engine {
    /// Fetch privileges of `user_id`, valid for the configured privilege TTL.
    pub async fn snapshot(&self, source: Arc<dyn PrivilegeSource>, user_id: UserId) -> PrivilegeSnapshot {
        PrivilegeSnapshot::fetch(source, user_id, self.config.privilege_ttl).await
    }

    /// Reserve one computer for `request` under the caller-chosen id `id`.
    pub async fn create(
        &self,
        id: Ulid,
        request: ReservationRequest,
        snapshot: &PrivilegeSnapshot,
    ) -> Result<Allocation<Grant>, EngineError> {
        let started = Instant::now();
        let result = self.create_one(id, &request, snapshot).await;
        record_allocation("single", &result, started);
        result
    }

    async fn create_one(
        &self,
        id: Ulid,
        request: &ReservationRequest,
        snapshot: &PrivilegeSnapshot,
    ) -> Result<Allocation<Grant>, EngineError> {
        self.admit(request, snapshot).await?;
        let in_flight = self.register_in_flight(&[id])?;
        let Resolution::Candidates(candidates) = self.resolve(request, snapshot)? else {
            return Ok(Allocation::NoAvailability);
        };
        let Some(image) = self.catalog.get_image(&request.image_id) else {
            return Ok(Allocation::NoAvailability);
        };
        let token = in_flight.token.clone();

        let outcome = self
            .locks
            .with_lock(id, &lock_keys(&candidates, &image), || async {
                if token.is_cancelled() {
                    return Err(EngineError::Cancelled(id));
                }
                if self.cap_reached(&image, &request.window, 1) {
                    return Ok(Allocation::NoAvailability);
                }
                // The world may have moved since resolve.
                let Some(chosen) = candidates
                    .iter()
                    .find(|c| self.index.is_free(c.computer_id, &request.window))
                else {
                    let contested = candidates.first().map_or(image.id, |c| c.computer_id);
                    return Err(EngineError::SlotConflict(contested));
                };
                let reservation =
                    self.new_reservation(id, request, chosen.computer_id, None, now_ms());
                self.commit_created(Event::ReservationCreated { reservation }).await?;
                Ok(Allocation::Granted(Grant { reservation_id: id, computer_id: chosen.computer_id }))
            })
            .await;

        drop(in_flight);
        if token.is_cancelled()
            && let Ok(Allocation::Granted(_)) = &outcome
        {
            // Cancelled after the commit but before deregistration.
            self.advance(id, LifecycleEvent::Cancel).await?;
            return Err(EngineError::Cancelled(id));
        }
        if let Ok(Allocation::Granted(grant)) = &outcome {
            info!(
                "reservation {id}: user {} granted computer {} for {:?}",
                request.user_id, grant.computer_id, request.window
            );
        }
        outcome
    }

    /// Reserve `ids.len()` distinct computers for the same window, all or nothing.
    pub async fn create_block(
        &self,
        ids: Vec<Ulid>,
        request: ReservationRequest,
        snapshot: &PrivilegeSnapshot,
    ) -> Result<Allocation<BlockGrant>, EngineError> {
        let started = Instant::now();
        let result = self.create_many(&ids, &request, snapshot).await;
        record_allocation("block", &result, started);
        result
    }

    async fn create_many(
        &self,
        ids: &[Ulid],
        request: &ReservationRequest,
        snapshot: &PrivilegeSnapshot,
    ) -> Result<Allocation<BlockGrant>, EngineError> {
        let (min, max) = (self.config.block_min, self.config.block_max);
        if ids.len() < min || ids.len() > max {
            return Err(EngineError::BlockSize { requested: ids.len(), min, max });
        }
        if request.explicit_computer.is_some() {
            return Err(EngineError::LimitExceeded("block allocation cannot name a computer"));
        }
        self.admit(request, snapshot).await?;
        let in_flight = self.register_in_flight(ids)?;
        let Resolution::Candidates(candidates) = self.resolve(request, snapshot)? else {
            return Ok(Allocation::NoAvailability);
        };
        let Some(image) = self.catalog.get_image(&request.image_id) else {
            return Ok(Allocation::NoAvailability);
        };
        let n = ids.len();
        if candidates.len() < n || self.cap_reached(&image, &request.window, n) {
            debug!("block of {n}: only {} candidates for {:?}", candidates.len(), request.window);
            return Ok(Allocation::NoAvailability);
        }
        let block_id = Ulid::new();
        let token = in_flight.token.clone();

        let outcome = self
            .locks
            .with_lock(block_id, &lock_keys(&candidates, &image), || async {
                if token.is_cancelled() {
                    return Err(EngineError::Cancelled(block_id));
                }
                if self.cap_reached(&image, &request.window, n) {
                    return Ok(Allocation::NoAvailability);
                }
                let free: Vec<Ulid> = candidates
                    .iter()
                    .map(|c| c.computer_id)
                    .filter(|c| self.index.is_free(*c, &request.window))
                    .take(n)
                    .collect();
                if free.len() < n {
                    let contested = candidates
                        .iter()
                        .find(|c| !self.index.is_free(c.computer_id, &request.window))
                        .map_or(image.id, |c| c.computer_id);
                    return Err(EngineError::SlotConflict(contested));
                }
                let now = now_ms();
                let reservations: Vec<Reservation> = ids
                    .iter()
                    .zip(&free)
                    .map(|(id, computer_id)| {
                        self.new_reservation(*id, request, *computer_id, Some(block_id), now)
                    })
                    .collect();
                let grants = reservations
                    .iter()
                    .map(|r| Grant { reservation_id: r.id, computer_id: r.computer_id })
                    .collect();
                self.commit_created(Event::BlockCreated { block_id, reservations }).await?;
                Ok(Allocation::Granted(BlockGrant { block_id, grants }))
            })
            .await;

        drop(in_flight);
        if token.is_cancelled()
            && let Ok(Allocation::Granted(block)) = &outcome
        {
            for grant in &block.grants {
                self.advance(grant.reservation_id, LifecycleEvent::Cancel).await?;
            }
            return Err(EngineError::Cancelled(block_id));
        }
        if let Ok(Allocation::Granted(block)) = &outcome {
            info!(
                "block {block_id}: user {} granted {} computers for {:?}",
                request.user_id,
                block.grants.len(),
                request.window
            );
        }
        outcome
    }

    /// Request-level checks that touch no shared state.
    async fn admit(
        &self,
        request: &ReservationRequest,
        snapshot: &PrivilegeSnapshot,
    ) -> Result<(), EngineError> {
        validate_window(&request.window)?;
        if !snapshot.is_fresh() {
            return Err(EngineError::StalePrivileges);
        }
        if snapshot.user_id() != request.user_id || !snapshot.may_reserve(request.image_id).await {
            return Err(EngineError::NotPermitted {
                user_id: request.user_id,
                image_id: request.image_id,
            });
        }
        Ok(())
    }

    /// Claim `ids` for one allocation. Every id shares one cancellation token.
    fn register_in_flight(&self, ids: &[Ulid]) -> Result<InFlight<'_>, EngineError> {
        let mut guard = InFlight {
            engine: self,
            ids: Vec::with_capacity(ids.len()),
            token: CancellationToken::new(),
        };
        for id in ids {
            // Committed ids never get an in-flight token.
            if self.reservations.contains_key(id) {
                return Err(EngineError::AlreadyExists(*id));
            }
            match self.in_flight.entry(*id) {
                Entry::Occupied(_) => return Err(EngineError::AlreadyExists(*id)),
                Entry::Vacant(slot) => {
                    slot.insert(guard.token.clone());
                }
            }
            guard.ids.push(*id);
        }
        Ok(guard)
    }

    fn new_reservation(
        &self,
        id: Ulid,
        request: &ReservationRequest,
        computer_id: Ulid,
        block_id: Option<Ulid>,
        now: Ms,
    ) -> Reservation {
        Reservation {
            id,
            user_id: request.user_id,
            computer_id,
            image_id: request.image_id,
            window: request.window,
            state: ReservationState::Pending,
            block_id,
            created_at: now,
            ready_deadline: now.max(request.window.start) + self.config.readiness_timeout_ms(),
            updated_at: now,
        }
    }

    /// Claim every slot, journal, then apply. A failed append releases the
    /// claimed slots so nothing of the request survives.
    async fn commit_created(&self, event: Event) -> Result<(), EngineError> {
        let reservations: &[Reservation] = match &event {
            Event::ReservationCreated { reservation } => std::slice::from_ref(reservation),
            Event::BlockCreated { reservations, .. } => reservations,
            _ => &[],
        };
        let _gate = self.commit_gate.read().await;

        let mut claimed = Vec::with_capacity(reservations.len());
        for r in reservations {
            if let Err(e) = self.index.reserve(r.computer_id, r.window, r.id) {
                self.release_claims(&claimed);
                return Err(e);
            }
            claimed.push((r.computer_id, r.id));
        }
        if let Err(e) = self.wal_append(&event).await {
            self.release_claims(&claimed);
            return Err(e);
        }
        for r in reservations {
            self.apply_created(r.clone());
            self.notify.send(r.id, &event);
        }
        Ok(())
    }

    fn release_claims(&self, claimed: &[(Ulid, Ulid)]) {
        for (computer_id, reservation_id) in claimed {
            self.index.release(*computer_id, *reservation_id);
        }
    }

    /// Cancel a reservation that has not started. An allocation still in
    /// flight is flagged and aborts before it commits.
    pub async fn cancel(&self, id: Ulid) -> Result<(), EngineError> {
        if let Some(token) = self.in_flight.get(&id) {
            token.cancel();
            info!("reservation {id}: cancelled while in flight");
            return Ok(());
        }
        let state = self
            .reservations
            .get(&id)
            .map(|r| r.state)
            .ok_or(EngineError::NotFound(id))?;
        if state.is_terminal() || state == ReservationState::Active {
            return Err(EngineError::InvalidState { id, state });
        }
        match self.advance(id, LifecycleEvent::Cancel).await {
            Ok(_) => Ok(()),
            Err(EngineError::InvalidTransition { from, .. }) => {
                Err(EngineError::InvalidState { id, state: from })
            }
            Err(e) => Err(e),
        }
    }

    /// Drive the state machine of `id` with `event`.
    pub async fn advance(
        &self,
        id: Ulid,
        event: LifecycleEvent,
    ) -> Result<ReservationState, EngineError> {
        match self.transition(id, None, event).await? {
            Some(state) => Ok(state),
            None => Err(EngineError::NotFound(id)),
        }
    }

    /// Like [`advance`](Self::advance), but only if `id` is still in `expected`.
    /// `Ok(None)` means someone else moved it first.
    pub async fn advance_if(
        &self,
        id: Ulid,
        expected: ReservationState,
        event: LifecycleEvent,
    ) -> Result<Option<ReservationState>, EngineError> {
        self.transition(id, Some(expected), event).await
    }

    async fn transition(
        &self,
        id: Ulid,
        expected: Option<ReservationState>,
        event: LifecycleEvent,
    ) -> Result<Option<ReservationState>, EngineError> {
        if !self.reservations.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let lock = self.transition_lock(id);
        let _held = lock.lock().await;

        let (from, computer_id) = self
            .reservations
            .get(&id)
            .map(|r| (r.state, r.computer_id))
            .ok_or(EngineError::NotFound(id))?;
        if expected.is_some_and(|s| s != from) {
            debug!("reservation {id}: expected {expected:?}, found {from:?}; skipping {event:?}");
            return Ok(None);
        }
        let to = from
            .next(event)
            .ok_or(EngineError::InvalidTransition { id, from, event })?;

        let at = now_ms();
        let record = Event::ReservationTransitioned { id, computer_id, from, to, at };
        {
            let _gate = self.commit_gate.read().await;
            self.wal_append(&record).await?;
            self.apply_transition(id, to, at);
        }

        self.notify.send(id, &record);
        if to.is_terminal() {
            self.notify.remove(&id);
        }
        info!("reservation {id}: {} -> {} ({})", from.as_str(), to.as_str(), event.as_str());
        metrics::counter!(TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        Ok(Some(to))
    }

    /// Wait for `id` to leave `Pending`, timing it out at its readiness deadline.
    pub async fn await_ready(&self, id: Ulid) -> Result<ReservationState, EngineError> {
        // Subscribe before reading so a transition in between is not missed.
        let mut rx = self.notify.subscribe(id);
        let Some((state, deadline)) = self.reservations.get(&id).map(|r| (r.state, r.ready_deadline))
        else {
            self.notify.remove(&id);
            return Err(EngineError::NotFound(id));
        };
        if state != ReservationState::Pending {
            if state.is_terminal() {
                self.notify.remove(&id);
            }
            return Ok(state);
        }

        let wait = Duration::from_millis((deadline - now_ms()).max(0) as u64);
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(Event::ReservationTransitioned { to, .. }) => return Ok(to),
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) | Err(RecvError::Closed) => {
                        let current = self.current_state(id)?;
                        if current != ReservationState::Pending {
                            return Ok(current);
                        }
                        if matches!(msg, Err(RecvError::Closed)) {
                            rx = self.notify.subscribe(id);
                        }
                    }
                },
                _ = &mut sleep => break,
            }
        }

        match self
            .advance_if(id, ReservationState::Pending, LifecycleEvent::Timeout)
            .await?
        {
            Some(state) => Ok(state),
            None => self.current_state(id),
        }
    }

    fn current_state(&self, id: Ulid) -> Result<ReservationState, EngineError> {
        self.reservations
            .get(&id)
            .map(|r| r.state)
            .ok_or(EngineError::NotFound(id))
    }
}
