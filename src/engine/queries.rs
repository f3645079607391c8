use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::privilege::PrivilegeSnapshot;

use super::availability::{fitting_starts, free_windows};
use super::validate::{now_ms, validate_window};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|r| r.value().clone())
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Reservations holding a slot on the computer, in window order.
    pub fn live_reservations(&self, computer_id: Ulid) -> Vec<Reservation> {
        self.index
            .slots(computer_id)
            .iter()
            .filter_map(|slot| self.get_reservation(&slot.reservation_id))
            .collect()
    }

    pub fn reservations_for_user(&self, user_id: UserId) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| (r.window.start, r.id));
        out
    }

    pub fn block_members(&self, block_id: Ulid) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| r.block_id == Some(block_id))
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| r.id);
        out
    }

    pub fn is_free(&self, computer_id: Ulid, window: &Span) -> Result<bool, EngineError> {
        validate_window(window)?;
        Ok(self.index.is_free(computer_id, window))
    }

    /// Unreserved parts of `query` on one computer.
    pub fn free_windows(&self, computer_id: Ulid, query: &Span) -> Result<Vec<Span>, EngineError> {
        validate_window(query)?;
        if !self.catalog.contains_computer(&computer_id) {
            return Err(EngineError::NotFound(computer_id));
        }
        Ok(free_windows(query, &self.index.booked(computer_id, query)))
    }

    pub fn get_computer(&self, id: &Ulid) -> Option<Computer> {
        self.catalog.get_computer(id)
    }

    pub fn get_image(&self, id: &Ulid) -> Option<Image> {
        self.catalog.get_image(id)
    }

    pub fn list_computers(&self) -> Vec<Computer> {
        self.catalog.computers()
    }

    pub fn list_images(&self) -> Vec<Image> {
        self.catalog.images()
    }

    /// Alternate windows of the requested duration inside `search`, earliest
    /// first, on which at least one eligible computer is free.
    ///
    /// Image caps are not considered; a suggestion is a hint, not a hold.
    pub fn suggest_windows(
        &self,
        request: &ReservationRequest,
        snapshot: &PrivilegeSnapshot,
        search: &Span,
        limit: usize,
    ) -> Result<Vec<Span>, EngineError> {
        validate_window(&request.window)?;
        validate_window(search)?;
        if search.duration_ms() > MAX_SUGGEST_RANGE_MS {
            return Err(EngineError::LimitExceeded("suggestion range too wide"));
        }
        if !snapshot.is_fresh() {
            return Err(EngineError::StalePrivileges);
        }
        let duration = request.window.duration_ms();
        let limit = limit.min(MAX_SUGGESTIONS);

        let mut starts: Vec<Ms> = self
            .catalog
            .list_eligible_computers(request.image_id, snapshot.visible_groups(), true)
            .into_iter()
            .filter(|id| request.explicit_computer.is_none_or(|e| e == *id))
            .flat_map(|id| {
                let free = free_windows(search, &self.index.booked(id, search));
                fitting_starts(&free, duration)
            })
            .collect();
        starts.sort_unstable();
        starts.dedup();
        Ok(starts
            .into_iter()
            .take(limit)
            .map(|start| Span::new(start, start + duration))
            .collect())
    }

    /// Reservations the reaper should move at `now`, with the state each was
    /// seen in and the event to fire.
    pub fn collect_overdue(&self, now: Ms) -> Vec<(Ulid, ReservationState, LifecycleEvent)> {
        let mut overdue: Vec<_> = self
            .reservations
            .iter()
            .filter_map(|r| {
                let event = match r.state {
                    ReservationState::Pending if now >= r.ready_deadline => LifecycleEvent::Timeout,
                    ReservationState::Acknowledged if now >= r.window.end => LifecycleEvent::Timeout,
                    ReservationState::Active if now >= r.window.end => LifecycleEvent::Complete,
                    _ => return None,
                };
                Some((r.id, r.state, event))
            })
            .collect();
        overdue.sort_by_key(|(id, _, _)| *id);
        overdue
    }

    /// Rewrite the journal as a snapshot of the current state. Terminal
    /// reservations older than the retention window are dropped from the
    /// journal and from memory. Returns how many were dropped.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.write().await;
        let cutoff = now_ms().saturating_sub(self.config.history_retention_ms);

        let mut events: Vec<Event> = Vec::new();
        events.extend(self.catalog.images().into_iter().map(|image| Event::ImageRegistered { image }));
        events.extend(
            self.catalog
                .computers()
                .into_iter()
                .map(|computer| Event::ComputerRegistered { computer }),
        );

        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|r| r.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);
        let mut expired = Vec::new();
        for reservation in reservations {
            if reservation.state.is_terminal() && reservation.updated_at < cutoff {
                expired.push(reservation.id);
            } else {
                events.push(Event::ReservationCreated { reservation });
            }
        }

        let kept = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        for id in &expired {
            self.reservations.remove(id);
            self.transition_locks.remove(id);
        }
        info!("compacted journal to {kept} events, dropped {} expired reservations", expired.len());
        Ok(expired.len())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
