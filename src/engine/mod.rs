mod admin;
mod availability;
mod catalog;
mod error;
mod index;
mod lifecycle;
mod locks;
mod queries;
mod ranking;
mod resolver;
mod validate;

pub use availability::{fitting_starts, free_windows, merge_overlapping, subtract_intervals};
pub use catalog::Catalog;
pub use error::EngineError;
pub use index::{IntervalIndex, Slot, UsageIndex};
pub use lifecycle::{Allocation, BlockGrant, Grant};
pub use locks::{AllocationLocks, LockSet};
pub use ranking::{
    BestFitRanking, BestFitWeights, CandidateComputer, RandomRanking, RankingStrategy,
    build_strategy,
};
pub use resolver::Resolution;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{RESERVATIONS_LIVE, WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

pub(crate) use validate::now_ms;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the journal. Appends that queue up while a flush is running are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_command(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_command(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!("journal flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so partial bytes do not leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_command(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

/// The reservation core: catalog, interval index, reservations and journal.
pub struct Engine {
    config: EngineConfig,
    catalog: Catalog,
    index: IntervalIndex,
    usage: UsageIndex,
    /// Committed reservations. Only the apply functions write here.
    reservations: DashMap<Ulid, Reservation>,
    /// Serializes the transitions of one reservation.
    transition_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Reservations still being acquired, keyed by id.
    in_flight: DashMap<Ulid, CancellationToken>,
    locks: AllocationLocks,
    ranking: Arc<dyn RankingStrategy>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every append-then-apply; compaction takes it exclusively.
    commit_gate: RwLock<()>,
    /// Serializes catalog administration.
    admin: Mutex<()>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    /// Replay the journal at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, config: EngineConfig, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let config = config.normalized();
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            locks: AllocationLocks::new(config.lock_timeout),
            ranking: build_strategy(&config.ranking),
            config,
            catalog: Catalog::new(),
            index: IntervalIndex::new(),
            usage: UsageIndex::new(),
            reservations: DashMap::new(),
            transition_locks: DashMap::new(),
            in_flight: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            admin: Mutex::new(()),
            notify,
        };

        for event in &events {
            engine.replay_event(event);
        }
        metrics::gauge!(RESERVATIONS_LIVE).set(engine.live_count() as f64);
        info!(
            "replayed {} events from {}: {} computers, {} images, {} reservations",
            events.len(),
            wal_path.display(),
            engine.catalog.computer_count(),
            engine.catalog.image_count(),
            engine.reservations.len()
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn index(&self) -> &IntervalIndex {
        &self.index
    }

    pub fn ranking(&self) -> &dyn RankingStrategy {
        self.ranking.as_ref()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Journal a catalog event and apply it.
    async fn persist_catalog(&self, event: Event) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(&event).await?;
        self.apply_catalog(&event);
        Ok(())
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } => self.apply_created(reservation.clone()),
            Event::BlockCreated { reservations, .. } => {
                for r in reservations {
                    self.apply_created(r.clone());
                }
            }
            Event::ReservationTransitioned { id, to, at, .. } => {
                if !self.apply_transition(*id, *to, *at) {
                    warn!("replay: transition for unknown reservation {id}");
                }
            }
            other => self.apply_catalog(other),
        }
    }

    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::ComputerRegistered { computer } => self.catalog.put_computer(computer.clone()),
            Event::ComputerStateChanged { id, state } => {
                self.catalog.set_state(id, *state);
            }
            Event::ImageRegistered { image } => self.catalog.put_image(image.clone()),
            Event::ImageDeleted { id } => {
                self.catalog.mark_image_deleted(id);
            }
            Event::ReservationCreated { .. }
            | Event::BlockCreated { .. }
            | Event::ReservationTransitioned { .. } => {}
        }
    }

    /// Index a new reservation. Its slot was already claimed on the live path,
    /// so the reserve here is a no-op there and a restore on replay.
    fn apply_created(&self, reservation: Reservation) {
        if reservation.state.is_live() {
            let (computer_id, window) = (reservation.computer_id, reservation.window);
            if let Err(e) = self.index.reserve(computer_id, window, reservation.id) {
                warn!("reservation {}: slot not restored: {e}", reservation.id);
            }
            self.usage.add(reservation.image_id, reservation.window, reservation.id);
            if matches!(
                reservation.state,
                ReservationState::Acknowledged | ReservationState::Active
            ) {
                self.catalog.occupy(reservation.computer_id, reservation.id);
            }
            metrics::gauge!(RESERVATIONS_LIVE).increment(1.0);
        }
        self.reservations.insert(reservation.id, reservation);
    }

    /// Move a reservation to `to` and settle the slot and the machine.
    /// Returns false for an unknown id.
    fn apply_transition(&self, id: Ulid, to: ReservationState, at: Ms) -> bool {
        let Some(mut r) = self.reservations.get_mut(&id) else {
            return false;
        };
        let from = r.state;
        r.state = to;
        r.updated_at = at;
        let (computer_id, image_id) = (r.computer_id, r.image_id);
        drop(r);

        if to == ReservationState::Acknowledged {
            self.catalog.load_image(&computer_id, image_id, id);
        }
        if to.is_terminal() && from.is_live() {
            self.index.release(computer_id, id);
            self.usage.remove(image_id, id);
            self.catalog.vacate(&computer_id, id);
            metrics::gauge!(RESERVATIONS_LIVE).decrement(1.0);
        }
        true
    }

    fn transition_lock(&self, id: Ulid) -> Arc<Mutex<()>> {
        self.transition_locks.entry(id).or_default().value().clone()
    }

    fn live_count(&self) -> usize {
        self.reservations.iter().filter(|r| r.state.is_live()).count()
    }
}
