use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// User id handed to us by the auth collaborator.
pub type UserId = u32;

/// Group id shared by users, computers and images.
pub type GroupId = u32;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` for zero-length or inverted windows.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Operational state of a computer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComputerState {
    Available,
    Reserved,
    Pending,
    Maintenance,
    Failed,
    Deleted,
}

impl ComputerState {
    /// States the scheduler may hand out windows on.
    pub fn is_schedulable(self) -> bool {
        matches!(
            self,
            ComputerState::Available | ComputerState::Reserved | ComputerState::Pending
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComputerState::Available => "available",
            ComputerState::Reserved => "reserved",
            ComputerState::Pending => "pending",
            ComputerState::Maintenance => "maintenance",
            ComputerState::Failed => "failed",
            ComputerState::Deleted => "deleted",
        }
    }
}

/// Hardware attributes used for eligibility and best-fit ranking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardwareSpec {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

impl HardwareSpec {
    pub fn new(cpu_cores: u32, memory_mb: u64, disk_gb: u64) -> Self {
        Self { cpu_cores, memory_mb, disk_gb }
    }

    /// True when `self` meets or exceeds `required` on every axis.
    pub fn covers(&self, required: &HardwareSpec) -> bool {
        self.cpu_cores >= required.cpu_cores
            && self.memory_mb >= required.memory_mb
            && self.disk_gb >= required.disk_gb
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Computer {
    pub id: Ulid,
    pub name: Option<String>,
    pub state: ComputerState,
    pub groups: BTreeSet<GroupId>,
    /// Image currently loaded on the machine, if any.
    pub image_id: Option<Ulid>,
    pub spec: HardwareSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: Ulid,
    pub name: Option<String>,
    pub deleted: bool,
    pub groups: BTreeSet<GroupId>,
    /// Minimum hardware the image needs.
    pub requirements: HardwareSpec,
    /// Cap on simultaneously live reservations of this image.
    pub max_concurrent: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationState {
    Pending,
    Acknowledged,
    Active,
    Completed,
    TimedOut,
    Deleted,
    Failed,
}

impl ReservationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReservationState::Completed
                | ReservationState::TimedOut
                | ReservationState::Deleted
                | ReservationState::Failed
        )
    }

    /// Live reservations hold their slot in the interval index.
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    /// Target state of `event`, or `None` if the transition is not allowed.
    pub fn next(self, event: LifecycleEvent) -> Option<ReservationState> {
        use LifecycleEvent as E;
        use ReservationState as S;
        match (self, event) {
            (S::Pending, E::Ready) => Some(S::Acknowledged),
            (S::Acknowledged, E::Start) => Some(S::Active),
            (S::Active, E::Complete) => Some(S::Completed),
            (S::Pending | S::Acknowledged | S::Active, E::Timeout) => Some(S::TimedOut),
            (S::Pending | S::Acknowledged, E::Cancel) => Some(S::Deleted),
            (S::Pending | S::Acknowledged | S::Active, E::Fail) => Some(S::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationState::Pending => "pending",
            ReservationState::Acknowledged => "acknowledged",
            ReservationState::Active => "active",
            ReservationState::Completed => "completed",
            ReservationState::TimedOut => "timed_out",
            ReservationState::Deleted => "deleted",
            ReservationState::Failed => "failed",
        }
    }
}

/// Inputs that drive the reservation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// The preparation subsystem reports the machine is ready.
    Ready,
    /// The user connected; the reservation is in use.
    Start,
    /// The window ended normally.
    Complete,
    Timeout,
    Cancel,
    Fail,
}

impl LifecycleEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::Ready => "ready",
            LifecycleEvent::Start => "start",
            LifecycleEvent::Complete => "complete",
            LifecycleEvent::Timeout => "timeout",
            LifecycleEvent::Cancel => "cancel",
            LifecycleEvent::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: UserId,
    pub computer_id: Ulid,
    pub image_id: Ulid,
    pub window: Span,
    pub state: ReservationState,
    /// Shared by every reservation of one block allocation.
    pub block_id: Option<Ulid>,
    pub created_at: Ms,
    /// A pending reservation still pending at this instant is timed out.
    pub ready_deadline: Ms,
    pub updated_at: Ms,
}

/// What the dispatch collaborator hands the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub user_id: UserId,
    pub image_id: Ulid,
    pub window: Span,
    pub explicit_computer: Option<Ulid>,
}

impl ReservationRequest {
    pub fn new(user_id: UserId, image_id: Ulid, window: Span) -> Self {
        Self { user_id, image_id, window, explicit_computer: None }
    }

    pub fn on_computer(mut self, computer_id: Ulid) -> Self {
        self.explicit_computer = Some(computer_id);
        self
    }
}

/// Journal record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ComputerRegistered {
        computer: Computer,
    },
    ComputerStateChanged {
        id: Ulid,
        state: ComputerState,
    },
    ImageRegistered {
        image: Image,
    },
    ImageDeleted {
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    /// Every member of a block, written as one record so replay never sees half a block.
    BlockCreated {
        block_id: Ulid,
        reservations: Vec<Reservation>,
    },
    ReservationTransitioned {
        id: Ulid,
        computer_id: Ulid,
        from: ReservationState,
        to: ReservationState,
        at: Ms,
    },
}
