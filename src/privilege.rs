use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use ulid::Ulid;

use crate::model::{GroupId, UserId};

/// The auth collaborator. The core never implements authorization itself.
#[async_trait]
pub trait PrivilegeSource: Send + Sync {
    async fn visible_groups(&self, user_id: UserId) -> BTreeSet<GroupId>;

    async fn may_reserve(&self, user_id: UserId, image_id: Ulid) -> bool;
}

/// Privileges of one user captured at a point in time.
///
/// Callers pass it into each request and fetch a new one once it expires.
/// Capability answers are memoized for the snapshot's lifetime.
pub struct PrivilegeSnapshot {
    user_id: UserId,
    visible_groups: BTreeSet<GroupId>,
    fetched_at: Instant,
    ttl: Duration,
    source: Arc<dyn PrivilegeSource>,
    decisions: DashMap<Ulid, bool>,
}

impl std::fmt::Debug for PrivilegeSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivilegeSnapshot")
            .field("user_id", &self.user_id)
            .field("visible_groups", &self.visible_groups)
            .field("fetched_at", &self.fetched_at)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl PrivilegeSnapshot {
    pub async fn fetch(source: Arc<dyn PrivilegeSource>, user_id: UserId, ttl: Duration) -> Self {
        let visible_groups = source.visible_groups(user_id).await;
        Self {
            user_id,
            visible_groups,
            fetched_at: Instant::now(),
            ttl,
            source,
            decisions: DashMap::new(),
        }
    }

    /// `self` if still fresh, otherwise a newly fetched snapshot.
    pub async fn refreshed(self) -> Self {
        if self.is_fresh() {
            return self;
        }
        Self::fetch(self.source, self.user_id, self.ttl).await
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn visible_groups(&self) -> &BTreeSet<GroupId> {
        &self.visible_groups
    }

    pub fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }

    pub async fn may_reserve(&self, image_id: Ulid) -> bool {
        if let Some(d) = self.decisions.get(&image_id) {
            return *d;
        }
        let allowed = self.source.may_reserve(self.user_id, image_id).await;
        self.decisions.insert(image_id, allowed);
        allowed
    }
}

/// Fixed in-memory privilege table.
#[derive(Debug, Default, Clone)]
pub struct StaticPrivileges {
    groups: HashMap<UserId, BTreeSet<GroupId>>,
    denied: HashSet<(UserId, Ulid)>,
}

impl StaticPrivileges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: UserId, groups: impl IntoIterator<Item = GroupId>) -> Self {
        self.groups.entry(user_id).or_default().extend(groups);
        self
    }

    pub fn deny(mut self, user_id: UserId, image_id: Ulid) -> Self {
        self.denied.insert((user_id, image_id));
        self
    }
}

#[async_trait]
impl PrivilegeSource for StaticPrivileges {
    async fn visible_groups(&self, user_id: UserId) -> BTreeSet<GroupId> {
        self.groups.get(&user_id).cloned().unwrap_or_default()
    }

    async fn may_reserve(&self, user_id: UserId, image_id: Ulid) -> bool {
        !self.denied.contains(&(user_id, image_id))
    }
}
