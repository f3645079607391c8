use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::BestFitWeights;
use crate::limits::MAX_BLOCK_SIZE;
use crate::model::{Computer, Image, Ms};

/// How the resolver orders free candidates. Fixed for the life of an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RankingPolicy {
    /// Uniform shuffle; a seed makes the order reproducible.
    Random { seed: Option<u64> },
    BestFit(BestFitWeights),
}

impl Default for RankingPolicy {
    fn default() -> Self {
        RankingPolicy::BestFit(BestFitWeights::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Bound on acquiring every allocation lock of one request.
    pub lock_timeout: Duration,
    /// How long a reservation may stay pending before it is timed out.
    pub readiness_timeout: Duration,
    pub ranking: RankingPolicy,
    pub block_min: usize,
    pub block_max: usize,
    /// Lifetime of a privilege snapshot before it must be re-fetched.
    pub privilege_ttl: Duration,
    pub reap_interval: Duration,
    /// Journal appends between compactions.
    pub compact_threshold: u64,
    /// Terminal reservations older than this are dropped on compaction.
    pub history_retention_ms: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(3),
            readiness_timeout: Duration::from_secs(15 * 60),
            ranking: RankingPolicy::default(),
            block_min: 2,
            block_max: 64,
            privilege_ttl: Duration::from_secs(300),
            reap_interval: Duration::from_secs(5),
            compact_threshold: 1000,
            history_retention_ms: 7 * 24 * 3_600_000,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

impl EngineConfig {
    /// Defaults overridden by `LABSCHED_*` environment variables.
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(d) = env_millis("LABSCHED_LOCK_TIMEOUT_MS") {
            cfg.lock_timeout = d;
        }
        if let Some(d) = env_millis("LABSCHED_READINESS_TIMEOUT_MS") {
            cfg.readiness_timeout = d;
        }
        if let Some(d) = env_millis("LABSCHED_PRIVILEGE_TTL_MS") {
            cfg.privilege_ttl = d;
        }
        if let Some(d) = env_millis("LABSCHED_REAP_INTERVAL_MS") {
            cfg.reap_interval = d;
        }
        if let Some(n) = env_parse("LABSCHED_COMPACT_THRESHOLD") {
            cfg.compact_threshold = n;
        }
        if let Some(ms) = env_parse("LABSCHED_HISTORY_RETENTION_MS") {
            cfg.history_retention_ms = ms;
        }
        if let Some(n) = env_parse("LABSCHED_BLOCK_MIN") {
            cfg.block_min = n;
        }
        if let Some(n) = env_parse("LABSCHED_BLOCK_MAX") {
            cfg.block_max = n;
        }
        cfg.ranking = match std::env::var("LABSCHED_RANKING").ok().as_deref() {
            Some("random") => RankingPolicy::Random { seed: env_parse("LABSCHED_RANKING_SEED") },
            _ => {
                let mut w = BestFitWeights::default();
                if let Some(v) = env_parse("LABSCHED_BESTFIT_CPU_WEIGHT") {
                    w.cpu = v;
                }
                if let Some(v) = env_parse("LABSCHED_BESTFIT_MEMORY_WEIGHT") {
                    w.memory = v;
                }
                if let Some(v) = env_parse("LABSCHED_BESTFIT_DISK_WEIGHT") {
                    w.disk = v;
                }
                if let Some(v) = env_parse("LABSCHED_BESTFIT_LOAD_WEIGHT") {
                    w.load = v;
                }
                RankingPolicy::BestFit(w)
            }
        };
        cfg.normalized()
    }

    /// Clamp block bounds into `1..=MAX_BLOCK_SIZE` with `min <= max`.
    pub fn normalized(mut self) -> Self {
        self.block_max = self.block_max.clamp(1, MAX_BLOCK_SIZE);
        self.block_min = self.block_min.clamp(1, self.block_max);
        self
    }

    pub fn readiness_timeout_ms(&self) -> Ms {
        self.readiness_timeout.as_millis() as Ms
    }
}

/// Initial catalog read from the JSON file named by `LABSCHED_CATALOG`.
#[derive(Debug, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default)]
    pub computers: Vec<Computer>,
}

impl CatalogSeed {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json).map_err(std::io::Error::other)
    }
}
