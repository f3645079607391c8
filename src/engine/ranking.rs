use std::sync::{Arc, Mutex};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use ulid::Ulid;

use crate::config::RankingPolicy;
use crate::model::{HardwareSpec, Image};

/// An eligible computer confirmed free for the requested window.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateComputer {
    pub computer_id: Ulid,
    pub spec: HardwareSpec,
    /// Live reservations currently held by the computer.
    pub load: usize,
    /// Strategy-assigned score; lower ranks first. Zero for random ranking.
    pub score: f64,
}

/// Orders candidates best-first. Chosen once at configuration time.
pub trait RankingStrategy: Send + Sync + std::fmt::Debug {
    fn rank(&self, image: &Image, candidates: &mut [CandidateComputer]);

    fn name(&self) -> &'static str;
}

pub fn build_strategy(policy: &RankingPolicy) -> Arc<dyn RankingStrategy> {
    match policy {
        RankingPolicy::Random { seed: Some(seed) } => Arc::new(RandomRanking::seeded(*seed)),
        RankingPolicy::Random { seed: None } => Arc::new(RandomRanking::new()),
        RankingPolicy::BestFit(weights) => Arc::new(BestFitRanking::new(*weights)),
    }
}

/// Uniform shuffle of all free candidates.
#[derive(Debug)]
pub struct RandomRanking {
    rng: Mutex<StdRng>,
}

impl Default for RandomRanking {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomRanking {
    pub fn new() -> Self {
        Self { rng: Mutex::new(StdRng::from_entropy()) }
    }

    pub fn seeded(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }
}

impl RankingStrategy for RandomRanking {
    fn rank(&self, _image: &Image, candidates: &mut [CandidateComputer]) {
        // Start from a fixed order so a seeded rng is reproducible.
        candidates.sort_by_key(|c| c.computer_id);
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        candidates.shuffle(&mut *rng);
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Per-axis weights of the best-fit score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestFitWeights {
    /// Per surplus core.
    pub cpu: f64,
    /// Per surplus GiB of memory.
    pub memory: f64,
    /// Per surplus GB of disk.
    pub disk: f64,
    /// Per live reservation already on the computer.
    pub load: f64,
}

impl Default for BestFitWeights {
    fn default() -> Self {
        Self { cpu: 1.0, memory: 0.5, disk: 0.01, load: 2.0 }
    }
}

/// Closest spec match above the image requirement, then least loaded,
/// then lowest computer id.
#[derive(Debug, Clone)]
pub struct BestFitRanking {
    weights: BestFitWeights,
}

impl BestFitRanking {
    pub fn new(weights: BestFitWeights) -> Self {
        Self { weights }
    }

    pub fn score(&self, required: &HardwareSpec, candidate: &CandidateComputer) -> f64 {
        let w = &self.weights;
        let spec = &candidate.spec;
        let cpu = spec.cpu_cores.saturating_sub(required.cpu_cores) as f64;
        let memory = spec.memory_mb.saturating_sub(required.memory_mb) as f64 / 1024.0;
        let disk = spec.disk_gb.saturating_sub(required.disk_gb) as f64;
        w.cpu * cpu + w.memory * memory + w.disk * disk + w.load * candidate.load as f64
    }
}

impl RankingStrategy for BestFitRanking {
    fn rank(&self, image: &Image, candidates: &mut [CandidateComputer]) {
        for c in candidates.iter_mut() {
            c.score = self.score(&image.requirements, c);
        }
        candidates.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.computer_id.cmp(&b.computer_id))
        });
    }

    fn name(&self) -> &'static str {
        "best_fit"
    }
}
