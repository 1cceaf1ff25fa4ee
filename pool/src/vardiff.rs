use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of share samples kept per worker.
pub const WINDOW_SIZE: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct VarDiffConfig {
    /// Difficulty handed out before any share has been seen.
    pub start_difficulty: u64,
    /// Desired average time between shares.
    pub target_share_time: Duration,
    /// Retarget never goes below `last / max_step_down`.
    pub max_step_down: u64,
    /// Retarget never goes above `last * max_step_up`.
    pub max_step_up: u64,
}

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            start_difficulty: 10_000,
            target_share_time: Duration::from_secs(5),
            max_step_down: 2,
            max_step_up: 5,
        }
    }
}

impl VarDiffConfig {
    pub fn with_start(start_difficulty: u64) -> Self {
        Self {
            start_difficulty: start_difficulty.max(1),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    elapsed_ms: u64,
    difficulty: u64,
}

/// Per-worker difficulty controller.
///
/// Keeps a FIFO window of `(elapsed, difficulty)` samples and derives an
/// estimated hashrate from it. The next target aims at one share every
/// `target_share_time`, bounded to a factor of the last target so a single
/// odd sample cannot swing the worker too far.
#[derive(Debug, Clone)]
pub struct VarDiffState {
    cfg: VarDiffConfig,
    samples: VecDeque<Sample>,
    last_sample: Instant,
    last_target: u64,
}

impl VarDiffState {
    pub fn new(cfg: VarDiffConfig) -> Self {
        Self::new_at(cfg, Instant::now())
    }

    pub fn new_at(cfg: VarDiffConfig, now: Instant) -> Self {
        Self {
            cfg,
            samples: VecDeque::with_capacity(WINDOW_SIZE),
            last_sample: now,
            last_target: cfg.start_difficulty.max(1),
        }
    }

    /// Record a share of `difficulty` arriving now.
    pub fn insert(&mut self, difficulty: u64) {
        self.insert_at(Instant::now(), difficulty);
    }

    /// Record a share of `difficulty` arriving at `now`. Elapsed time is
    /// measured from the previous sample, or from creation for the first.
    pub fn insert_at(&mut self, now: Instant, difficulty: u64) {
        let elapsed = now.saturating_duration_since(self.last_sample);
        self.last_sample = now;
        self.push(Sample {
            elapsed_ms: elapsed.as_millis().min(u64::MAX as u128) as u64,
            difficulty,
        });
    }

    fn push(&mut self, sample: Sample) {
        self.samples.push_back(sample);
        while self.samples.len() > WINDOW_SIZE {
            self.samples.pop_front();
        }
    }

    /// Estimated hashes per second, `round(1000 * sum(d) / sum(ms))`.
    pub fn hashrate(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }

        let (sum_d, sum_ms) = self
            .samples
            .iter()
            .fold((0u128, 0u128), |(d, ms), s| {
                (d + s.difficulty as u128, ms + s.elapsed_ms as u128)
            });

        // zero elapsed counts as 1ms
        let sum_ms = sum_ms.max(1);
        let rate = (2 * 1000 * sum_d + sum_ms) / (2 * sum_ms);
        rate.min(u64::MAX as u128) as u64
    }

    pub fn last_target(&self) -> u64 {
        self.last_target
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Next difficulty for this worker. With `commit` the value becomes the
    /// new last target; without it this is a read-only preview.
    pub fn next_target(&mut self, commit: bool) -> u64 {
        let next = self.preview();
        if commit {
            self.last_target = next;
        }
        next
    }

    pub fn preview(&self) -> u64 {
        let hashrate = self.hashrate();
        if hashrate == 0 {
            return self.last_target;
        }

        let proposed = hashrate.saturating_mul(self.cfg.target_share_time.as_secs().max(1));
        let step_down = self.cfg.max_step_down.max(1);
        let lower = (self.last_target + step_down / 2) / step_down;
        let upper = self.last_target.saturating_mul(self.cfg.max_step_up.max(1));

        proposed.clamp(lower.max(1), upper.max(1))
    }
}
