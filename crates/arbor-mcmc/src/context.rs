use std::sync::Arc;

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::RngHandle;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::clock::{Clock, MonotonicClock, StepClock};
use crate::config::{ClockConfig, RunConfig};
use crate::determinism;

/// Per-run resources: the chain RNG, the optional evaluation pool and the
/// runtime clock. Created at run start and dropped when the run ends.
#[derive(Debug)]
pub struct RunContext {
    rng: RngHandle,
    pool: Option<ThreadPool>,
    clock: Arc<dyn Clock>,
    master_seed: u64,
}

impl RunContext {
    /// Builds the context for a fresh chain.
    pub fn new(config: &RunConfig, clock: Arc<dyn Clock>) -> Result<Self, ArborError> {
        let pool = if config.threads > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(config.threads)
                .thread_name(|idx| format!("arbor-eval-{idx}"))
                .build()
                .map_err(|err| {
                    ArborError::Config(
                        ErrorInfo::new("thread-pool", err.to_string())
                            .with_context("threads", config.threads.to_string()),
                    )
                })?;
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            rng: RngHandle::from_seed(determinism::chain_seed(config.seed)),
            pool,
            clock,
            master_seed: config.seed,
        })
    }

    /// Clock selected by the configuration.
    pub fn clock_for(config: &RunConfig) -> Arc<dyn Clock> {
        match config.runtime_clock {
            ClockConfig::Monotonic => Arc::new(MonotonicClock::new()),
            ClockConfig::Step { step_ms } => Arc::new(StepClock::new(step_ms)),
        }
    }

    /// Chain RNG.
    pub fn rng_mut(&mut self) -> &mut RngHandle {
        &mut self.rng
    }

    /// Evaluation pool, if more than one thread was requested.
    pub fn pool(&self) -> Option<&ThreadPool> {
        self.pool.as_ref()
    }

    /// Current reading of the runtime clock shared with the operators.
    pub fn now_ms(&self) -> f64 {
        self.clock.now_ms()
    }

    /// Master seed of the run.
    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Replaces the chain RNG with the stream used after resuming at `sample`.
    pub fn reseed_for_resume(&mut self, sample: i64) {
        self.rng = RngHandle::from_seed(determinism::resume_seed(self.master_seed, sample));
    }

    /// RNG for state initialisation.
    pub fn init_rng(&self) -> RngHandle {
        RngHandle::from_seed(determinism::init_seed(self.master_seed))
    }
}
