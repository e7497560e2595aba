use arbor_core::derive_substream_seed;

const CHAIN_STREAM: u64 = 0;
const INIT_STREAM: u64 = 1;
const RESUME_STREAM_BASE: u64 = 2;

/// Seed of the main chain stream.
pub fn chain_seed(master_seed: u64) -> u64 {
    derive_substream_seed(master_seed, CHAIN_STREAM)
}

/// Seed used by state initialisers.
pub fn init_seed(master_seed: u64) -> u64 {
    derive_substream_seed(master_seed, INIT_STREAM)
}

/// Seed of the chain stream after resuming from a checkpoint written at
/// `sample`.
pub fn resume_seed(master_seed: u64, sample: i64) -> u64 {
    derive_substream_seed(master_seed, RESUME_STREAM_BASE.wrapping_add(sample as u64))
}
