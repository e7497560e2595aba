use arbor_core::rng::RngHandle;
use rand::RngCore;

#[test]
fn rng_emits_reproducible_sequence() {
    let mut rng_a = RngHandle::from_seed(1234);
    let mut rng_b = RngHandle::from_seed(1234);

    let seq_a: Vec<u64> = (0..100).map(|_| rng_a.next_u64()).collect();
    let seq_b: Vec<u64> = (0..100).map(|_| rng_b.next_u64()).collect();

    assert_eq!(seq_a, seq_b);
}

#[test]
fn cumulative_sampling_respects_weights() {
    let mut rng = RngHandle::substream(99, 0);
    let table = [1.0, 4.0];
    let hits = (0..20_000)
        .filter(|_| rng.sample_cumulative(&table) == 1)
        .count();
    let freq = hits as f64 / 20_000.0;
    assert!((freq - 0.75).abs() < 0.02, "frequency {freq}");
}
