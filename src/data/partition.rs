use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

/// Mixes `base_seed` and `epoch` into one RNG seed (splitmix64 finalizer),
/// so consecutive epochs produce decorrelated shuffles.
pub fn epoch_seed(base_seed: u64, epoch: usize) -> u64 {
    let mut z = base_seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed for a worker's *local* validation iteration order. Rank-salted on
/// purpose: validation is never partitioned and needs no cross-worker
/// agreement.
pub fn validation_seed(base_seed: u64, rank: usize, epoch: usize) -> u64 {
    epoch_seed(base_seed ^ (rank as u64).wrapping_mul(0xA076_1D64_78BD_642F), epoch)
}

/// Returns the full index range `[0, dataset_size)` shuffled with `seed`.
pub fn shuffled_indices(dataset_size: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..dataset_size).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);
    order
}

/// Derives worker `rank`'s ordered slice of the training set for `epoch`.
///
/// Pure function of its arguments: every worker computes the same shuffled
/// order from `epoch_seed(base_seed, epoch)` and takes its own contiguous
/// chunk, so the group agrees on the partition with no communication.
///
/// Uneven-division policy: the shuffled order is padded by cyclic repetition
/// from its start until divisible by `world_size`. Equal-length chunks mean
/// every worker produces the same number of batches per epoch, which the
/// per-batch gradient synchronization barrier requires to not deadlock.
///
/// Properties:
/// - chunks are pairwise disjoint and cover the full index set (exactly when
///   `dataset_size % world_size == 0`, up to padding otherwise)
/// - all chunks have length `dataset_size.div_ceil(world_size)`
///
/// # Panics
/// - if `world_size` is zero or `rank >= world_size`
/// - if `dataset_size` is zero
pub fn derive_partition(
    dataset_size: usize,
    rank: usize,
    world_size: usize,
    base_seed: u64,
    epoch: usize,
) -> Vec<usize> {
    assert!(world_size > 0, "world_size must be > 0");
    assert!(rank < world_size, "rank out of range");
    assert!(dataset_size > 0, "dataset must be non-empty");

    let mut order = shuffled_indices(dataset_size, epoch_seed(base_seed, epoch));

    let chunk = dataset_size.div_ceil(world_size);
    let padded = chunk * world_size;
    for i in dataset_size..padded {
        let repeated = order[i - dataset_size];
        order.push(repeated);
    }

    order[rank * chunk..(rank + 1) * chunk].to_vec()
}
