//! Seeded train/test partitioning.

use rand::{seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

impl Split {
    /// Map a split of `0..subset.len()` back onto the indices in `subset`.
    pub fn within(subset: &[usize], ratio: f32, seed: u64) -> Split {
        let local = train_test_split(subset.len(), ratio, seed);
        Split {
            train: local.train.into_iter().map(|i| subset[i]).collect(),
            test: local.test.into_iter().map(|i| subset[i]).collect(),
        }
    }
}

/// Shuffle `0..n` with a seeded RNG and hold out `ceil(n * test_ratio)` indices.
///
/// With `n >= 2` both partitions are non-empty.
pub fn train_test_split(n: usize, test_ratio: f32, seed: u64) -> Split {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let ratio = test_ratio.clamp(0.0, 1.0);
    // 10 * 0.2 must stay 2 under f32 error.
    let mut n_test = (n as f32 * ratio - 1e-4).ceil().max(0.0) as usize;
    if n >= 2 {
        n_test = n_test.clamp(1, n - 1);
    } else {
        n_test = n_test.min(n);
    }
    let test = indices[..n_test].to_vec();
    let train = indices[n_test..].to_vec();
    Split { train, test }
}
