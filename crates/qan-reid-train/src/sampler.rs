//! Frame selection within a tracklet and tracklet selection within a batch.
//!
//! - [`sample_frame_indices`] resamples a tracklet of any length to exactly
//!   `seq_len` frame indices, either as a random contiguous window with
//!   cyclic padding (training) or evenly strided (evaluation).
//! - [`IdentitySampler`] builds identity-balanced training batches of
//!   `P = B / K` identities with `K` tracklets each, so every anchor in the
//!   triplet loss has both positives and negatives.
//! - [`sequential_plan`] splits an evaluation split into ordered batches.
//!
//! All randomness comes from seeded [`StdRng`]s, so a given seed and epoch
//! always produce the same plan regardless of thread scheduling.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

use crate::dataset::Tracklet;
use crate::error::DatasetError;

// ---------------------------------------------------------------------------
// Frame sampling
// ---------------------------------------------------------------------------

/// How `seq_len` frames are picked from a tracklet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSampling {
    /// Random contiguous window; shorter tracklets repeat cyclically.
    Random,
    /// Evenly strided over the tracklet; shorter tracklets repeat their
    /// last frame.
    Evenly,
}

/// Pick exactly `seq_len` indices into a tracklet of `num_frames` frames.
///
/// Returns an empty vector when `num_frames == 0`.
///
/// ```rust
/// use qan_reid_train::sampler::{sample_frame_indices, FrameSampling};
/// use rand::SeedableRng;
///
/// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
/// assert_eq!(sample_frame_indices(10, 4, FrameSampling::Evenly, &mut rng), vec![0, 2, 4, 6]);
/// assert_eq!(sample_frame_indices(2, 4, FrameSampling::Evenly, &mut rng), vec![0, 1, 1, 1]);
/// ```
pub fn sample_frame_indices<R: Rng + ?Sized>(
    num_frames: usize,
    seq_len: usize,
    sampling: FrameSampling,
    rng: &mut R,
) -> Vec<usize> {
    if num_frames == 0 || seq_len == 0 {
        return Vec::new();
    }
    match sampling {
        FrameSampling::Random => {
            let last_start = num_frames.saturating_sub(seq_len + 1);
            let begin = rng.gen_range(0..=last_start);
            let end = (begin + seq_len).min(num_frames);
            (begin..end).cycle().take(seq_len).collect()
        }
        FrameSampling::Evenly => {
            if num_frames >= seq_len {
                let step = (num_frames - num_frames % seq_len) / seq_len;
                (0..seq_len).map(|i| i * step).collect()
            } else {
                (0..seq_len).map(|i| i.min(num_frames - 1)).collect()
            }
        }
    }
}

/// Derive a stream seed from a base seed and two counters (epoch, batch).
pub(crate) fn mix_seed(seed: u64, a: u64, b: u64) -> u64 {
    // SplitMix64 finaliser over the combined words.
    let mut z = seed
        ^ a.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ b.wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

// ---------------------------------------------------------------------------
// IdentitySampler
// ---------------------------------------------------------------------------

/// Identity-balanced batch planner for the training split.
///
/// Each epoch visits every identity once in a shuffled order and draws
/// `num_instances` of its tracklets, with replacement when it has fewer.
/// The resulting index stream is cut into batches of `batch_size`; an
/// incomplete final batch is dropped.
#[derive(Debug, Clone)]
pub struct IdentitySampler {
    by_identity: Vec<Vec<usize>>,
    num_instances: usize,
    batch_size: usize,
    seed: u64,
}

impl IdentitySampler {
    /// Index `tracklets` by identity.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::NotEnoughIdentities`] when fewer than
    /// `batch_size / num_instances` identities exist, since no batch could
    /// then be formed.
    pub fn new(
        tracklets: &[Tracklet],
        batch_size: usize,
        num_instances: usize,
        seed: u64,
    ) -> Result<Self, DatasetError> {
        let mut index: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, t) in tracklets.iter().enumerate() {
            index.entry(t.pid).or_default().push(i);
        }
        let required = batch_size / num_instances.max(1);
        if index.len() < required.max(1) {
            return Err(DatasetError::NotEnoughIdentities {
                required: required.max(1),
                available: index.len(),
            });
        }
        Ok(IdentitySampler {
            by_identity: index.into_values().collect(),
            num_instances: num_instances.max(1),
            batch_size,
            seed,
        })
    }

    /// Number of distinct identities.
    pub fn num_identities(&self) -> usize {
        self.by_identity.len()
    }

    /// Complete batches produced per epoch.
    pub fn num_batches(&self) -> usize {
        (self.by_identity.len() * self.num_instances) / self.batch_size.max(1)
    }

    /// Tracklet indices for every batch of `epoch`.
    pub fn epoch_plan(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut rng = StdRng::seed_from_u64(mix_seed(self.seed, epoch as u64, u64::MAX));
        let mut order: Vec<usize> = (0..self.by_identity.len()).collect();
        order.shuffle(&mut rng);

        let mut stream = Vec::with_capacity(order.len() * self.num_instances);
        for id in order {
            let pool = &self.by_identity[id];
            if pool.len() >= self.num_instances {
                stream.extend(pool.choose_multiple(&mut rng, self.num_instances).copied());
            } else {
                for _ in 0..self.num_instances {
                    if let Some(&i) = pool.choose(&mut rng) {
                        stream.push(i);
                    }
                }
            }
        }
        stream
            .chunks_exact(self.batch_size.max(1))
            .map(<[usize]>::to_vec)
            .collect()
    }
}

/// Ordered batches over `0..len`; the last batch may be short.
pub fn sequential_plan(len: usize, batch_size: usize) -> Vec<Vec<usize>> {
    let indices: Vec<usize> = (0..len).collect();
    indices.chunks(batch_size.max(1)).map(<[usize]>::to_vec).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn tracklets(counts: &[usize]) -> Vec<Tracklet> {
        counts
            .iter()
            .enumerate()
            .flat_map(|(pid, &n)| {
                (0..n).map(move |_| Tracklet { frames: vec![PathBuf::from("f")], pid, camid: 0 })
            })
            .collect()
    }

    #[test]
    fn random_window_is_contiguous() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..50 {
            let idx = sample_frame_indices(20, 6, FrameSampling::Random, &mut rng);
            assert_eq!(idx.len(), 6);
            assert!(idx.windows(2).all(|w| w[1] == w[0] + 1), "{idx:?}");
            assert!(idx[0] <= 13);
        }
    }

    #[test]
    fn random_pads_cyclically() {
        let mut rng = StdRng::seed_from_u64(0);
        let idx = sample_frame_indices(3, 8, FrameSampling::Random, &mut rng);
        assert_eq!(idx, vec![0, 1, 2, 0, 1, 2, 0, 1]);
    }

    #[test]
    fn evenly_strides_and_truncates() {
        let mut rng = StdRng::seed_from_u64(0);
        // 23 frames, S = 5: truncated to 20, stride 4.
        assert_eq!(
            sample_frame_indices(23, 5, FrameSampling::Evenly, &mut rng),
            vec![0, 4, 8, 12, 16]
        );
        assert_eq!(
            sample_frame_indices(5, 5, FrameSampling::Evenly, &mut rng),
            vec![0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn empty_tracklet_gives_no_indices() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sample_frame_indices(0, 4, FrameSampling::Random, &mut rng).is_empty());
    }

    #[test]
    fn identity_batches_are_balanced() {
        let ts = tracklets(&[3, 5, 1, 4, 2, 6]);
        let sampler = IdentitySampler::new(&ts, 4, 2, 7).unwrap();
        assert_eq!(sampler.num_identities(), 6);
        assert_eq!(sampler.num_batches(), 3);

        let plan = sampler.epoch_plan(0);
        assert_eq!(plan.len(), 3);
        for batch in &plan {
            let mut per_pid: HashMap<usize, usize> = HashMap::new();
            for &i in batch {
                *per_pid.entry(ts[i].pid).or_default() += 1;
            }
            assert_eq!(per_pid.len(), 2, "batch {batch:?}");
            assert!(per_pid.values().all(|&c| c == 2));
        }
    }

    #[test]
    fn plans_are_seeded_per_epoch() {
        let ts = tracklets(&[4, 4, 4, 4]);
        let sampler = IdentitySampler::new(&ts, 4, 2, 1).unwrap();
        assert_eq!(sampler.epoch_plan(3), sampler.epoch_plan(3));
        let distinct = (0..8).map(|e| sampler.epoch_plan(e)).collect::<std::collections::HashSet<_>>();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn too_few_identities_is_an_error() {
        let ts = tracklets(&[4, 4]);
        let err = IdentitySampler::new(&ts, 16, 4, 1).unwrap_err();
        assert!(matches!(err, DatasetError::NotEnoughIdentities { required: 4, available: 2 }));
    }

    #[test]
    fn sequential_plan_keeps_the_tail() {
        assert_eq!(sequential_plan(5, 2), vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert!(sequential_plan(0, 3).is_empty());
    }
}
