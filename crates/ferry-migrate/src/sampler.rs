//! Size-stratified sampling
//!
//! A population is cut into small, medium and large strata at its size
//! terciles, using the nearest-rank method over sizes sorted ascending:
//!
//! ```text
//! b1 = sizes[ceil(n/3) - 1]     small:  size <= b1
//! b2 = sizes[ceil(2n/3) - 1]    medium: b1 < size <= b2
//!                               large:  size > b2
//! ```
//!
//! The `k` picks are spread across the strata in proportion to their
//! population with a floor of one per non-empty stratum. Within a stratum
//! items are ordered by (size, key) and picked at evenly spaced positions,
//! so the same population always yields the same sample. A seeded random
//! mode is available instead of the stride.

use crate::manifest::ManifestObject;
use crate::progress_store::ProgressRecord;
use crate::store::Unit;
use ferry_core::types::{SelectionMode, VerificationConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Something that can be sampled by size
pub trait SizedItem {
    /// Size used for stratification
    fn sample_size(&self) -> u64;

    /// Stable identity used to break size ties
    fn sample_key(&self) -> &str;
}

impl SizedItem for Unit {
    fn sample_size(&self) -> u64 {
        self.size_bytes
    }

    fn sample_key(&self) -> &str {
        &self.id
    }
}

impl SizedItem for ProgressRecord {
    fn sample_size(&self) -> u64 {
        self.snapshot.size_bytes
    }

    fn sample_key(&self) -> &str {
        &self.unit_id
    }
}

impl SizedItem for ManifestObject {
    fn sample_size(&self) -> u64 {
        self.size
    }

    fn sample_key(&self) -> &str {
        &self.path
    }
}

/// Size class of a stratum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stratum {
    Small,
    Medium,
    Large,
}

impl Stratum {
    pub const ALL: [Stratum; 3] = [Stratum::Small, Stratum::Medium, Stratum::Large];
}

impl fmt::Display for Stratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stratum::Small => "small",
            Stratum::Medium => "medium",
            Stratum::Large => "large",
        })
    }
}

/// One stratum of a drawn sample
#[derive(Debug, Clone)]
pub struct SampleStratum<T> {
    pub stratum: Stratum,

    /// Items of the population in this stratum
    pub population: usize,

    /// Picked items, ordered by (size, key)
    pub selected: Vec<T>,
}

/// A drawn sample
#[derive(Debug, Clone)]
pub struct Sample<T> {
    /// Small, medium and large, in that order
    pub strata: Vec<SampleStratum<T>>,

    /// Tercile cut points, absent for an empty population
    pub boundaries: Option<(u64, u64)>,
}

impl<T> Sample<T> {
    /// Total number of picked items
    pub fn len(&self) -> usize {
        self.strata.iter().map(|s| s.selected.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picked items, small stratum first
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.strata.iter().flat_map(|s| s.selected.iter())
    }

    pub fn into_items(self) -> Vec<T> {
        self.strata.into_iter().flat_map(|s| s.selected).collect()
    }

    /// Picked count of one stratum
    pub fn count(&self, stratum: Stratum) -> usize {
        self.strata
            .iter()
            .find(|s| s.stratum == stratum)
            .map(|s| s.selected.len())
            .unwrap_or(0)
    }
}

/// Nearest-rank tercile cut points of ascending `sorted_sizes`
pub fn tercile_boundaries(sorted_sizes: &[u64]) -> Option<(u64, u64)> {
    let n = sorted_sizes.len();
    if n == 0 {
        return None;
    }
    let rank = |numerator: usize| (numerator * n).div_ceil(3).max(1) - 1;
    Some((sorted_sizes[rank(1)], sorted_sizes[rank(2)]))
}

/// Split `k` picks across strata with the given populations.
///
/// Every non-empty stratum gets one pick when `k` allows it; the rest go by
/// largest remainder in proportion to population, never exceeding a
/// stratum's size. With fewer picks than non-empty strata the most
/// populous strata win.
pub fn allocate(populations: [usize; 3], k: usize) -> [usize; 3] {
    let n: usize = populations.iter().sum();
    if k >= n {
        return populations;
    }

    let non_empty: Vec<usize> = (0..3).filter(|&i| populations[i] > 0).collect();
    let mut alloc = [0usize; 3];

    if k < non_empty.len() {
        let mut by_size = non_empty;
        // Stable sort keeps the smaller stratum first on ties
        by_size.sort_by(|a, b| populations[*b].cmp(&populations[*a]));
        for &i in by_size.iter().take(k) {
            alloc[i] = 1;
        }
        return alloc;
    }

    for &i in &non_empty {
        alloc[i] = 1;
    }
    let remaining = k - non_empty.len();
    if remaining == 0 {
        return alloc;
    }

    // Integer shares first, then the leftover by largest fractional part
    let mut remainders: Vec<(usize, usize)> = Vec::new();
    let mut given = 0;
    for &i in &non_empty {
        let exact = remaining * populations[i];
        let share = (exact / n).min(populations[i] - alloc[i]);
        alloc[i] += share;
        given += share;
        remainders.push((exact % n, i));
    }
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let mut leftover = remaining - given;
    while leftover > 0 {
        let mut progressed = false;
        for &(_, i) in &remainders {
            if leftover == 0 {
                break;
            }
            if alloc[i] < populations[i] {
                alloc[i] += 1;
                leftover -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    alloc
}

/// Evenly spaced positions `floor((j + 0.5) * n / a)` for `j < a`
pub fn stride_positions(n: usize, a: usize) -> Vec<usize> {
    if a == 0 || n == 0 {
        return Vec::new();
    }
    let a = a.min(n);
    (0..a).map(|j| ((2 * j + 1) * n) / (2 * a)).collect()
}

/// Draws size-stratified samples
#[derive(Debug, Clone, Copy)]
pub struct StratifiedSampler {
    mode: SelectionMode,
    seed: Option<u64>,
}

impl Default for StratifiedSampler {
    fn default() -> Self {
        Self::new(SelectionMode::Stride, None)
    }
}

impl StratifiedSampler {
    pub fn new(mode: SelectionMode, seed: Option<u64>) -> Self {
        Self { mode, seed }
    }

    pub fn from_config(config: &VerificationConfig) -> Self {
        Self::new(config.selection, config.seed)
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// Draw at most `k` items from `population`
    pub fn sample<T: SizedItem + Clone>(&self, population: &[T], k: usize) -> Sample<T> {
        let mut ordered: Vec<&T> = population.iter().collect();
        ordered.sort_by(|a, b| {
            a.sample_size()
                .cmp(&b.sample_size())
                .then_with(|| a.sample_key().cmp(b.sample_key()))
        });

        let sizes: Vec<u64> = ordered.iter().map(|t| t.sample_size()).collect();
        let boundaries = tercile_boundaries(&sizes);

        let mut buckets: [Vec<&T>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        if let Some((b1, b2)) = boundaries {
            for item in ordered {
                let size = item.sample_size();
                let slot = if size <= b1 {
                    0
                } else if size <= b2 {
                    1
                } else {
                    2
                };
                buckets[slot].push(item);
            }
        }

        let populations = [buckets[0].len(), buckets[1].len(), buckets[2].len()];
        let alloc = allocate(populations, k);

        let mut rng = match (self.mode, self.seed) {
            (SelectionMode::Random, Some(seed)) => Some(StdRng::seed_from_u64(seed)),
            (SelectionMode::Random, None) => Some(StdRng::from_rng(&mut rand::rng())),
            (SelectionMode::Stride, _) => None,
        };

        let strata = Stratum::ALL
            .iter()
            .zip(buckets.iter())
            .zip(alloc)
            .map(|((stratum, bucket), wanted)| {
                let positions = match rng.as_mut() {
                    Some(rng) => {
                        let mut picked =
                            rand::seq::index::sample(rng, bucket.len(), wanted.min(bucket.len()))
                                .into_vec();
                        picked.sort_unstable();
                        picked
                    }
                    None => stride_positions(bucket.len(), wanted),
                };
                SampleStratum {
                    stratum: *stratum,
                    population: bucket.len(),
                    selected: positions.into_iter().map(|p| bucket[p].clone()).collect(),
                }
            })
            .collect();

        Sample { strata, boundaries }
    }
}
