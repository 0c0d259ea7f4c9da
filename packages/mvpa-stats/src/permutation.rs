//! Cluster-based permutation testing.
//!
//! Individually significant samples are grouped into connected clusters whose
//! mass (summed absolute statistic) is compared against the distribution of
//! the largest cluster mass obtained after randomly flipping the sign of each
//! subject's deviation from chance.

use ndarray::{Array2, ArrayD, ArrayViewD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::config::{StatsConfig, Tail};
use crate::connectivity::label_components;
use crate::error::{Result, StatsError};
use crate::profile_scope;
use crate::stat_test::StatTest;
use crate::types::ClusterSign;

/// A cluster found in the unpermuted data
#[derive(Debug, Clone, PartialEq)]
pub struct TestedCluster {
    pub sign: ClusterSign,
    /// Ascending row-major flat indices
    pub members: Vec<usize>,
    pub mass: f64,
    pub p_value: f64,
    /// `p_value <= cluster_pval`
    pub retained: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTestOutcome {
    /// Cluster p-value on members of retained clusters, 1 elsewhere
    pub p_values: ArrayD<f64>,
    pub significant: ArrayD<bool>,
    pub statistic: ArrayD<f64>,
    /// Every cluster of the unpermuted data, retained or not
    pub clusters: Vec<TestedCluster>,
    /// Permutations actually run; 0 when the data held no cluster to test
    pub n_permutations: usize,
    /// Base seed the permutation RNGs were derived from
    pub seed: u64,
}

/// Largest cluster mass per permutation, kept per direction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NullDistribution {
    pub positive: Vec<f64>,
    pub negative: Vec<f64>,
}

impl NullDistribution {
    fn maxima(&self, sign: ClusterSign) -> &[f64] {
        match sign {
            ClusterSign::Positive => &self.positive,
            ClusterSign::Negative => &self.negative,
        }
    }

    /// Add-one smoothed exceedance probability of `mass`
    pub fn p_value(&self, sign: ClusterSign, mass: f64) -> f64 {
        let maxima = self.maxima(sign);
        let exceed = maxima.iter().filter(|&&m| m >= mass).count();
        (exceed + 1) as f64 / (maxima.len() + 1) as f64
    }
}

pub struct ClusterPermutationTester<'a> {
    test: &'a dyn StatTest,
    indiv_pval: f64,
    cluster_pval: f64,
    tail: Tail,
    n_permutations: usize,
    seed: Option<u64>,
}

impl<'a> ClusterPermutationTester<'a> {
    pub fn new(test: &'a dyn StatTest, config: &StatsConfig) -> Self {
        Self {
            test,
            indiv_pval: config.indiv_pval,
            cluster_pval: config.cluster_pval,
            tail: config.tail,
            n_permutations: config.n_permutations,
            seed: config.seed,
        }
    }

    /// Run the test on `[subject, ...]` data.
    ///
    /// `mask` must match the non-subject dimensions of `indiv`.
    pub fn run(
        &self,
        indiv: ArrayViewD<f64>,
        chance: f64,
        mask: ArrayViewD<bool>,
    ) -> Result<ClusterTestOutcome> {
        profile_scope!("cluster permutation test");

        if indiv.ndim() < 2 {
            return Err(StatsError::ShapeMismatch(format!(
                "per-subject data needs at least 2 dimensions, got {:?}",
                indiv.shape()
            )));
        }
        let shape = indiv.shape()[1..].to_vec();
        if mask.shape() != shape.as_slice() {
            return Err(StatsError::ShapeMismatch(format!(
                "mask {:?} vs data {:?}",
                mask.shape(),
                shape
            )));
        }
        let n_subjects = indiv.len_of(Axis(0));
        if n_subjects < 2 {
            return Err(StatsError::InsufficientSubjects(n_subjects));
        }
        let n_samples: usize = shape.iter().product();

        let deviations = Array2::from_shape_vec(
            (n_subjects, n_samples),
            indiv.iter().map(|&x| x - chance).collect(),
        )
        .map_err(|e| StatsError::ShapeMismatch(e.to_string()))?;
        let mask: Vec<bool> = mask.iter().copied().collect();
        let critical = self.test.critical_value(n_subjects, self.tail, self.indiv_pval);

        let statistic = self.test.statistic(deviations.view(), 0.0)?;
        let stat = statistic.to_vec();
        let observed = find_clusters(&stat, &mask, &shape, critical, self.tail);

        let seed = self.seed.unwrap_or_else(|| rand::rng().random());
        log::info!(
            "Cluster test: {} subjects × {} samples, {} clusters at p < {} ({} tail), {} permutations, seed {}",
            n_subjects,
            n_samples,
            observed.len(),
            self.indiv_pval,
            self.tail,
            self.n_permutations,
            seed
        );

        let null = if observed.is_empty() {
            NullDistribution::default()
        } else {
            self.null_distribution(&deviations, &mask, &shape, critical, seed)?
        };

        let mut p_values = vec![1.0; n_samples];
        let mut significant = vec![false; n_samples];
        let clusters: Vec<TestedCluster> = observed
            .into_iter()
            .map(|c| {
                let p_value = null.p_value(c.sign, c.mass);
                let retained = p_value <= self.cluster_pval;
                if retained {
                    for &idx in &c.members {
                        p_values[idx] = p_value;
                        significant[idx] = true;
                    }
                }
                log::debug!(
                    "{:?} cluster of {} samples, mass {:.3}, p = {:.4}{}",
                    c.sign,
                    c.members.len(),
                    c.mass,
                    p_value,
                    if retained { " (retained)" } else { "" }
                );
                TestedCluster {
                    sign: c.sign,
                    members: c.members,
                    mass: c.mass,
                    p_value,
                    retained,
                }
            })
            .collect();

        let dim = IxDyn(&shape);
        let reshape = |e: ndarray::ShapeError| StatsError::ShapeMismatch(e.to_string());
        Ok(ClusterTestOutcome {
            p_values: ArrayD::from_shape_vec(dim.clone(), p_values).map_err(reshape)?,
            significant: ArrayD::from_shape_vec(dim.clone(), significant).map_err(reshape)?,
            statistic: ArrayD::from_shape_vec(dim, stat).map_err(reshape)?,
            clusters,
            n_permutations: null.positive.len(),
            seed,
        })
    }

    /// Build the max-mass null distribution from sign-flipped deviations.
    ///
    /// Each permutation draws its signs from its own RNG, seeded from
    /// `permutation_seeds`, so results do not depend on scheduling.
    pub(crate) fn null_distribution(
        &self,
        deviations: &Array2<f64>,
        mask: &[bool],
        shape: &[usize],
        critical: f64,
        seed: u64,
    ) -> Result<NullDistribution> {
        let maxima = permutation_seeds(seed, self.n_permutations)
            .into_par_iter()
            .map(|perm_seed| -> Result<(f64, f64)> {
                let mut rng = StdRng::seed_from_u64(perm_seed);
                let mut flipped = deviations.clone();
                for mut row in flipped.rows_mut() {
                    if rng.random_bool(0.5) {
                        row.mapv_inplace(|x| -x);
                    }
                }
                let statistic = self.test.statistic(flipped.view(), 0.0)?;
                let stat = statistic.to_vec();

                let mut max_pos: f64 = 0.0;
                let mut max_neg: f64 = 0.0;
                for c in find_clusters(&stat, mask, shape, critical, self.tail) {
                    match c.sign {
                        ClusterSign::Positive => max_pos = max_pos.max(c.mass),
                        ClusterSign::Negative => max_neg = max_neg.max(c.mass),
                    }
                }
                Ok((max_pos, max_neg))
            })
            .collect::<Result<Vec<_>>>()?;

        let (positive, negative) = maxima.into_iter().unzip();
        Ok(NullDistribution { positive, negative })
    }
}

/// Per-permutation seeds, drawn up front from a master RNG seeded with `seed`
pub(crate) fn permutation_seeds(seed: u64, n_permutations: usize) -> Vec<u64> {
    let mut master = StdRng::seed_from_u64(seed);
    (0..n_permutations).map(|_| master.random()).collect()
}

pub(crate) struct RawCluster {
    pub sign: ClusterSign,
    pub members: Vec<usize>,
    pub mass: f64,
}

/// Clusters of mask-eligible samples beyond `critical`, per direction allowed by `tail`
pub(crate) fn find_clusters(
    stat: &[f64],
    mask: &[bool],
    shape: &[usize],
    critical: f64,
    tail: Tail,
) -> Vec<RawCluster> {
    let mut clusters = Vec::new();

    let directions: &[ClusterSign] = match tail {
        Tail::Right => &[ClusterSign::Positive],
        Tail::Left => &[ClusterSign::Negative],
        Tail::Both => &[ClusterSign::Positive, ClusterSign::Negative],
    };

    for &sign in directions {
        let candidates: Vec<bool> = stat
            .iter()
            .zip(mask)
            .map(|(&s, &m)| {
                m && match sign {
                    ClusterSign::Positive => s > 0.0 && s >= critical,
                    ClusterSign::Negative => s < 0.0 && s <= -critical,
                }
            })
            .collect();

        for members in label_components(&candidates, shape) {
            let mass = members.iter().map(|&i| stat[i].abs()).sum();
            clusters.push(RawCluster {
                sign,
                members,
                mass,
            });
        }
    }

    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CorrectionMethod;
    use crate::stat_test::OneSampleTTest;
    use ndarray::{Array2, ArrayD, IxDyn};

    /// 8 subjects × 10 samples hovering around 0.5, shifted by `effect(sample)`
    fn fixture_with(effect: impl Fn(usize) -> f64) -> ArrayD<f64> {
        let n_subjects = 8;
        let n_samples = 10;
        let jitter = [-0.02, 0.01, 0.03, -0.01, 0.02, -0.03, 0.0, 0.015];
        let mut data = Array2::<f64>::zeros((n_subjects, n_samples));
        for s in 0..n_subjects {
            for t in 0..n_samples {
                let wobble = jitter[(s + t) % jitter.len()];
                data[[s, t]] = 0.5 + effect(t) + wobble;
            }
        }
        data.into_dyn()
    }

    /// Samples 3..6 sit well above chance
    fn fixture() -> ArrayD<f64> {
        fixture_with(|t| if (3..6).contains(&t) { 0.2 } else { 0.0 })
    }

    /// A rise on 1..4 and a dip on 6..9
    fn rise_and_dip() -> ArrayD<f64> {
        fixture_with(|t| match t {
            1..=3 => 0.2,
            6..=8 => -0.2,
            _ => 0.0,
        })
    }

    fn config(tail: Tail) -> StatsConfig {
        StatsConfig::default()
            .with_method(CorrectionMethod::ClusterBased)
            .with_tail(tail)
            .with_permutations(200)
            .with_seed(11)
    }

    #[test]
    fn test_finds_planted_cluster() {
        let data = fixture();
        let mask = ArrayD::from_elem(IxDyn(&[10]), true);
        let cfg = config(Tail::Right);
        let tester = ClusterPermutationTester::new(&OneSampleTTest, &cfg);
        let out = tester.run(data.view(), 0.5, mask.view()).unwrap();

        let retained: Vec<_> = out.clusters.iter().filter(|c| c.retained).collect();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].members, vec![3, 4, 5]);
        assert_eq!(retained[0].sign, ClusterSign::Positive);
        for t in 0..10 {
            assert_eq!(out.significant[[t]], (3..6).contains(&t), "sample {t}");
        }
        assert_eq!(out.p_values[[0]], 1.0);
        assert!(out.p_values[[4]] <= 0.05);
        assert_eq!(out.n_permutations, 200);
    }

    #[test]
    fn test_left_tail_ignores_positive_effect() {
        let data = fixture();
        let mask = ArrayD::from_elem(IxDyn(&[10]), true);
        let cfg = config(Tail::Left);
        let out = ClusterPermutationTester::new(&OneSampleTTest, &cfg)
            .run(data.view(), 0.5, mask.view())
            .unwrap();
        assert!(out.clusters.iter().all(|c| c.sign == ClusterSign::Negative));
        assert!(out.significant.iter().all(|&s| !s));
    }

    #[test]
    fn test_left_tail_finds_dip() {
        let data = fixture_with(|t| if (6..9).contains(&t) { -0.2 } else { 0.0 });
        let mask = ArrayD::from_elem(IxDyn(&[10]), true);
        let cfg = config(Tail::Left);
        let out = ClusterPermutationTester::new(&OneSampleTTest, &cfg)
            .run(data.view(), 0.5, mask.view())
            .unwrap();

        let retained: Vec<_> = out.clusters.iter().filter(|c| c.retained).collect();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].sign, ClusterSign::Negative);
        assert_eq!(retained[0].members, vec![6, 7, 8]);
        assert!(out.p_values[[7]] <= 0.05);
        assert!(out.statistic[[7]] < 0.0);
    }

    #[test]
    fn test_both_tails_retain_rise_and_dip() {
        let data = rise_and_dip();
        let mask = ArrayD::from_elem(IxDyn(&[10]), true);
        let cfg = config(Tail::Both);
        let out = ClusterPermutationTester::new(&OneSampleTTest, &cfg)
            .run(data.view(), 0.5, mask.view())
            .unwrap();

        let rise = out
            .clusters
            .iter()
            .find(|c| c.sign == ClusterSign::Positive)
            .expect("positive cluster");
        let dip = out
            .clusters
            .iter()
            .find(|c| c.sign == ClusterSign::Negative)
            .expect("negative cluster");
        assert_eq!(rise.members, vec![1, 2, 3]);
        assert_eq!(dip.members, vec![6, 7, 8]);
        assert!(rise.retained && rise.p_value <= 0.05);
        assert!(dip.retained && dip.p_value <= 0.05);
        for t in 0..10 {
            let expected = (1..4).contains(&t) || (6..9).contains(&t);
            assert_eq!(out.significant[[t]], expected, "sample {t}");
        }
    }

    #[test]
    fn test_dip_only_data_leaves_right_tail_empty() {
        let data = fixture_with(|t| if (6..9).contains(&t) { -0.2 } else { 0.0 });
        let mask = ArrayD::from_elem(IxDyn(&[10]), true);
        let cfg = config(Tail::Right);
        let out = ClusterPermutationTester::new(&OneSampleTTest, &cfg)
            .run(data.view(), 0.5, mask.view())
            .unwrap();
        assert!(out.significant.iter().all(|&s| !s));
    }

    #[test]
    fn test_adjacent_seeds_draw_independent_permutations() {
        let a = permutation_seeds(1, 1000);
        let b = permutation_seeds(2, 1000);
        assert_eq!(a, permutation_seeds(1, 1000));
        assert_eq!(a.iter().filter(|s| b.contains(s)).count(), 0);

        let data = fixture();
        let deviations = Array2::from_shape_vec(
            (8, 10),
            data.iter().map(|&x| x - 0.5).collect(),
        )
        .unwrap();
        let cfg = config(Tail::Right).with_permutations(1000);
        let tester = ClusterPermutationTester::new(&OneSampleTTest, &cfg);
        let critical = OneSampleTTest.critical_value(8, Tail::Right, 0.05);
        let null_a = tester
            .null_distribution(&deviations, &[true; 10], &[10], critical, 1)
            .unwrap();
        let null_b = tester
            .null_distribution(&deviations, &[true; 10], &[10], critical, 2)
            .unwrap();

        // one seed's stream must not be the other's shifted by one permutation
        let shifted = (0..999)
            .filter(|&i| null_b.positive[i] > 0.0 && null_a.positive[i + 1] == null_b.positive[i])
            .count();
        assert!(shifted < 100, "{shifted} shifted matches");
        assert_ne!(null_a, null_b);
    }

    #[test]
    fn test_fixed_seed_is_reproducible() {
        let data = fixture();
        let mask = ArrayD::from_elem(IxDyn(&[10]), true);
        let cfg = config(Tail::Both);
        let tester = ClusterPermutationTester::new(&OneSampleTTest, &cfg);
        let a = tester.run(data.view(), 0.5, mask.view()).unwrap();
        let b = tester.run(data.view(), 0.5, mask.view()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.seed, 11);
    }

    #[test]
    fn test_all_false_mask_gives_no_clusters() {
        let data = fixture();
        let mask = ArrayD::from_elem(IxDyn(&[10]), false);
        let cfg = config(Tail::Both);
        let out = ClusterPermutationTester::new(&OneSampleTTest, &cfg)
            .run(data.view(), 0.5, mask.view())
            .unwrap();
        assert!(out.clusters.is_empty());
        assert!(out.p_values.iter().all(|&p| p == 1.0));
        assert!(out.significant.iter().all(|&s| !s));
    }

    #[test]
    fn test_mask_splits_cluster() {
        let data = fixture();
        let mut mask = ArrayD::from_elem(IxDyn(&[10]), true);
        mask[[4]] = false;
        let cfg = config(Tail::Right);
        let out = ClusterPermutationTester::new(&OneSampleTTest, &cfg)
            .run(data.view(), 0.5, mask.view())
            .unwrap();
        assert!(!out.significant[[4]]);
        assert!(out.clusters.iter().all(|c| !c.members.contains(&4)));
        assert!(out.clusters.iter().any(|c| c.members == vec![3]));
        assert!(out.clusters.iter().any(|c| c.members == vec![5]));
    }

    #[test]
    fn test_permutation_without_clusters_contributes_zero() {
        // pure noise with an unreachable threshold: every permutation is empty
        let data = fixture();
        let deviations = Array2::from_shape_vec(
            (8, 10),
            data.iter().map(|&x| x - 0.5).collect(),
        )
        .unwrap();
        let cfg = config(Tail::Both);
        let tester = ClusterPermutationTester::new(&OneSampleTTest, &cfg);
        let null = tester
            .null_distribution(&deviations, &[true; 10], &[10], f64::INFINITY, 5)
            .unwrap();
        assert_eq!(null.positive.len(), 200);
        assert!(null.positive.iter().all(|&m| m == 0.0));
        assert!(null.negative.iter().all(|&m| m == 0.0));
    }

    #[test]
    fn test_null_p_value_is_add_one_smoothed() {
        let null = NullDistribution {
            positive: vec![1.0, 2.0, 3.0, 4.0],
            negative: vec![0.0; 4],
        };
        assert_eq!(null.p_value(ClusterSign::Positive, 10.0), 1.0 / 5.0);
        assert_eq!(null.p_value(ClusterSign::Positive, 3.0), 3.0 / 5.0);
        assert_eq!(null.p_value(ClusterSign::Negative, 0.5), 1.0 / 5.0);
    }

    #[test]
    fn test_two_dimensional_clusters() {
        // 8 subjects on a 4×4 generalization matrix with an effect in the top-left 2×2 block
        let mut data = ArrayD::<f64>::zeros(IxDyn(&[8, 4, 4]));
        let jitter = [-0.02, 0.01, 0.03, -0.01, 0.02, -0.03, 0.0, 0.015];
        for s in 0..8 {
            for i in 0..4 {
                for j in 0..4 {
                    let effect = if i < 2 && j < 2 { 0.25 } else { 0.0 };
                    data[[s, i, j]] = 0.5 + effect + jitter[(s + i + 2 * j) % 8];
                }
            }
        }
        let mask = ArrayD::from_elem(IxDyn(&[4, 4]), true);
        let cfg = config(Tail::Right);
        let out = ClusterPermutationTester::new(&OneSampleTTest, &cfg)
            .run(data.view(), 0.5, mask.view())
            .unwrap();
        let big = out
            .clusters
            .iter()
            .find(|c| c.members.len() == 4)
            .expect("2×2 block forms one cluster");
        assert_eq!(big.members, vec![0, 1, 4, 5]);
        assert!(big.retained);
    }

    #[test]
    fn test_rejects_single_subject_and_bad_mask() {
        let cfg = config(Tail::Both);
        let tester = ClusterPermutationTester::new(&OneSampleTTest, &cfg);
        let single = ArrayD::<f64>::zeros(IxDyn(&[1, 5]));
        let mask = ArrayD::from_elem(IxDyn(&[5]), true);
        assert!(matches!(
            tester.run(single.view(), 0.5, mask.view()),
            Err(StatsError::InsufficientSubjects(1))
        ));

        let data = fixture();
        let wrong = ArrayD::from_elem(IxDyn(&[9]), true);
        assert!(matches!(
            tester.run(data.view(), 0.5, wrong.view()),
            Err(StatsError::ShapeMismatch(_))
        ));
    }
}
