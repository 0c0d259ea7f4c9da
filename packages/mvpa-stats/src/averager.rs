//! Group averaging and significance testing.

use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn};

use crate::config::{CorrectionMethod, ReduceDims, StatsConfig};
use crate::error::{Result, StatsError};
use crate::fdr::FdrCorrector;
use crate::permutation::ClusterPermutationTester;
use crate::profile_scope;
use crate::pstruct::{tested_cluster_records, PStructBuilder};
use crate::stat_test::{OneSampleTTest, StatTest};
use crate::types::{Significance, StatsResult};

/// Average several results and attach a group test.
///
/// Shorthand for [`StatsAverager::new`] followed by
/// [`StatsAverager::average_and_test`].
pub fn average_and_test(results: &[StatsResult], config: &StatsConfig) -> Result<StatsResult> {
    StatsAverager::new(config).average_and_test(results)
}

/// Averages results elementwise and runs the configured correction
pub struct StatsAverager<'a> {
    config: &'a StatsConfig,
    test: &'a dyn StatTest,
}

impl<'a> StatsAverager<'a> {
    /// Averager using the one-sample t test
    pub fn new(config: &'a StatsConfig) -> Self {
        Self {
            config,
            test: &OneSampleTTest,
        }
    }

    pub fn with_test(config: &'a StatsConfig, test: &'a dyn StatTest) -> Self {
        Self { config, test }
    }

    /// Elementwise mean of the inputs, with standard error and dimension reduction
    /// applied but no test.
    pub fn average(&self, results: &[StatsResult]) -> Result<StatsResult> {
        let first = results.first().ok_or(StatsError::EmptyInput)?;
        for result in results {
            result.validate()?;
            if result.indiv_class_over_time.shape() != first.indiv_class_over_time.shape() {
                return Err(StatsError::ShapeMismatch(format!(
                    "'{}' has per-subject shape {:?}, '{}' has {:?}",
                    result.cond_name,
                    result.indiv_class_over_time.shape(),
                    first.cond_name,
                    first.indiv_class_over_time.shape()
                )));
            }
            if result.settings.metric != first.settings.metric {
                log::warn!(
                    "Averaging '{}' ({}) with '{}' ({}); keeping settings of the first",
                    result.cond_name,
                    result.settings.metric,
                    first.cond_name,
                    first.settings.metric
                );
            }
        }

        let n = results.len() as f64;
        let mut class_over_time = first.class_over_time.clone();
        let mut indiv_class_over_time = first.indiv_class_over_time.clone();
        for result in &results[1..] {
            class_over_time += &result.class_over_time;
            indiv_class_over_time += &result.indiv_class_over_time;
        }
        class_over_time /= n;
        indiv_class_over_time /= n;

        let mut settings = first.settings.clone();
        let (indiv_class_over_time, class_over_time, times) = reduce_dims(
            self.config.reduce_dims,
            indiv_class_over_time,
            class_over_time,
            &settings.times,
        )?;
        settings.times = times;

        let n_subjects = indiv_class_over_time.len_of(Axis(0));
        let std_error = if n_subjects > 1 {
            let sqrt_n = (n_subjects as f64).sqrt();
            Some(indiv_class_over_time.std_axis(Axis(0), 1.0).mapv(|sd| sd / sqrt_n))
        } else {
            None
        };

        Ok(StatsResult {
            class_over_time,
            indiv_class_over_time,
            cond_name: merge_names(results),
            settings,
            std_error,
            significance: None,
        })
    }

    /// Average the inputs and test the average against chance
    pub fn average_and_test(&self, results: &[StatsResult]) -> Result<StatsResult> {
        profile_scope!("average and test");
        self.config.validate()?;

        let mut averaged = self.average(results)?;
        let chance = averaged.settings.chance_level()?;
        let shape = averaged.sample_shape().to_vec();
        let n_subjects = averaged.n_subjects();

        let mask = match &self.config.mask {
            Some(mask) if mask.shape() != shape.as_slice() => {
                return Err(StatsError::ShapeMismatch(format!(
                    "mask {:?} vs data {:?}",
                    mask.shape(),
                    shape
                )));
            }
            Some(mask) => mask.clone(),
            None => ArrayD::from_elem(IxDyn(&shape), true),
        };

        log::info!(
            "Averaged {} result(s) into '{}': {} subjects, shape {:?}, chance {}, {} test, {} correction",
            results.len(),
            averaged.cond_name,
            n_subjects,
            shape,
            chance,
            self.test.name(),
            self.config.mpcompcor_method
        );

        let significance = if self.config.mpcompcor_method == CorrectionMethod::None {
            self.untested(chance, &shape, false)
        } else if n_subjects <= 1 {
            // no variance to test; p = 0 marks the whole mask significant
            log::warn!(
                "Only {} subject(s): no test performed, p-values set to 0",
                n_subjects
            );
            let mut significance = self.untested(chance, &shape, true);
            significance.significant = mask;
            significance.clusters = PStructBuilder::new(
                significance.significant.view(),
                significance.p_values.view(),
            )
            .with_times(&averaged.settings.times)
            .build()?;
            significance
        } else {
            self.test_against_chance(&averaged, chance, &mask)?
        };

        log::info!(
            "{} significant sample(s) in {} cluster(s)",
            significance.n_significant(),
            significance.clusters.len()
        );
        averaged.significance = Some(significance);
        Ok(averaged)
    }

    fn untested(&self, chance: f64, shape: &[usize], significant: bool) -> Significance {
        Significance {
            method: self.config.mpcompcor_method,
            tail: self.config.tail,
            chance,
            tested: false,
            p_values: ArrayD::zeros(IxDyn(shape)),
            significant: ArrayD::from_elem(IxDyn(shape), significant),
            statistic: None,
            clusters: Vec::new(),
            tested_clusters: Vec::new(),
        }
    }

    fn test_against_chance(
        &self,
        averaged: &StatsResult,
        chance: f64,
        mask: &ArrayD<bool>,
    ) -> Result<Significance> {
        let config = self.config;
        let shape = averaged.sample_shape();

        let times = &averaged.settings.times;
        let mut tested_clusters = Vec::new();

        let (p_values, significant, statistic) = match config.mpcompcor_method {
            CorrectionMethod::ClusterBased => {
                let outcome = ClusterPermutationTester::new(self.test, config).run(
                    averaged.indiv_class_over_time.view(),
                    chance,
                    mask.view(),
                )?;
                tested_clusters = tested_cluster_records(&outcome.clusters, shape, times);
                (outcome.p_values, outcome.significant, outcome.statistic)
            }
            CorrectionMethod::Uncorrected | CorrectionMethod::Fdr => {
                let data = subject_matrix(&averaged.indiv_class_over_time)?;
                let outcome = self
                    .test
                    .test(data.view(), chance, config.tail, config.indiv_pval)?;
                let raw_p = to_sample_shape(outcome.p_values, shape)?;
                let statistic = to_sample_shape(outcome.statistic, shape)?;

                if config.mpcompcor_method == CorrectionMethod::Fdr {
                    let fdr = FdrCorrector::new(config.cluster_pval).correct(raw_p.view(), mask.view())?;
                    (fdr.p_values, fdr.significant, statistic)
                } else {
                    let uncorrected = to_sample_shape(outcome.significant, shape)?;
                    let significant = ndarray::Zip::from(&uncorrected)
                        .and(mask)
                        .map_collect(|&s, &m| s && m);
                    let p_values = ndarray::Zip::from(&raw_p)
                        .and(mask)
                        .map_collect(|&p, &m| if m { p } else { 1.0 });
                    (p_values, significant, statistic)
                }
            }
            CorrectionMethod::None => return Ok(self.untested(chance, shape, false)),
        };

        let clusters = PStructBuilder::new(significant.view(), p_values.view())
            .with_statistic(statistic.view())
            .with_times(times)
            .build()?;

        Ok(Significance {
            method: config.mpcompcor_method,
            tail: config.tail,
            chance,
            tested: true,
            p_values,
            significant,
            statistic: Some(statistic),
            clusters,
            tested_clusters,
        })
    }
}

/// Shared name when all inputs agree, otherwise the names joined with " + "
fn merge_names(results: &[StatsResult]) -> String {
    let mut names: Vec<&str> = Vec::new();
    for result in results {
        if !names.contains(&result.cond_name.as_str()) {
            names.push(&result.cond_name);
        }
    }
    names.join(" + ")
}

/// `[subject, ...]` flattened to `[subject, sample]`
fn subject_matrix(indiv: &ArrayD<f64>) -> Result<Array2<f64>> {
    let n_subjects = indiv.len_of(Axis(0));
    let n_samples = indiv.len() / n_subjects.max(1);
    Array2::from_shape_vec((n_subjects, n_samples), indiv.iter().copied().collect())
        .map_err(|e| StatsError::ShapeMismatch(e.to_string()))
}

fn to_sample_shape<T: Clone>(values: Array1<T>, shape: &[usize]) -> Result<ArrayD<T>> {
    ArrayD::from_shape_vec(IxDyn(shape), values.to_vec())
        .map_err(|e| StatsError::ShapeMismatch(e.to_string()))
}

type Reduced = (ArrayD<f64>, ArrayD<f64>, Vec<Vec<f64>>);

/// Collapse `[subject, test, train]` data to a single time axis
fn reduce_dims(
    mode: ReduceDims,
    indiv: ArrayD<f64>,
    class: ArrayD<f64>,
    times: &[Vec<f64>],
) -> Result<Reduced> {
    if mode != ReduceDims::None && indiv.ndim() != 3 {
        log::warn!(
            "reduce_dims '{}' needs time×time data, got shape {:?}; left unchanged",
            mode,
            indiv.shape()
        );
        return Ok((indiv, class, times.to_vec()));
    }

    let axis_times = |axis: usize| -> Vec<Vec<f64>> {
        if times.len() == 2 {
            vec![times[axis].clone()]
        } else {
            Vec::new()
        }
    };
    let empty = || StatsError::ShapeMismatch("cannot average over an empty axis".to_string());

    match mode {
        ReduceDims::AvTrain => Ok((
            indiv.mean_axis(Axis(2)).ok_or_else(empty)?,
            class.mean_axis(Axis(1)).ok_or_else(empty)?,
            axis_times(0),
        )),
        ReduceDims::AvTest => Ok((
            indiv.mean_axis(Axis(1)).ok_or_else(empty)?,
            class.mean_axis(Axis(0)).ok_or_else(empty)?,
            axis_times(1),
        )),
        ReduceDims::Diag => {
            let (n_subjects, n_test, n_train) = (indiv.shape()[0], indiv.shape()[1], indiv.shape()[2]);
            if n_test != n_train {
                return Err(StatsError::ShapeMismatch(format!(
                    "diagonal needs a square time×time matrix, got {}×{}",
                    n_test, n_train
                )));
            }
            let indiv_diag = Array2::from_shape_fn((n_subjects, n_test), |(s, t)| indiv[[s, t, t]]);
            let class_diag = Array1::from_shape_fn(n_test, |t| class[[t, t]]);
            Ok((indiv_diag.into_dyn(), class_diag.into_dyn(), axis_times(0)))
        }
        ReduceDims::None => Ok((indiv, class, times.to_vec())),
    }
}
