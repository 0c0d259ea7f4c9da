//! Cluster summaries for reporting.

use ndarray::ArrayViewD;

use crate::connectivity::{label_components, unravel};
use crate::error::{Result, StatsError};
use crate::permutation::TestedCluster;
use crate::types::{Cluster, ClusterSign};

/// Turns a final significance map into an onset-ordered list of [`Cluster`]s.
///
/// With a statistic, positive and negative samples are labelled separately,
/// so opposite effects that touch stay two clusters. The builder only reads
/// its inputs.
pub struct PStructBuilder<'a> {
    significant: ArrayViewD<'a, bool>,
    p_values: ArrayViewD<'a, f64>,
    statistic: Option<ArrayViewD<'a, f64>>,
    times: Option<&'a [Vec<f64>]>,
}

impl<'a> PStructBuilder<'a> {
    pub fn new(significant: ArrayViewD<'a, bool>, p_values: ArrayViewD<'a, f64>) -> Self {
        Self {
            significant,
            p_values,
            statistic: None,
            times: None,
        }
    }

    /// Fill each cluster's mass and sign from a per-sample statistic
    pub fn with_statistic(mut self, statistic: ArrayViewD<'a, f64>) -> Self {
        self.statistic = Some(statistic);
        self
    }

    /// Per-axis time stamps; ignored unless they cover every axis exactly
    pub fn with_times(mut self, times: &'a [Vec<f64>]) -> Self {
        self.times = Some(times);
        self
    }

    pub fn build(&self) -> Result<Vec<Cluster>> {
        let shape = self.significant.shape();
        if self.p_values.shape() != shape {
            return Err(StatsError::ShapeMismatch(format!(
                "p-value map {:?} vs significance map {:?}",
                self.p_values.shape(),
                shape
            )));
        }
        if let Some(stat) = &self.statistic {
            if stat.shape() != shape {
                return Err(StatsError::ShapeMismatch(format!(
                    "statistic map {:?} vs significance map {:?}",
                    stat.shape(),
                    shape
                )));
            }
        }

        let times = self.times.and_then(|times| usable_times(times, shape));
        let mask: Vec<bool> = self.significant.iter().copied().collect();
        let p_values: Vec<f64> = self.p_values.iter().copied().collect();
        let statistic: Option<Vec<f64>> = self.statistic.as_ref().map(|s| s.iter().copied().collect());

        let groups: Vec<(Option<ClusterSign>, Vec<usize>)> = match &statistic {
            Some(stat) => [ClusterSign::Positive, ClusterSign::Negative]
                .into_iter()
                .flat_map(|sign| {
                    let side: Vec<bool> = mask
                        .iter()
                        .zip(stat)
                        .map(|(&m, &s)| {
                            m && match sign {
                                ClusterSign::Positive => s >= 0.0 || s.is_nan(),
                                ClusterSign::Negative => s < 0.0,
                            }
                        })
                        .collect();
                    label_components(&side, shape)
                        .into_iter()
                        .map(move |members| (Some(sign), members))
                })
                .collect(),
            None => label_components(&mask, shape)
                .into_iter()
                .map(|members| (None, members))
                .collect(),
        };

        let mut clusters: Vec<Cluster> = groups
            .into_iter()
            .map(|(sign, members)| {
                let p_value = members
                    .iter()
                    .map(|&i| p_values[i])
                    .fold(f64::INFINITY, f64::min);
                let mass = statistic
                    .as_ref()
                    .map(|stat| members.iter().map(|&i| stat[i].abs()).sum::<f64>());
                summarize(members, shape, sign, p_value, mass, times)
            })
            .collect();

        clusters.sort_by(|a, b| a.start.cmp(&b.start));
        Ok(clusters)
    }
}

/// Records for every cluster a permutation test examined, in onset order
pub fn tested_cluster_records(
    tested: &[TestedCluster],
    shape: &[usize],
    times: &[Vec<f64>],
) -> Vec<Cluster> {
    let times = usable_times(times, shape);
    let mut clusters: Vec<Cluster> = tested
        .iter()
        .map(|c| {
            summarize(
                c.members.clone(),
                shape,
                Some(c.sign),
                c.p_value,
                Some(c.mass),
                times,
            )
        })
        .collect();
    clusters.sort_by(|a, b| a.start.cmp(&b.start));
    clusters
}

fn usable_times<'t>(times: &'t [Vec<f64>], shape: &[usize]) -> Option<&'t [Vec<f64>]> {
    let covers = times.len() == shape.len() && times.iter().zip(shape).all(|(t, &len)| t.len() == len);
    covers.then_some(times)
}

fn summarize(
    members: Vec<usize>,
    shape: &[usize],
    sign: Option<ClusterSign>,
    p_value: f64,
    mass: Option<f64>,
    times: Option<&[Vec<f64>]>,
) -> Cluster {
    let mut start = vec![usize::MAX; shape.len()];
    let mut stop = vec![0; shape.len()];
    for &idx in &members {
        for (axis, coord) in unravel(idx, shape).into_iter().enumerate() {
            start[axis] = start[axis].min(coord);
            stop[axis] = stop[axis].max(coord);
        }
    }

    let stamp = |index: &[usize]| -> Option<Vec<f64>> {
        times.map(|times| {
            index
                .iter()
                .zip(times)
                .map(|(&i, axis_times)| axis_times[i])
                .collect()
        })
    };

    Cluster {
        start_time: stamp(&start),
        stop_time: stamp(&stop),
        start,
        stop,
        extent: members.len(),
        mass,
        p_value,
        members,
        sign,
    }
}
