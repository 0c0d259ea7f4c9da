use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

use crate::config::{CorrectionMethod, Tail};
use crate::error::{Result, StatsError};

/// Decoding or amplitude metric stored in a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Metric {
    /// Proportion correct
    #[default]
    Accuracy,
    Auc,
    /// Hit rate minus false-alarm rate
    HitRateMinusFalseAlarm,
    DPrime,
    HitRate,
    FalseAlarmRate,
    MissRate,
    CorrectRejectionRate,
    /// Raw ERP amplitude
    Amplitude,
    /// Difference between two conditions
    Difference,
}

impl Metric {
    pub const ALL: &'static [Metric] = &[
        Self::Accuracy,
        Self::Auc,
        Self::HitRateMinusFalseAlarm,
        Self::DPrime,
        Self::HitRate,
        Self::FalseAlarmRate,
        Self::MissRate,
        Self::CorrectRejectionRate,
        Self::Amplitude,
        Self::Difference,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::Auc => "auc",
            Self::HitRateMinusFalseAlarm => "hr-far",
            Self::DPrime => "dprime",
            Self::HitRate => "hr",
            Self::FalseAlarmRate => "far",
            Self::MissRate => "mr",
            Self::CorrectRejectionRate => "cr",
            Self::Amplitude => "amplitude",
            Self::Difference => "difference",
        }
    }

    /// Metrics whose null value is zero regardless of the number of conditions
    pub fn is_zero_centered(&self) -> bool {
        !matches!(self, Self::Accuracy | Self::Auc)
    }
}

impl FromStr for Metric {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| StatsError::UnknownMetric {
                got: s.to_string(),
                valid: Self::ALL
                    .iter()
                    .map(Metric::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

impl TryFrom<String> for Metric {
    type Error = StatsError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Metric> for String {
    fn from(value: Metric) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Analysis settings carried by a result from the upstream decoding step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSettings {
    pub metric: Metric,
    /// Overrides the metric-derived chance level
    #[serde(default)]
    pub chance: Option<f64>,
    pub n_conditions: usize,
    /// Time stamps (ms) per non-subject axis: test time, then train time
    #[serde(default)]
    pub times: Vec<Vec<f64>>,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            metric: Metric::default(),
            chance: None,
            n_conditions: 2,
            times: Vec::new(),
        }
    }
}

impl StatsSettings {
    /// Resolve the null-hypothesis baseline.
    ///
    /// Priority: explicit override, then 0 for zero-centered metrics,
    /// 0.5 for AUC, and `1 / n_conditions` otherwise.
    pub fn chance_level(&self) -> Result<f64> {
        if let Some(chance) = self.chance {
            return Ok(chance);
        }
        match self.metric {
            Metric::Auc => Ok(0.5),
            m if m.is_zero_centered() => Ok(0.0),
            _ => {
                if self.n_conditions == 0 {
                    return Err(StatsError::InvalidParameter(
                        "n_conditions must be positive to derive chance level".to_string(),
                    ));
                }
                Ok(1.0 / self.n_conditions as f64)
            }
        }
    }
}

/// Direction of a cluster's effect relative to chance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterSign {
    Positive,
    Negative,
}

/// One contiguous region of significant samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// First index along each non-subject axis
    pub start: Vec<usize>,
    /// Last index along each non-subject axis (inclusive)
    pub stop: Vec<usize>,
    /// Number of member samples
    pub extent: usize,
    /// Sum of absolute statistic values, when a statistic was available
    pub mass: Option<f64>,
    pub p_value: f64,
    #[serde(default)]
    pub start_time: Option<Vec<f64>>,
    #[serde(default)]
    pub stop_time: Option<Vec<f64>>,
    /// Row-major flat indices of the member samples, ascending
    pub members: Vec<usize>,
    /// Effect direction, when a statistic was available
    #[serde(default)]
    pub sign: Option<ClusterSign>,
}

/// Outcome of the group test attached to an averaged result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Significance {
    pub method: CorrectionMethod,
    pub tail: Tail,
    pub chance: f64,
    /// False for method `none` and for single-subject input
    pub tested: bool,
    pub p_values: ArrayD<f64>,
    pub significant: ArrayD<bool>,
    /// Per-sample test statistic, when a test ran
    pub statistic: Option<ArrayD<f64>>,
    pub clusters: Vec<Cluster>,
    /// Cluster-based only: every cluster of the unpermuted data with its
    /// permutation p-value, retained or not
    #[serde(default)]
    pub tested_clusters: Vec<Cluster>,
}

impl Significance {
    pub fn n_significant(&self) -> usize {
        self.significant.iter().filter(|&&s| s).count()
    }
}

/// Subject-level or group-level decoding outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResult {
    /// Group average, shaped `[test]` or `[test, train]`
    pub class_over_time: ArrayD<f64>,
    /// Per subject, shaped `[subject, test]` or `[subject, test, train]`
    pub indiv_class_over_time: ArrayD<f64>,
    pub cond_name: String,
    pub settings: StatsSettings,
    #[serde(default)]
    pub std_error: Option<ArrayD<f64>>,
    #[serde(default)]
    pub significance: Option<Significance>,
}

impl StatsResult {
    /// Build a result from per-subject data, deriving the group average
    pub fn from_subjects(
        indiv_class_over_time: ArrayD<f64>,
        cond_name: impl Into<String>,
        settings: StatsSettings,
    ) -> Result<Self> {
        if indiv_class_over_time.ndim() < 2 || indiv_class_over_time.shape()[0] == 0 {
            return Err(StatsError::ShapeMismatch(format!(
                "per-subject data needs a non-empty subject axis plus at least one more axis, got shape {:?}",
                indiv_class_over_time.shape()
            )));
        }
        let class_over_time = indiv_class_over_time
            .mean_axis(Axis(0))
            .ok_or_else(|| StatsError::ShapeMismatch("empty subject axis".to_string()))?;

        Ok(Self {
            class_over_time,
            indiv_class_over_time,
            cond_name: cond_name.into(),
            settings,
            std_error: None,
            significance: None,
        })
    }

    pub fn n_subjects(&self) -> usize {
        self.indiv_class_over_time.shape().first().copied().unwrap_or(0)
    }

    /// Non-subject dimensions
    pub fn sample_shape(&self) -> &[usize] {
        self.indiv_class_over_time.shape().get(1..).unwrap_or(&[])
    }

    /// Check the subject-array / average-array invariant
    pub fn validate(&self) -> Result<()> {
        if self.indiv_class_over_time.ndim() < 2 || self.n_subjects() == 0 {
            return Err(StatsError::ShapeMismatch(format!(
                "'{}': per-subject data has shape {:?}",
                self.cond_name,
                self.indiv_class_over_time.shape()
            )));
        }
        if self.sample_shape() != self.class_over_time.shape() {
            return Err(StatsError::ShapeMismatch(format!(
                "'{}': per-subject dims {:?} do not match average dims {:?}",
                self.cond_name,
                self.sample_shape(),
                self.class_over_time.shape()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn settings(metric: Metric, n_conditions: usize) -> StatsSettings {
        StatsSettings {
            metric,
            n_conditions,
            ..Default::default()
        }
    }

    #[test]
    fn test_chance_override_wins() {
        let mut s = settings(Metric::Auc, 4);
        s.chance = Some(0.3);
        assert_eq!(s.chance_level().unwrap(), 0.3);
    }

    #[test]
    fn test_chance_by_metric() {
        assert_eq!(settings(Metric::Auc, 4).chance_level().unwrap(), 0.5);
        assert_eq!(settings(Metric::Accuracy, 4).chance_level().unwrap(), 0.25);
        for metric in [
            Metric::HitRateMinusFalseAlarm,
            Metric::DPrime,
            Metric::HitRate,
            Metric::FalseAlarmRate,
            Metric::MissRate,
            Metric::CorrectRejectionRate,
            Metric::Amplitude,
            Metric::Difference,
        ] {
            assert_eq!(settings(metric, 4).chance_level().unwrap(), 0.0, "{metric}");
        }
    }

    #[test]
    fn test_chance_needs_conditions() {
        assert!(settings(Metric::Accuracy, 0).chance_level().is_err());
        // zero-centered metrics never look at the condition count
        assert_eq!(settings(Metric::DPrime, 0).chance_level().unwrap(), 0.0);
    }

    #[test]
    fn test_metric_names() {
        assert_eq!("hr-far".parse::<Metric>().unwrap(), Metric::HitRateMinusFalseAlarm);
        assert_eq!("AUC".parse::<Metric>().unwrap(), Metric::Auc);
        let err = "kappa".parse::<Metric>().unwrap_err();
        assert!(err.to_string().contains("dprime"));
    }

    #[test]
    fn test_from_subjects_averages() {
        let indiv = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![0.4, 0.5, 0.6, 0.6, 0.7, 0.8])
            .unwrap();
        let result = StatsResult::from_subjects(indiv, "faces", StatsSettings::default()).unwrap();
        assert_eq!(result.n_subjects(), 2);
        assert_eq!(result.sample_shape(), &[3]);
        let expected = [0.5, 0.6, 0.7];
        for (got, want) in result.class_over_time.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12);
        }
        assert!(result.validate().is_ok());
    }

    #[test]
    fn test_validate_catches_mismatch() {
        let indiv = ArrayD::<f64>::zeros(IxDyn(&[3, 4]));
        let mut result = StatsResult::from_subjects(indiv, "x", StatsSettings::default()).unwrap();
        result.class_over_time = ArrayD::zeros(IxDyn(&[5]));
        assert!(matches!(
            result.validate(),
            Err(StatsError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_from_subjects_rejects_flat_input() {
        let flat = ArrayD::<f64>::zeros(IxDyn(&[4]));
        assert!(StatsResult::from_subjects(flat, "x", StatsSettings::default()).is_err());
    }

    #[test]
    fn test_settings_json_names() {
        let json = r#"{"metric": "auc", "nConditions": 2}"#;
        let s: StatsSettings = serde_json::from_str(json).unwrap();
        assert_eq!(s.metric, Metric::Auc);
        assert!(s.times.is_empty());
        assert_eq!(s.chance, None);
    }
}
