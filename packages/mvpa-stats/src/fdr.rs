//! False discovery rate control under arbitrary dependence
//! (Benjamini & Yekutieli, 2001).

use ndarray::{ArrayD, ArrayViewD};

use crate::error::{Result, StatsError};

#[derive(Debug, Clone, PartialEq)]
pub struct FdrOutcome {
    /// Raw p-value where significant, 1 elsewhere
    pub p_values: ArrayD<f64>,
    pub significant: ArrayD<bool>,
    /// Largest p-value still declared significant
    pub critical_p: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct FdrCorrector {
    /// Target false discovery rate
    pub q: f64,
}

impl FdrCorrector {
    pub fn new(q: f64) -> Self {
        Self { q }
    }

    /// Dependence correction constant c(m) = sum_{i=1..m} 1/i
    pub fn dependence_constant(m: usize) -> f64 {
        (1..=m).map(|i| 1.0 / i as f64).sum()
    }

    /// Apply the procedure to the mask-eligible p-values.
    ///
    /// Samples outside the mask take no part in the ranking and come back
    /// with p = 1.
    pub fn correct(&self, p_values: ArrayViewD<f64>, mask: ArrayViewD<bool>) -> Result<FdrOutcome> {
        if p_values.shape() != mask.shape() {
            return Err(StatsError::ShapeMismatch(format!(
                "p-value map {:?} vs mask {:?}",
                p_values.shape(),
                mask.shape()
            )));
        }

        let mut eligible: Vec<f64> = p_values
            .iter()
            .zip(mask.iter())
            .filter(|&(p, &m)| m && !p.is_nan())
            .map(|(&p, _)| p)
            .collect();
        eligible.sort_by(|a, b| a.total_cmp(b));

        let m = eligible.len();
        let scale = self.q / (m as f64 * Self::dependence_constant(m));
        let critical_p = eligible
            .iter()
            .enumerate()
            .filter(|&(i, &p)| p <= (i + 1) as f64 * scale)
            .map(|(_, &p)| p)
            .last();

        log::debug!(
            "FDR (q={}): {} eligible samples, critical p = {:?}",
            self.q,
            m,
            critical_p
        );

        let significant = ndarray::Zip::from(&p_values)
            .and(&mask)
            .map_collect(|&p, &m| m && critical_p.is_some_and(|crit| p <= crit));
        let corrected = ndarray::Zip::from(&p_values)
            .and(&significant)
            .map_collect(|&p, &sig| if sig { p } else { 1.0 });

        Ok(FdrOutcome {
            p_values: corrected,
            significant,
            critical_p,
        })
    }
}
