//! Exposure times that grow as a power of photoelectron wavenumber.
//!
//! The N-th exposure is `base_time * ((k_start + N * delta_k) / k_start)^exponent`.

use std::sync::Arc;

use crate::error::{ScanError, ScanResult};
use crate::hardware::Triggerable;
use crate::records::Records;
use crate::sink::divide_safely;

/// k-power-law schedule on a gating timer
pub struct KPowerLaw {
    /// Gating timer
    pub device: Arc<dyn Triggerable>,
    /// Exposure at `k_start`
    pub base_time: f64,
    /// First k value
    pub k_start: f64,
    /// k increment per measurement
    pub delta_k: f64,
    /// Power applied to the k ratio
    pub exponent: f64,
    calls: u64,
    last_exposure: Option<f64>,
}

impl KPowerLaw {
    /// Parse `"<base_time> <k_start> <delta_k> <exponent> <timer-name>"`
    pub fn parse(arguments: &str, records: &Records) -> ScanResult<Self> {
        let fields: Vec<&str> = arguments.split_whitespace().collect();
        let [base_time, k_start, delta_k, exponent, name] = fields.as_slice() else {
            return Err(ScanError::UnparseableArguments(format!(
                "Measurement arguments '{arguments}' do not match \
                 '<base_time> <k_start> <delta_k> <exponent> <timer-name>'."
            )));
        };

        let number = |label: &str, text: &str| -> ScanResult<f64> {
            text.parse().map_err(|_| {
                ScanError::UnparseableArguments(format!(
                    "The {label} '{text}' in measurement arguments '{arguments}' is not a number."
                ))
            })
        };

        Ok(Self {
            base_time: number("base time", *base_time)?,
            k_start: number("starting k", *k_start)?,
            delta_k: number("k step", *delta_k)?,
            exponent: number("exponent", *exponent)?,
            device: records.triggerable(name)?,
            calls: 0,
            last_exposure: None,
        })
    }

    /// Exposure for the `n`-th measurement.
    ///
    /// A ratio that cannot be raised to `exponent` (zero to a negative power,
    /// a negative base to a fractional one) contributes zero.
    pub fn exposure(&self, n: u64) -> f64 {
        let k = self.k_start + n as f64 * self.delta_k;
        let exposure = self.base_time * divide_safely(k, self.k_start).powf(self.exponent);
        if exposure.is_finite() {
            exposure
        } else {
            0.0
        }
    }

    /// Exposure for the next call, advancing the call counter
    pub fn next_exposure(&mut self) -> f64 {
        let exposure = self.exposure(self.calls);
        self.calls += 1;
        self.last_exposure = Some(exposure);
        exposure
    }

    /// Most recent exposure handed out
    pub fn last_exposure(&self) -> Option<f64> {
        self.last_exposure
    }

    /// Restart the schedule at N = 0
    pub fn reset(&mut self) {
        self.calls = 0;
        self.last_exposure = None;
    }
}
