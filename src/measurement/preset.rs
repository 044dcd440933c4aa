//! Preset-time and preset-count measurements.
//!
//! Both gate on a single triggerable with a fixed preset. They differ only
//! in what the preset means: seconds for a timer, counts for a scaler.

use std::sync::Arc;

use crate::error::{ScanError, ScanResult};
use crate::hardware::Triggerable;
use crate::records::Records;

/// What the preset value counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetKind {
    /// Seconds on a timer
    Time,
    /// Counts on a scaler
    Count,
}

/// Fixed-preset gating measurement
pub struct PresetMeasurement {
    /// Gating timer or scaler
    pub device: Arc<dyn Triggerable>,
    /// Seconds or counts
    pub preset: f64,
    /// Meaning of `preset`
    pub kind: PresetKind,
}

impl PresetMeasurement {
    /// Parse `"<preset> <device-name>"`
    pub fn parse(kind: PresetKind, arguments: &str, records: &Records) -> ScanResult<Self> {
        let usage = match kind {
            PresetKind::Time => "<seconds> <timer-name>",
            PresetKind::Count => "<counts> <scaler-name>",
        };
        let fields: Vec<&str> = arguments.split_whitespace().collect();
        let [value, name] = fields.as_slice() else {
            return Err(ScanError::UnparseableArguments(format!(
                "Measurement arguments '{arguments}' do not match '{usage}'."
            )));
        };

        let preset: f64 = value.parse().map_err(|_| {
            ScanError::UnparseableArguments(format!(
                "Preset value '{value}' in measurement arguments '{arguments}' is not a number."
            ))
        })?;
        if !preset.is_finite() || preset < 0.0 {
            return Err(ScanError::UnparseableArguments(format!(
                "Preset value {preset} must be a non-negative number."
            )));
        }

        Ok(Self {
            device: records.triggerable(name)?,
            preset,
            kind,
        })
    }
}
