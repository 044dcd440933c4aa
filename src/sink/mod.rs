//! Output sinks: datafiles and plots.
//!
//! Both categories share one contract. A sink is opened once per scan
//! repeat, receives headers and one row per measurement, and is closed on
//! every exit path. Each call receives a [`ResolutionScope`] describing the
//! scan whose devices the row is built from. A child sink forwards the call
//! to its parent's sink unchanged, so the parent formats rows against the
//! child's motors and inputs without any shared mutable view.

pub mod datafile;
pub mod gnuplot;
pub mod options;
pub mod plot;
pub mod text;

pub use datafile::{DataSink, DatafileDriver};
pub use options::SinkOptions;
pub use plot::{PlotDriver, PlotSink};

use std::sync::Arc;

use crate::error::{ScanError, ScanResult};
use crate::hardware::{InputDevice, Motor};

/// Everything a sink needs to render one scan's state
#[derive(Clone, Copy)]
pub struct ResolutionScope<'a> {
    /// Name of the scan producing the row
    pub scan: &'a str,
    /// Current datafile name of that scan
    pub datafile_name: &'a str,
    /// Independent-variable motors
    pub motors: &'a [Arc<dyn Motor>],
    /// Position of each motor for this row
    pub positions: &'a [f64],
    /// Alternate X motors configured for this sink
    pub x_motors: &'a [Arc<dyn Motor>],
    /// Positions read from the alternate X motors
    pub x_positions: &'a [f64],
    /// Input devices, in column order
    pub inputs: &'a [Arc<dyn InputDevice>],
    /// Last readout of each input device
    pub readings: &'a [f64],
    /// Measurement time to normalize counting devices by
    pub normalization: Option<f64>,
    /// Current step-number vector
    pub step_number: &'a [usize],
    /// Running measurement counter
    pub measurement_number: u64,
    /// Current plot section
    pub section_number: u64,
}

impl<'a> ResolutionScope<'a> {
    /// Number of independent variables shown on the X axis
    pub fn num_independent_variables(&self) -> usize {
        if self.x_motors.is_empty() {
            self.motors.len()
        } else {
            self.x_motors.len()
        }
    }

    /// Motors and positions forming the X columns of a row
    pub fn x_columns(&self) -> Vec<(&'a Arc<dyn Motor>, f64)> {
        if self.x_motors.is_empty() {
            self.motors.iter().zip(self.positions.iter().copied()).collect()
        } else {
            self.x_motors
                .iter()
                .zip(self.x_positions.iter().copied())
                .collect()
        }
    }

    /// Index of the X column that changes fastest, if any.
    ///
    /// With alternate X motors this is the last of them; otherwise the last
    /// independent motor.
    pub fn innermost_index(&self) -> Option<usize> {
        if !self.x_motors.is_empty() {
            Some(self.x_motors.len() - 1)
        } else {
            self.motors.len().checked_sub(1)
        }
    }

    /// Each input reading rendered for output
    pub fn formatted_readings(&self) -> Vec<String> {
        self.inputs
            .iter()
            .zip(self.readings.iter())
            .map(|(device, value)| format_reading(device.as_ref(), *value, self.normalization))
            .collect()
    }
}

/// Divide, treating a zero denominator as a zero result
pub fn divide_safely(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() {
        0.0
    } else {
        numerator / denominator
    }
}

/// Render a device value for a datafile or progress line.
///
/// Counting devices print as integers unless they are normalized by the
/// measurement time; analog devices print at their own precision.
pub fn format_reading(device: &dyn InputDevice, value: f64, normalization: Option<f64>) -> String {
    if device.is_counter() {
        match normalization {
            Some(time) if time > 0.0 => format!("{}", divide_safely(value, time)),
            _ => format!("{}", value.round() as i64),
        }
    } else {
        format!("{:.*}", device.precision(), value)
    }
}

/// Next version of a datafile name.
///
/// The text after the final `.` is treated as a fixed-width decimal counter.
/// Names without an all-digit suffix come back unchanged; a counter that
/// would need more digits wraps to zero.
pub fn bump_version(filename: &str) -> ScanResult<String> {
    let Some(dot) = filename.rfind('.') else {
        return Ok(filename.to_string());
    };
    let (stem, suffix) = (&filename[..dot], &filename[dot + 1..]);
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(filename.to_string());
    }

    let width = suffix.len();
    let value: u64 = suffix.parse().map_err(|_| {
        ScanError::WouldExceedLimit(format!(
            "The version suffix of datafile '{filename}' has too many digits."
        ))
    })?;

    let limit = u32::try_from(width)
        .ok()
        .and_then(|w| 10u64.checked_pow(w));
    let next = match (value.checked_add(1), limit) {
        (Some(next), Some(limit)) if next >= limit => 0,
        (Some(next), _) => next,
        (None, _) => 0,
    };
    Ok(format!("{stem}.{next:0width$}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockInput, MockScaler};

    #[test]
    fn bump_version_increments_and_wraps() {
        assert_eq!(bump_version("run.007").unwrap(), "run.008");
        assert_eq!(bump_version("run.999").unwrap(), "run.000");
        assert_eq!(bump_version("run.0099").unwrap(), "run.0100");
        assert_eq!(bump_version("data/scan.1").unwrap(), "data/scan.2");
    }

    #[test]
    fn bump_version_leaves_unversioned_names() {
        assert_eq!(bump_version("run").unwrap(), "run");
        assert_eq!(bump_version("a.12x").unwrap(), "a.12x");
        assert_eq!(bump_version("run.").unwrap(), "run.");
        assert_eq!(bump_version("dir.7/run").unwrap(), "dir.7/run");
    }

    #[test]
    fn bump_version_rejects_oversized_counters() {
        let name = format!("run.{}", "9".repeat(30));
        assert!(matches!(bump_version(&name), Err(ScanError::WouldExceedLimit(_))));
    }

    #[test]
    fn readings_format_by_device_class() {
        let scaler = MockScaler::new("s1", 1.0);
        let analog = MockInput::constant("a1", 0.0).with_precision(2);

        assert_eq!(format_reading(&scaler, 1234.0, None), "1234");
        assert_eq!(format_reading(&scaler, 1000.0, Some(0.5)), "2000");
        assert_eq!(format_reading(&scaler, 1000.0, Some(0.0)), "1000");
        assert_eq!(format_reading(&analog, 1.23456, Some(2.0)), "1.23");
    }

    #[test]
    fn divide_safely_never_panics() {
        assert_eq!(divide_safely(4.0, 2.0), 2.0);
        assert_eq!(divide_safely(4.0, 0.0), 0.0);
    }
}
