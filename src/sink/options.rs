//! Options accepted after the `:` of a datafile or plot description.

use crate::error::{ScanError, ScanResult};
use crate::registry::DriverOption;

/// Name of the energy pseudomotor used as X by the `xafs` option
pub const ENERGY_MOTOR: &str = "energy";

/// Which sink family the options belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkCategory {
    /// Datafile descriptions
    Datafile,
    /// Plot descriptions
    Plot,
}

impl std::fmt::Display for SinkCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkCategory::Datafile => write!(f, "datafile"),
            SinkCategory::Plot => write!(f, "plot"),
        }
    }
}

/// Parsed sink options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkOptions {
    /// Alternate X-axis motors, by record name
    pub x_motors: Vec<String>,
    /// Divide counting-device values by the measurement time
    pub normalize: bool,
    /// Keep successive child scans in one plot section
    pub continuous_plot: bool,
}

/// True if `given` is a non-empty prefix of `keyword`.
fn abbreviates(given: &str, keyword: &str) -> bool {
    !given.is_empty() && keyword.starts_with(given)
}

impl SinkOptions {
    /// Interpret the options of a description.
    ///
    /// `x` must be spelled out; the flag options accept any non-empty
    /// abbreviation. Unknown options are rejected.
    pub fn parse(category: SinkCategory, options: &[DriverOption]) -> ScanResult<Self> {
        let mut parsed = SinkOptions::default();

        for option in options {
            let name = option.name.as_str();
            if name == "x" {
                let args = option.args.as_deref().unwrap_or_default();
                parsed.x_motors = args
                    .split(',')
                    .map(str::trim)
                    .filter(|motor| !motor.is_empty())
                    .map(str::to_string)
                    .collect();
                if parsed.x_motors.is_empty() {
                    return Err(ScanError::UnparseableArguments(format!(
                        "The {category} option 'x' needs at least one motor name."
                    )));
                }
            } else if abbreviates(name, "normalize_data") {
                parsed.normalize = true;
            } else if abbreviates(name, "raw_data") {
                parsed.normalize = false;
            } else if category == SinkCategory::Plot && abbreviates(name, "continuous_plot") {
                parsed.continuous_plot = true;
            } else if name == "xafs" {
                parsed.normalize = true;
                parsed.x_motors = vec![ENERGY_MOTOR.to_string()];
                if category == SinkCategory::Plot {
                    parsed.continuous_plot = true;
                }
            } else {
                return Err(ScanError::UnparseableArguments(format!(
                    "Illegal {category} option '{name}'."
                )));
            }
        }

        Ok(parsed)
    }
}
