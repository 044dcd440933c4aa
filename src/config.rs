//! Scan descriptions.
//!
//! A scan is described by a TOML file loaded with Figment. Values from the
//! file can be overridden by environment variables prefixed with
//! `DAQ_SCAN_`; nested keys are separated by a double underscore
//! (`DAQ_SCAN_FLAGS__EARLY_MOVE=true`).
//!
//! # Example
//!
//! ```toml
//! name = "edge"
//! input_devices = ["s1", "t1"]
//! measurement_type = "preset_time"
//! measurement_arguments = "0.1 t1"
//! datafile_description = "text"
//! datafile_name = "edge.001"
//!
//! [pattern]
//! kind = "linear"
//! axes = [{ motor = "m1", start = 0.0, step = 0.5, count = 11 }]
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{ScanError, ScanResult};
use crate::registry::parse_description;
use crate::xafs::XafsRegions;

/// Environment prefix for scan description overrides
pub const ENV_PREFIX: &str = "DAQ_SCAN_";

/// One independent variable of a linear scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    /// Motor record name
    pub motor: String,
    /// First position
    pub start: f64,
    /// Increment per step
    pub step: f64,
    /// Number of positions
    pub count: usize,
}

impl Axis {
    /// Axis from `start` in `count` steps of `step`
    pub fn new(motor: &str, start: f64, step: f64, count: usize) -> Self {
        Self {
            motor: motor.to_string(),
            start,
            step,
            count,
        }
    }
}

/// Positions a scan visits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanPattern {
    /// Cartesian product of evenly spaced axes, first axis outermost
    Linear {
        /// Axes from outermost to innermost
        axes: Vec<Axis>,
    },
    /// Explicit position rows for a set of motors
    List {
        /// Motor record names, one per column
        motors: Vec<String>,
        /// One row of positions per step
        positions: Vec<Vec<f64>>,
    },
    /// Repeated measurements without motion
    Count {
        /// Number of measurements
        points: usize,
    },
    /// XAFS energy and k regions, each run as a child linear scan
    Xafs(XafsRegions),
}

impl ScanPattern {
    /// Motor names in column order
    pub fn motor_names(&self) -> Vec<&str> {
        match self {
            ScanPattern::Linear { axes } => axes.iter().map(|axis| axis.motor.as_str()).collect(),
            ScanPattern::List { motors, .. } => motors.iter().map(String::as_str).collect(),
            ScanPattern::Count { .. } => Vec::new(),
            ScanPattern::Xafs(regions) => regions.motor_names(),
        }
    }

    /// Step count of each walker dimension, outermost first.
    ///
    /// XAFS scans have no step grid of their own.
    pub fn counts(&self) -> Vec<usize> {
        match self {
            ScanPattern::Linear { axes } => axes.iter().map(|axis| axis.count).collect(),
            ScanPattern::List { positions, .. } => vec![positions.len()],
            ScanPattern::Count { points } => vec![*points],
            ScanPattern::Xafs(_) => Vec::new(),
        }
    }

    /// Total number of measurements
    pub fn num_measurements(&self) -> usize {
        match self {
            ScanPattern::Xafs(regions) => regions
                .regions("")
                .map(|layout| layout.iter().map(|region| region.count).sum())
                .unwrap_or(0),
            _ => self.counts().iter().product(),
        }
    }

    /// Motor destinations for a step-number vector
    pub fn positions(&self, step_number: &[usize]) -> ScanResult<Vec<f64>> {
        match self {
            ScanPattern::Linear { axes } => {
                if step_number.len() != axes.len() {
                    return Err(ScanError::CorruptState(format!(
                        "Step vector has {} entries for {} axes.",
                        step_number.len(),
                        axes.len()
                    )));
                }
                Ok(axes
                    .iter()
                    .zip(step_number)
                    .map(|(axis, &step)| axis.start + axis.step * step as f64)
                    .collect())
            }
            ScanPattern::List { positions, .. } => step_number
                .first()
                .and_then(|&row| positions.get(row))
                .cloned()
                .ok_or_else(|| {
                    ScanError::CorruptState(format!(
                        "Step vector {step_number:?} is outside the position list."
                    ))
                }),
            ScanPattern::Count { .. } => Ok(Vec::new()),
            ScanPattern::Xafs(_) => Err(ScanError::CorruptState(
                "XAFS scans position their motors through child scans.".to_string(),
            )),
        }
    }
}

/// When the shutter relay is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutterPolicy {
    /// Never touch the shutter
    #[default]
    Ignore,
    /// Open for each whole scan repeat
    OpenForScan,
    /// Open around each measurement
    OpenForDatapoint,
}

/// Whether the innermost line may overlap moves with readout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyMovePolicy {
    /// Always move synchronously
    Prohibit,
    /// Always overlap
    Require,
    /// Overlap when the `early_move` flag is set
    #[default]
    Allow,
}

/// Scan flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanFlags {
    /// Do not emit progress lines
    pub suppress_progress: bool,
    /// Start the next move before reading out
    pub early_move: bool,
}

/// Motor speeds applied for the duration of a scan
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuickScan {
    /// Speed per motor name
    pub speeds: BTreeMap<String, f64>,
}

/// A permit or fault handler entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSpec {
    /// Registered handler type
    pub r#type: String,
    /// Handler-specific description
    #[serde(default)]
    pub description: String,
}

fn default_num_scans() -> usize {
    1
}

fn default_none() -> String {
    "none".to_string()
}

fn default_true() -> bool {
    true
}

/// Complete description of one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Scan name, used in messages and as a parent-scan name
    pub name: String,
    /// Positions to visit
    pub pattern: ScanPattern,
    /// Input devices, in datafile column order
    #[serde(default)]
    pub input_devices: Vec<String>,
    /// Number of repeats
    #[serde(default = "default_num_scans")]
    pub num_scans: usize,
    /// Shutter relay name
    #[serde(default)]
    pub shutter: Option<String>,
    /// When the shutter opens
    #[serde(default)]
    pub shutter_policy: ShutterPolicy,
    /// Delay between arriving at a position and measuring
    #[serde(default, with = "humantime_serde")]
    pub settling_time: Duration,
    /// Measurement type name
    #[serde(default = "default_none")]
    pub measurement_type: String,
    /// Measurement argument string
    #[serde(default)]
    pub measurement_arguments: String,
    /// `typename[:options]` of the datafile
    #[serde(default = "default_none")]
    pub datafile_description: String,
    /// Datafile name (parent scan name for child datafiles)
    #[serde(default)]
    pub datafile_name: String,
    /// `typename[:options]` of the plot
    #[serde(default = "default_none")]
    pub plot_description: String,
    /// Plot arguments (parent scan name for child plots)
    #[serde(default)]
    pub plot_arguments: String,
    /// Whether the plot is opened at all
    #[serde(default = "default_true")]
    pub plot_enabled: bool,
    /// Scan flags
    #[serde(default)]
    pub flags: ScanFlags,
    /// Early-move policy
    #[serde(default)]
    pub early_move_policy: EarlyMovePolicy,
    /// Speeds applied while scanning
    #[serde(default)]
    pub quick_scan: Option<QuickScan>,
    /// Permit handlers consulted before each measurement
    #[serde(default)]
    pub permit_handlers: Vec<HandlerSpec>,
    /// Fault handlers consulted after each measurement
    #[serde(default)]
    pub fault_handlers: Vec<HandlerSpec>,
}

impl ScanConfig {
    /// Scan with default settings over `pattern`
    pub fn new(name: &str, pattern: ScanPattern) -> Self {
        Self {
            name: name.to_string(),
            pattern,
            input_devices: Vec::new(),
            num_scans: 1,
            shutter: None,
            shutter_policy: ShutterPolicy::Ignore,
            settling_time: Duration::ZERO,
            measurement_type: default_none(),
            measurement_arguments: String::new(),
            datafile_description: default_none(),
            datafile_name: String::new(),
            plot_description: default_none(),
            plot_arguments: String::new(),
            plot_enabled: true,
            flags: ScanFlags::default(),
            early_move_policy: EarlyMovePolicy::Allow,
            quick_scan: None,
            permit_handlers: Vec::new(),
            fault_handlers: Vec::new(),
        }
    }

    /// Linear scan over `axes`
    pub fn linear(name: &str, axes: Vec<Axis>) -> Self {
        Self::new(name, ScanPattern::Linear { axes })
    }

    /// Load from a TOML file with environment overrides, then validate
    pub fn load<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document, then validate
    pub fn from_toml_str(text: &str) -> ScanResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(text)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Set the input devices
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_devices = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Set the measurement
    pub fn with_measurement(mut self, type_name: &str, arguments: &str) -> Self {
        self.measurement_type = type_name.to_string();
        self.measurement_arguments = arguments.to_string();
        self
    }

    /// Set the datafile
    pub fn with_datafile(mut self, description: &str, name: &str) -> Self {
        self.datafile_description = description.to_string();
        self.datafile_name = name.to_string();
        self
    }

    /// Set the plot
    pub fn with_plot(mut self, description: &str, arguments: &str) -> Self {
        self.plot_description = description.to_string();
        self.plot_arguments = arguments.to_string();
        self
    }

    /// Set the number of repeats
    pub fn with_num_scans(mut self, num_scans: usize) -> Self {
        self.num_scans = num_scans;
        self
    }

    /// Set the shutter relay and policy
    pub fn with_shutter(mut self, relay: &str, policy: ShutterPolicy) -> Self {
        self.shutter = Some(relay.to_string());
        self.shutter_policy = policy;
        self
    }

    /// Set the settling time
    pub fn with_settling_time(mut self, settling_time: Duration) -> Self {
        self.settling_time = settling_time;
        self
    }

    /// Set the `early_move` flag
    pub fn with_early_move(mut self, early_move: bool) -> Self {
        self.flags.early_move = early_move;
        self
    }

    /// Set the early-move policy
    pub fn with_early_move_policy(mut self, policy: EarlyMovePolicy) -> Self {
        self.early_move_policy = policy;
        self
    }

    /// Set the `suppress_progress` flag
    pub fn with_suppress_progress(mut self, suppress: bool) -> Self {
        self.flags.suppress_progress = suppress;
        self
    }

    /// Apply per-motor speeds for the duration of the scan
    pub fn with_quick_scan<I>(mut self, speeds: I) -> Self
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        self.quick_scan = Some(QuickScan {
            speeds: speeds.into_iter().collect(),
        });
        self
    }

    /// Add a permit handler
    pub fn with_permit(mut self, type_name: &str, description: &str) -> Self {
        self.permit_handlers.push(HandlerSpec {
            r#type: type_name.to_string(),
            description: description.to_string(),
        });
        self
    }

    /// Add a fault handler
    pub fn with_fault(mut self, type_name: &str, description: &str) -> Self {
        self.fault_handlers.push(HandlerSpec {
            r#type: type_name.to_string(),
            description: description.to_string(),
        });
        self
    }

    /// Every record name the scan refers to directly
    pub fn referenced_records(&self) -> Vec<&str> {
        let mut names = self.pattern.motor_names();
        names.extend(self.input_devices.iter().map(String::as_str));
        if let Some(shutter) = &self.shutter {
            names.push(shutter);
        }
        if let Some(quick) = &self.quick_scan {
            names.extend(quick.speeds.keys().map(String::as_str));
        }
        names
    }

    /// Check structural consistency
    pub fn validate(&self) -> ScanResult<()> {
        let invalid = |message: String| Err(ScanError::Configuration(message));

        if self.name.trim().is_empty() {
            return invalid("Scan name must not be empty".to_string());
        }
        if self.num_scans == 0 {
            return invalid(format!("Scan '{}' must run at least once", self.name));
        }

        match &self.pattern {
            ScanPattern::Linear { axes } => {
                if axes.is_empty() {
                    return invalid(format!("Linear scan '{}' has no axes", self.name));
                }
                if let Some(axis) = axes
                    .iter()
                    .find(|axis| !axis.start.is_finite() || !axis.step.is_finite())
                {
                    return invalid(format!(
                        "Axis '{}' of scan '{}' has a non-finite start or step",
                        axis.motor, self.name
                    ));
                }
            }
            ScanPattern::List { motors, positions } => {
                if motors.is_empty() {
                    return invalid(format!("List scan '{}' has no motors", self.name));
                }
                if let Some((row, _)) = positions
                    .iter()
                    .enumerate()
                    .find(|(_, row)| row.len() != motors.len())
                {
                    return invalid(format!(
                        "Row {} of list scan '{}' does not have {} positions",
                        row,
                        self.name,
                        motors.len()
                    ));
                }
            }
            ScanPattern::Count { .. } => {}
            ScanPattern::Xafs(regions) => regions.validate(&self.name)?,
        }

        if self.shutter_policy != ShutterPolicy::Ignore && self.shutter.is_none() {
            return invalid(format!(
                "Scan '{}' has a shutter policy but no shutter relay",
                self.name
            ));
        }

        if let Some(quick) = &self.quick_scan {
            if let Some((motor, speed)) = quick.speeds.iter().find(|(_, speed)| **speed <= 0.0) {
                return invalid(format!("Quick-scan speed {speed} for '{motor}' must be positive"));
            }
        }

        let datafile = parse_description(&self.datafile_description)?;
        if datafile.type_name != "none" && self.datafile_name.trim().is_empty() {
            return invalid(format!(
                "Scan '{}' writes a '{}' datafile but has no datafile name",
                self.name, datafile.type_name
            ));
        }
        parse_description(&self.plot_description)?;

        Ok(())
    }
}
