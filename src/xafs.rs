//! Multi-region XAFS scans.
//!
//! An XAFS scan is a parent scan that owns the datafile and plot and runs
//! one child linear scan per region. The first `num_energy_regions` regions
//! step the `e_minus_e0` pseudomotor in eV; the rest step the photoelectron
//! wavenumber `k` in inverse angstroms. Children write through `child:`
//! sinks, so every row lands in the parent's datafile, and a continuous
//! parent plot keeps all regions in one section.
//!
//! Region `i` runs from `boundaries[i]` to `boundaries[i + 1]` in steps of
//! `step_sizes[i]`, gating each point for `measurement_times[i]` seconds.
//! The first k region starts at the k equivalent of the last energy
//! boundary. A region whose last point lands within 0.01 eV of the next
//! region's start drops that point.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::{Axis, ScanConfig, ScanPattern};
use crate::coordinator::ScanRun;
use crate::engine::{ScanEngine, ScanOutcome};
use crate::error::{ScanError, ScanResult};

/// hbar^2 / 2m for the electron, in eV * angstrom^2
pub const HBAR_SQUARED_OVER_2M_ELECTRON: f64 = 3.809_982_12;

/// Energy difference below which a region's last point duplicates the next
/// region's first, in eV
const DUPLICATE_POINT_TOLERANCE: f64 = 0.01;

fn default_energy_motor() -> String {
    "e_minus_e0".to_string()
}

fn default_k_motor() -> String {
    "k".to_string()
}

/// Wavenumber of a photoelectron `energy` eV above the edge; zero below it
pub fn k_from_energy(energy: f64) -> f64 {
    let k_squared = energy / HBAR_SQUARED_OVER_2M_ELECTRON;
    if k_squared <= 0.0 {
        0.0
    } else {
        k_squared.sqrt()
    }
}

/// Region table of an XAFS scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XafsRegions {
    /// Pseudomotor for energy regions (energy above the edge, eV)
    #[serde(default = "default_energy_motor")]
    pub energy_motor: String,
    /// Pseudomotor for k regions (inverse angstroms)
    #[serde(default = "default_k_motor")]
    pub k_motor: String,
    /// Regions stepped in energy; the rest are stepped in k
    pub num_energy_regions: usize,
    /// Region edges, one more than the number of regions
    pub boundaries: Vec<f64>,
    /// Step size of each region
    pub step_sizes: Vec<f64>,
    /// Gate time of each region in seconds
    pub measurement_times: Vec<f64>,
}

/// One child scan of an XAFS scan
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    /// Motor stepped by the region
    pub motor: String,
    /// First position
    pub start: f64,
    /// Increment per point
    pub step: f64,
    /// Number of points
    pub count: usize,
    /// Gate time in seconds
    pub measurement_time: f64,
}

impl XafsRegions {
    /// Total number of regions
    pub fn num_regions(&self) -> usize {
        self.step_sizes.len()
    }

    /// Number of regions stepped in k
    pub fn num_k_regions(&self) -> usize {
        self.num_regions().saturating_sub(self.num_energy_regions)
    }

    /// Both pseudomotor names, energy first
    pub fn motor_names(&self) -> Vec<&str> {
        vec![self.energy_motor.as_str(), self.k_motor.as_str()]
    }

    /// Check that the region table is consistent
    pub fn validate(&self, scan: &str) -> ScanResult<()> {
        let invalid = |message: String| Err(ScanError::Configuration(message));
        let regions = self.num_regions();

        if regions == 0 {
            return invalid(format!("XAFS scan '{scan}' has no regions"));
        }
        if self.boundaries.len() != regions + 1 {
            return invalid(format!(
                "XAFS scan '{scan}' has {} boundaries for {regions} regions",
                self.boundaries.len()
            ));
        }
        if self.measurement_times.len() != regions {
            return invalid(format!(
                "XAFS scan '{scan}' has {} measurement times for {regions} regions",
                self.measurement_times.len()
            ));
        }
        if self.num_energy_regions > regions {
            return invalid(format!(
                "XAFS scan '{scan}' has {} energy regions but only {regions} regions",
                self.num_energy_regions
            ));
        }
        if let Some(i) = self
            .step_sizes
            .iter()
            .position(|step| !step.is_finite() || *step <= 0.0)
        {
            return invalid(format!(
                "Region {i} of XAFS scan '{scan}' needs a positive step size"
            ));
        }
        if let Some(i) = self
            .measurement_times
            .iter()
            .position(|time| !time.is_finite() || *time < 0.0)
        {
            return invalid(format!(
                "Region {i} of XAFS scan '{scan}' has an invalid measurement time"
            ));
        }
        if self.boundaries.iter().any(|boundary| !boundary.is_finite()) {
            return invalid(format!("XAFS scan '{scan}' has a non-finite boundary"));
        }
        self.regions(scan).map(|_| ())
    }

    /// Lay out every region
    pub fn regions(&self, scan: &str) -> ScanResult<Vec<Region>> {
        let num_regions = self.num_regions();
        let mut regions = Vec::with_capacity(num_regions);

        for i in 0..num_regions {
            let (Some(&start_boundary), Some(&end), Some(&step), Some(&time)) = (
                self.boundaries.get(i),
                self.boundaries.get(i + 1),
                self.step_sizes.get(i),
                self.measurement_times.get(i),
            ) else {
                return Err(ScanError::Configuration(format!(
                    "Region {i} of XAFS scan '{scan}' is incomplete"
                )));
            };
            let in_energy = i < self.num_energy_regions;

            let start = if i == self.num_energy_regions {
                k_from_energy(start_boundary)
            } else {
                start_boundary
            };

            let span = ((end - start) / step).trunc();
            if span < 0.0 {
                return Err(ScanError::Configuration(format!(
                    "Region {i} of XAFS scan '{scan}' ends at {end} before its start {start}"
                )));
            }
            let mut count = span as usize + 1;

            if i + 1 < num_regions {
                let last = start + step * (count - 1) as f64;
                let energy_gap = if in_energy {
                    end - last
                } else {
                    HBAR_SQUARED_OVER_2M_ELECTRON * (end * end - last * last)
                };
                if energy_gap.abs() < DUPLICATE_POINT_TOLERANCE {
                    count -= 1;
                }
            }

            let motor = if in_energy {
                &self.energy_motor
            } else {
                &self.k_motor
            };
            regions.push(Region {
                motor: motor.clone(),
                start,
                step,
                count,
                measurement_time: time,
            });
        }
        Ok(regions)
    }
}

/// `type[:options]` with the type replaced by `child`
fn child_description(description: &str) -> String {
    match description.split_once(':') {
        Some((_, options)) => format!("child:{options}"),
        None => "child".to_string(),
    }
}

/// Timer named by a `"<time> <timer>"` measurement argument string
fn timer_name(parent: &ScanConfig) -> ScanResult<&str> {
    let fields: Vec<&str> = parent.measurement_arguments.split_whitespace().collect();
    match fields.as_slice() {
        [time, timer] if time.parse::<f64>().is_ok() => Ok(*timer),
        _ => Err(ScanError::UnparseableArguments(format!(
            "The timer name cannot be found in the measurement arguments '{}' for scan '{}'.",
            parent.measurement_arguments, parent.name
        ))),
    }
}

/// Scan description for region `index` of `parent`
pub fn child_config(
    parent: &ScanConfig,
    index: usize,
    region: &Region,
    timer: &str,
) -> ScanConfig {
    let mut child = ScanConfig::linear(
        &format!("{}.region{index}", parent.name),
        vec![Axis::new(&region.motor, region.start, region.step, region.count)],
    )
    .with_inputs(parent.input_devices.iter().cloned())
    .with_settling_time(parent.settling_time)
    .with_measurement(
        "preset_time",
        &format!("{} {timer}", region.measurement_time),
    )
    .with_datafile(&child_description(&parent.datafile_description), &parent.name)
    .with_plot(&child_description(&parent.plot_description), &parent.name)
    .with_early_move(parent.flags.early_move)
    .with_early_move_policy(parent.early_move_policy)
    .with_suppress_progress(parent.flags.suppress_progress);

    if let Some(relay) = &parent.shutter {
        child = child.with_shutter(relay, parent.shutter_policy);
    }
    child.plot_enabled = parent.plot_enabled;
    child.permit_handlers = parent.permit_handlers.clone();
    child.fault_handlers = parent.fault_handlers.clone();
    child
}

/// Run every region of an XAFS scan as a child of `run`.
///
/// Both pseudomotors are read before fast mode is switched on so that any
/// values they cache are current.
#[instrument(skip_all, fields(scan = %run.name()))]
pub async fn execute_regions(
    engine: &ScanEngine,
    run: &mut ScanRun,
    regions: &XafsRegions,
) -> ScanResult<()> {
    let parent = engine.config();
    let timer = timer_name(parent)?;
    let layout = regions.regions(&parent.name)?;

    for motor in &run.motors {
        let position = motor.get_position().await?;
        debug!(motor = %motor.name(), position, "Read pseudomotor before fast mode");
    }
    if !run.records.fast_mode() {
        run.start_fast_mode().await?;
    }

    for (index, region) in layout.iter().enumerate() {
        if region.count == 0 {
            debug!(region = index, "Skipping empty region");
            continue;
        }
        info!(
            region = index,
            motor = %region.motor,
            start = region.start,
            step = region.step,
            points = region.count,
            "Starting XAFS region"
        );

        let mut child = engine.child(child_config(parent, index, region, timer));
        let report = Box::pin(child.perform_scan()).await?;
        match report.outcome {
            ScanOutcome::Complete => {}
            ScanOutcome::Stopped => return Err(ScanError::StopRequested),
            ScanOutcome::Aborted => return Err(ScanError::Interrupted),
        }
    }
    Ok(())
}

impl ScanPattern {
    /// Region table, for XAFS scans
    pub fn xafs(&self) -> Option<&XafsRegions> {
        match self {
            ScanPattern::Xafs(regions) => Some(regions),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exafs() -> XafsRegions {
        XafsRegions {
            energy_motor: default_energy_motor(),
            k_motor: default_k_motor(),
            num_energy_regions: 2,
            boundaries: vec![-10.0, 0.0, 20.0, 4.0],
            step_sizes: vec![5.0, 10.0, 1.0],
            measurement_times: vec![0.001, 0.002, 0.003],
        }
    }

    #[test]
    fn energy_regions_drop_the_shared_boundary_point() {
        let regions = exafs().regions("exafs").unwrap();
        assert_eq!(regions.len(), 3);

        assert_eq!(regions[0].motor, "e_minus_e0");
        assert_eq!((regions[0].start, regions[0].count), (-10.0, 2));
        assert_eq!((regions[1].start, regions[1].count), (0.0, 2));
        assert_eq!(regions[1].measurement_time, 0.002);
    }

    #[test]
    fn first_k_region_starts_at_the_last_energy_boundary() {
        let regions = exafs().regions("exafs").unwrap();
        let k = &regions[2];
        assert_eq!(k.motor, "k");
        assert!((k.start - (20.0 / HBAR_SQUARED_OVER_2M_ELECTRON).sqrt()).abs() < 1e-12);
        // The last region keeps its end point
        assert_eq!(k.count, 2);
    }

    #[test]
    fn k_region_suppression_compares_energies() {
        let mut table = exafs();
        table.num_energy_regions = 0;
        table.boundaries = vec![2.0, 4.0, 6.0];
        table.step_sizes = vec![1.0, 1.0];
        table.measurement_times = vec![1.0, 1.0];

        let regions = table.regions("k_only").unwrap();
        // Region 0 starts at k(2 eV), so its points never land on k = 4
        assert!((regions[0].start - k_from_energy(2.0)).abs() < 1e-12);
        assert_eq!(regions[0].count, 4);
        // Region 1 steps 4, 5, 6 and keeps all three as the last region
        assert_eq!(regions[1].count, 3);

        table.num_energy_regions = 1;
        table.boundaries = vec![0.0, 4.0, 3.0];
        let regions = table.regions("mixed").unwrap();
        // 0..4 eV in 1 eV steps ends on the boundary and drops it
        assert_eq!(regions[0].count, 4);
    }

    #[test]
    fn negative_edge_energy_starts_k_at_zero() {
        assert_eq!(k_from_energy(-5.0), 0.0);
        assert_eq!(k_from_energy(0.0), 0.0);
    }

    #[test]
    fn inconsistent_tables_are_rejected() {
        let mut short = exafs();
        short.boundaries.pop();
        assert!(matches!(short.validate("x"), Err(ScanError::Configuration(_))));

        let mut too_many_energy = exafs();
        too_many_energy.num_energy_regions = 4;
        assert!(too_many_energy.validate("x").is_err());

        let mut zero_step = exafs();
        zero_step.step_sizes[1] = 0.0;
        assert!(zero_step.validate("x").is_err());

        let mut backwards = exafs();
        backwards.boundaries = vec![0.0, -10.0, 20.0, 4.0];
        assert!(backwards.validate("x").is_err());

        assert!(exafs().validate("x").is_ok());
    }

    #[test]
    fn child_descriptions_keep_the_parent_options() {
        assert_eq!(child_description("text:xafs"), "child:xafs");
        assert_eq!(child_description("gnuplot"), "child");

        let parent = ScanConfig::new("exafs", ScanPattern::Xafs(exafs()))
            .with_inputs(["i0", "i1"])
            .with_measurement("preset_time", "1 t1")
            .with_datafile("text:norm", "exafs.001")
            .with_plot("gnuplot:continuous", "");
        let region = &exafs().regions("exafs").unwrap()[1];
        let child = child_config(&parent, 1, region, timer_name(&parent).unwrap());

        assert_eq!(child.name, "exafs.region1");
        assert_eq!(child.measurement_arguments, "0.002 t1");
        assert_eq!(child.datafile_description, "child:norm");
        assert_eq!(child.datafile_name, "exafs");
        assert_eq!(child.plot_description, "child:continuous");
        assert_eq!(child.plot_arguments, "exafs");
        assert_eq!(child.input_devices, vec!["i0", "i1"]);
        assert_eq!(child.pattern.counts(), vec![2]);
    }

    #[test]
    fn timer_must_follow_a_nominal_time() {
        let parent = ScanConfig::new("exafs", ScanPattern::Xafs(exafs()))
            .with_measurement("preset_time", "t1");
        assert!(matches!(
            timer_name(&parent),
            Err(ScanError::UnparseableArguments(_))
        ));
    }
}
