//! Move coordination and per-step acquisition.
//!
//! A [`ScanRun`] holds every resolved resource of one scan: motors, inputs,
//! measurement, permit/fault handlers, sinks and the retry wrapper. The
//! walker calls [`ScanRun::do_normal_line`] or
//! [`ScanRun::do_early_move_line`] once per innermost line.
//!
//! Under the normal strategy each step moves, waits, measures and then
//! writes. Under early move the next move is started right after the
//! acquisition, and the readout and output of the step just measured happen
//! while that move is in flight. Both produce the same destinations and the
//! same rows.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ScanPattern, ShutterPolicy};
use crate::error::{ScanError, ScanResult};
use crate::hardware::{InputDevice, Motor, Relay};
use crate::interrupt::InterruptFlag;
use crate::logging::PROGRESS_TARGET;
use crate::measurement::Measurement;
use crate::permit::{PermitFaultController, ResetStage};
use crate::records::{MeasurementCounter, Records};
use crate::retry::{PauseRetry, RetrySite};
use crate::sink::{format_reading, DataSink, PlotSink, ResolutionScope, SinkOptions};

/// Wait until no motor in `motors` is busy.
///
/// With `ignore_pause` only an abort request ends the wait early.
pub async fn wait_for_motor_array_stop(
    motors: &[Arc<dyn Motor>],
    interrupt: &InterruptFlag,
    ignore_pause: bool,
) -> ScanResult<()> {
    interrupt
        .poll_until(ignore_pause, || async move {
            for motor in motors {
                if motor.is_busy().await? {
                    return Ok(false);
                }
            }
            Ok::<bool, ScanError>(true)
        })
        .await
}

/// Mutable state of one scan repeat
#[derive(Debug, Clone, Default)]
pub struct ScanState {
    /// One index per walker dimension, outermost first
    pub step_number: Vec<usize>,
    /// Positions most recently commanded
    pub destinations: Vec<f64>,
    /// Positions of the step being written out
    pub old_destinations: Vec<f64>,
    /// Last readout of each input device
    pub readings: Vec<f64>,
    /// Positions of the datafile's alternate X motors
    pub datafile_x_positions: Vec<f64>,
    /// Positions of the plot's alternate X motors
    pub plot_x_positions: Vec<f64>,
    /// Plot section, advanced after every innermost line
    pub section_number: u64,
    /// Set when this scan switched fast mode on
    pub fast_mode_owned: bool,
    /// Set while the datafile is open
    pub datafile_open: bool,
    /// Set while the plot is open
    pub plot_open: bool,
}

impl ScanState {
    /// Fresh state for a scan over `pattern`
    pub fn new(pattern: &ScanPattern, num_inputs: usize) -> Self {
        let dimensions = pattern.counts().len();
        let num_motors = pattern.motor_names().len();
        let step_number = vec![0; dimensions];
        let destinations = pattern
            .positions(&step_number)
            .unwrap_or_else(|_| vec![0.0; num_motors]);

        Self {
            step_number,
            old_destinations: destinations.clone(),
            destinations,
            readings: vec![0.0; num_inputs],
            ..Default::default()
        }
    }
}

/// Resolved resources and live state of one scan
pub struct ScanRun {
    pub(crate) name: String,
    pub(crate) pattern: ScanPattern,
    pub(crate) motors: Vec<Arc<dyn Motor>>,
    pub(crate) inputs: Vec<Arc<dyn InputDevice>>,
    pub(crate) shutter: Option<Arc<dyn Relay>>,
    pub(crate) shutter_policy: ShutterPolicy,
    pub(crate) settling_time: Duration,
    pub(crate) suppress_progress: bool,
    pub(crate) plot_enabled: bool,
    pub(crate) measurement: Measurement,
    pub(crate) handlers: PermitFaultController,
    pub(crate) datafile: Arc<Mutex<DataSink>>,
    pub(crate) datafile_options: SinkOptions,
    pub(crate) datafile_x: Vec<Arc<dyn Motor>>,
    pub(crate) datafile_name: String,
    pub(crate) plot: Arc<Mutex<PlotSink>>,
    pub(crate) plot_options: SinkOptions,
    pub(crate) plot_x: Vec<Arc<dyn Motor>>,
    pub(crate) records: Arc<Records>,
    pub(crate) interrupt: InterruptFlag,
    pub(crate) retry: Arc<PauseRetry>,
    pub(crate) counter: MeasurementCounter,
    pub(crate) saved_speeds: Vec<(Arc<dyn Motor>, f64)>,
    pub(crate) state: ScanState,
}

impl ScanRun {
    /// Scan name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live state
    pub fn state(&self) -> &ScanState {
        &self.state
    }

    /// Measurements completed so far
    pub fn measurement_number(&self) -> u64 {
        self.counter.get()
    }

    // =========================================================================
    // Motion
    // =========================================================================

    /// Compute the destinations for the current step vector
    pub fn set_destinations(&mut self) -> ScanResult<()> {
        self.state.destinations = self.pattern.positions(&self.state.step_number)?;
        if self.state.destinations.len() != self.motors.len() {
            return Err(ScanError::CorruptState(format!(
                "Scan '{}' computed {} destinations for {} motors.",
                self.name,
                self.state.destinations.len(),
                self.motors.len()
            )));
        }
        Ok(())
    }

    /// Command every motor to its destination without waiting
    pub async fn start_move(&mut self) -> ScanResult<()> {
        self.interrupt.check()?;
        for (motor, position) in self.motors.iter().zip(&self.state.destinations) {
            debug!(motor = %motor.name(), position, "Starting move");
            motor.move_absolute(*position).await?;
        }
        Ok(())
    }

    /// Wait for every motor to come to rest
    pub async fn wait_for_stop(&mut self) -> ScanResult<()> {
        wait_for_motor_array_stop(&self.motors, &self.interrupt, false).await
    }

    async fn move_to_destinations(&mut self) -> ScanResult<()> {
        let retry = self.retry.clone();
        retry
            .run(RetrySite::Move, self, |run| Box::pin(run.start_move()))
            .await
    }

    async fn wait_for_motors(&mut self) -> ScanResult<()> {
        let retry = self.retry.clone();
        retry
            .run(RetrySite::WaitForStop, self, |run| Box::pin(run.wait_for_stop()))
            .await
    }

    // =========================================================================
    // Measurement
    // =========================================================================

    /// Gate one measurement, handling the per-datapoint shutter and the
    /// settling delay.
    pub async fn measure_data(&mut self) -> ScanResult<()> {
        let shutter = match self.shutter_policy {
            ShutterPolicy::OpenForDatapoint => self.shutter.clone(),
            _ => None,
        };
        if let Some(relay) = &shutter {
            relay.set_open(true).await?;
        }

        let mut result = Ok(());
        if !self.settling_time.is_zero() {
            result = self.interrupt.sleep(self.settling_time).await;
        }
        if result.is_ok() {
            result = self
                .measurement
                .acquire_data(&self.inputs, &self.interrupt)
                .await;
        }

        if let Some(relay) = &shutter {
            if let Err(e) = relay.set_open(false).await {
                warn!(relay = %relay.name(), error = %e, "Failed to close shutter");
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        result
    }

    /// Read every input device into the state
    pub async fn readout(&mut self) -> ScanResult<()> {
        for (input, value) in self.inputs.iter().zip(self.state.readings.iter_mut()) {
            *value = input.read().await?;
        }
        Ok(())
    }

    /// Measure and read out until no fault handler objects
    pub async fn acquire_and_readout(&mut self) -> ScanResult<()> {
        self.handlers
            .reset_all_faults(ResetStage::PrepareForFirstAttempt)
            .await?;

        loop {
            self.interrupt.check()?;
            self.handlers.wait_for_all_permits(&self.interrupt).await?;
            self.measure_data().await?;
            self.readout().await?;

            if !self.handlers.check_for_all_faults().await? {
                return Ok(());
            }
            warn!(
                scan = %self.name,
                "The measurement just performed was bad.  Retrying the measurement."
            );
        }
    }

    /// Measure without reading out, for early move
    pub async fn acquire_data(&mut self) -> ScanResult<()> {
        self.handlers
            .reset_all_faults(ResetStage::PrepareForFirstAttempt)
            .await?;
        self.interrupt.check()?;
        self.handlers.wait_for_all_permits(&self.interrupt).await?;
        self.measure_data().await
    }

    /// Read the alternate X motors.
    ///
    /// A plot X motor that is also a datafile X motor reuses that reading.
    pub async fn resolve_alternate_x(&mut self) -> ScanResult<()> {
        let mut datafile_positions = Vec::with_capacity(self.datafile_x.len());
        for motor in &self.datafile_x {
            datafile_positions.push(motor.get_position().await?);
        }

        let mut plot_positions = Vec::with_capacity(self.plot_x.len());
        for motor in &self.plot_x {
            let shared = self
                .datafile_x
                .iter()
                .position(|candidate| candidate.name() == motor.name());
            let position = match shared {
                Some(index) => datafile_positions[index],
                None => motor.get_position().await?,
            };
            plot_positions.push(position);
        }

        self.state.datafile_x_positions = datafile_positions;
        self.state.plot_x_positions = plot_positions;
        Ok(())
    }

    // =========================================================================
    // Output
    // =========================================================================

    fn normalization(&self, options: &SinkOptions) -> Option<f64> {
        if options.normalize {
            self.measurement.measurement_time()
        } else {
            None
        }
    }

    fn scope<'a>(
        &'a self,
        step_number: &'a [usize],
        x_motors: &'a [Arc<dyn Motor>],
        x_positions: &'a [f64],
        normalization: Option<f64>,
    ) -> ResolutionScope<'a> {
        ResolutionScope {
            scan: &self.name,
            datafile_name: &self.datafile_name,
            motors: &self.motors,
            positions: &self.state.old_destinations,
            x_motors,
            x_positions,
            inputs: &self.inputs,
            readings: &self.state.readings,
            normalization,
            step_number,
            measurement_number: self.counter.get(),
            section_number: self.state.section_number,
        }
    }

    /// Scope describing this scan to its datafile
    pub fn datafile_scope<'a>(&'a self, step_number: &'a [usize]) -> ResolutionScope<'a> {
        self.scope(
            step_number,
            &self.datafile_x,
            &self.state.datafile_x_positions,
            self.normalization(&self.datafile_options),
        )
    }

    /// Scope describing this scan to its plot
    pub fn plot_scope<'a>(&'a self, step_number: &'a [usize]) -> ResolutionScope<'a> {
        self.scope(
            step_number,
            &self.plot_x,
            &self.state.plot_x_positions,
            self.normalization(&self.plot_options),
        )
    }

    /// Progress line for the step being written out
    pub fn progress_line(&self, step_number: &[usize]) -> String {
        let mut line = String::new();
        if !self.datafile_x.is_empty() {
            for position in &self.state.datafile_x_positions {
                line.push_str(&format!(" {position:.3}"));
            }
        } else if self.motors.is_empty() {
            line.push_str(&format!(" {}", step_number.first().copied().unwrap_or(0)));
        } else {
            for position in &self.state.old_destinations {
                line.push_str(&format!(" {position:.3}"));
            }
        }

        line.push_str(" - ");
        let normalization = self.normalization(&self.datafile_options);
        for (input, value) in self.inputs.iter().zip(&self.state.readings) {
            line.push_str(&format_reading(input.as_ref(), *value, normalization));
            line.push(' ');
        }
        line
    }

    /// Write the step just measured to every sink and count it
    async fn record_measurement(
        &self,
        step_number: &[usize],
        first_in_line: bool,
    ) -> ScanResult<()> {
        let datafile = self.datafile.clone();
        datafile
            .lock()
            .await
            .append_measurement(&self.datafile_scope(step_number))
            .await?;

        if !self.suppress_progress {
            info!(
                target: PROGRESS_TARGET,
                scan = %self.name,
                "{}",
                self.progress_line(step_number)
            );
        }

        if self.plot_enabled {
            let plot = self.plot.clone();
            let scope = self.plot_scope(step_number);
            let mut plot = plot.lock().await;
            if first_in_line {
                plot.start_section(&scope).await?;
            }
            plot.add_measurement(&scope).await?;
            plot.display().await?;
        }

        self.counter.increment();
        Ok(())
    }

    pub(crate) async fn start_fast_mode(&mut self) -> ScanResult<()> {
        debug!(scan = %self.name, "Enabling fast mode");
        self.records.set_fast_mode(true).await?;
        self.state.fast_mode_owned = true;
        Ok(())
    }

    // =========================================================================
    // Lines
    // =========================================================================

    fn innermost(&self) -> ScanResult<(usize, usize)> {
        let counts = self.pattern.counts();
        let index = counts.len().checked_sub(1).ok_or_else(|| {
            ScanError::CorruptState(format!("Scan '{}' has no dimensions.", self.name))
        })?;
        Ok((index, counts[index]))
    }

    /// Walk the innermost dimension one step at a time
    pub async fn do_normal_line(&mut self) -> ScanResult<()> {
        let (index, count) = self.innermost()?;
        let start_fast_mode = !self.records.fast_mode();

        for i in 0..count {
            self.state.step_number[index] = i;
            self.set_destinations()?;
            self.move_to_destinations().await?;
            self.wait_for_motors().await?;

            let retry = self.retry.clone();
            retry
                .run(RetrySite::Acquire, self, |run| Box::pin(run.acquire_and_readout()))
                .await?;

            self.resolve_alternate_x().await?;
            self.state.old_destinations = self.state.destinations.clone();

            let step_number = self.state.step_number.clone();
            self.record_measurement(&step_number, i == 0).await?;

            if i == 0 && start_fast_mode {
                self.start_fast_mode().await?;
            }
        }
        Ok(())
    }

    /// Walk the innermost dimension, moving to the next position while the
    /// current one is read out
    pub async fn do_early_move_line(&mut self) -> ScanResult<()> {
        let (index, count) = self.innermost()?;
        if count == 0 {
            return Ok(());
        }
        let start_fast_mode = !self.records.fast_mode();

        self.state.step_number[index] = 0;
        self.set_destinations()?;
        self.move_to_destinations().await?;

        for i in 0..count {
            self.wait_for_motors().await?;
            self.resolve_alternate_x().await?;

            let retry = self.retry.clone();
            retry
                .run(RetrySite::Acquire, self, |run| Box::pin(run.acquire_data()))
                .await?;

            let measured_step = self.state.step_number.clone();
            self.state.old_destinations = self.state.destinations.clone();

            if i + 1 < count {
                self.state.step_number[index] = i + 1;
                self.set_destinations()?;
                self.move_to_destinations().await?;
            }

            self.readout().await?;
            self.record_measurement(&measured_step, i == 0).await?;

            if i == 0 && start_fast_mode {
                self.start_fast_mode().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockMotor;

    #[tokio::test]
    async fn motor_array_wait_sees_every_motor() {
        let fast = Arc::new(MockMotor::new("fast").with_speed(100_000.0));
        let slow = Arc::new(MockMotor::new("slow").with_speed(100.0));
        fast.move_absolute(1.0).await.unwrap();
        slow.move_absolute(2.0).await.unwrap();

        let motors: Vec<Arc<dyn Motor>> = vec![fast, slow.clone()];
        wait_for_motor_array_stop(&motors, &InterruptFlag::new(), false)
            .await
            .unwrap();
        assert_eq!(slow.get_position().await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn motor_array_wait_ignores_pause_on_request() {
        let motor = Arc::new(MockMotor::new("m1").with_speed(200.0));
        motor.move_absolute(1.0).await.unwrap();
        let motors: Vec<Arc<dyn Motor>> = vec![motor];

        let interrupt = InterruptFlag::new();
        interrupt.request_pause();
        assert!(matches!(
            wait_for_motor_array_stop(&motors, &interrupt, false).await,
            Err(ScanError::PauseRequested)
        ));
        wait_for_motor_array_stop(&motors, &interrupt, true)
            .await
            .unwrap();
    }

    #[test]
    fn state_starts_at_the_first_position() {
        let pattern = ScanPattern::Linear {
            axes: vec![
                crate::config::Axis::new("m1", 1.0, 0.5, 2),
                crate::config::Axis::new("m2", -2.0, 1.0, 3),
            ],
        };
        let state = ScanState::new(&pattern, 2);
        assert_eq!(state.step_number, vec![0, 0]);
        assert_eq!(state.destinations, vec![1.0, -2.0]);
        assert_eq!(state.readings, vec![0.0, 0.0]);

        let empty = ScanState::new(
            &ScanPattern::List {
                motors: vec!["m1".to_string()],
                positions: Vec::new(),
            },
            0,
        );
        assert_eq!(empty.destinations, vec![0.0]);
    }
}
