//! Top-level scan execution.
//!
//! [`ScanEngine::perform_scan`] resolves every record a scan refers to,
//! applies quick-scan speeds, configures the measurement and then runs the
//! configured number of repeats. Each repeat opens the sinks and handler
//! lists in `prepare_for_scan_start`, walks the step grid, and releases them
//! again in `cleanup_after_scan_end`, whatever the walk returned.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = ScanConfig::load("config/scans/theta_line.toml")?;
//! let records = Arc::new(Settings::new(None)?.mock_records());
//! let mut engine = ScanEngine::new(config, records);
//! let report = engine.perform_scan().await?;
//! println!("{:?}: {} measurements", report.outcome, report.measurements);
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ScanConfig, ShutterPolicy};
use crate::coordinator::{ScanRun, ScanState};
use crate::error::{ScanError, ScanResult};
use crate::hardware::Motor;
use crate::interrupt::{DefaultPauseHandler, InterruptFlag, PauseHandler};
use crate::logging::PROGRESS_TARGET;
use crate::measurement::Measurement;
use crate::permit::PermitFaultController;
use crate::records::{MeasurementCounter, ParentScan, Records};
use crate::registry::DriverRegistry;
use crate::retry::PauseRetry;
use crate::sink::DataSink;
use crate::walker::execute_scan_body;
use crate::xafs::execute_regions;

/// Missing record names listed in a NotFound message
const MAX_MISSING_LISTED: usize = 5;

/// How a scan ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    /// Every repeat ran to the end
    Complete,
    /// The pause handler asked the scan to stop
    Stopped,
    /// The scan was aborted
    Aborted,
}

/// Summary of one `perform_scan` call
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    /// Unique identifier of this run
    pub run_uid: Uuid,
    /// Scan name
    pub scan: String,
    /// How the scan ended
    pub outcome: ScanOutcome,
    /// Repeats that ran to the end
    pub repeats_completed: usize,
    /// Measurements written, over all repeats
    pub measurements: u64,
    /// Datafiles closed, in order
    pub datafiles: Vec<String>,
    /// Name the next datafile will get
    pub next_datafile_name: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
}

/// Runs one configured scan against a record database
pub struct ScanEngine {
    config: ScanConfig,
    records: Arc<Records>,
    registry: Arc<DriverRegistry>,
    pause_handler: Arc<dyn PauseHandler>,
    interrupt: InterruptFlag,
    datafile_name: String,
}

impl ScanEngine {
    /// Engine with the built-in drivers and a pause handler that resumes
    pub fn new(config: ScanConfig, records: Arc<Records>) -> Self {
        let datafile_name = config.datafile_name.clone();
        Self {
            config,
            records,
            registry: Arc::new(DriverRegistry::new()),
            pause_handler: Arc::new(DefaultPauseHandler),
            interrupt: InterruptFlag::new(),
            datafile_name,
        }
    }

    /// Use `registry` for custom drivers and the plot command
    pub fn with_registry(mut self, registry: Arc<DriverRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Decide what happens after a pause
    pub fn with_pause_handler(mut self, handler: Arc<dyn PauseHandler>) -> Self {
        self.pause_handler = handler;
        self
    }

    /// Share an existing interrupt flag
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Handle for requesting a pause or abort from another task
    pub fn interrupt(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    /// Scan description
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Datafile name the next run writes to
    pub fn datafile_name(&self) -> &str {
        &self.datafile_name
    }

    /// Engine for a child scan sharing this engine's records, drivers,
    /// pause handler and interrupt flag
    pub fn child(&self, config: ScanConfig) -> ScanEngine {
        ScanEngine::new(config, self.records.clone())
            .with_registry(self.registry.clone())
            .with_pause_handler(self.pause_handler.clone())
            .with_interrupt(self.interrupt.clone())
    }

    /// Run the scan `num_scans` times.
    ///
    /// Stopping and aborting are reported through [`ScanOutcome`]; any other
    /// failure is returned as an error after every resource is released.
    #[instrument(skip(self), fields(scan = %self.config.name), err)]
    pub async fn perform_scan(&mut self) -> ScanResult<ScanReport> {
        let run_uid = Uuid::new_v4();
        let started_at = Utc::now();
        let name = self.config.name.clone();
        info!(%run_uid, "Starting scan");

        let mut run = match self.build_run() {
            Ok(run) => run,
            Err(e) => {
                report_failure(&name, &e);
                return Err(e);
            }
        };

        let mut report = ScanReport {
            run_uid,
            scan: name.clone(),
            outcome: ScanOutcome::Complete,
            repeats_completed: 0,
            measurements: 0,
            datafiles: Vec::new(),
            next_datafile_name: self.datafile_name.clone(),
            started_at,
            finished_at: started_at,
        };

        let result = self.run_repeats(&mut run, &mut report).await;
        self.datafile_name = run.datafile_name.clone();
        report.next_datafile_name = run.datafile_name.clone();
        report.finished_at = Utc::now();
        self.interrupt.clear();

        match result {
            Ok(()) => {
                run.finish_scan().await;
                info!(target: PROGRESS_TARGET, "Scan '{name}' complete.");
                Ok(report)
            }
            Err(ScanError::StopRequested) => {
                run.finish_scan().await;
                report.outcome = ScanOutcome::Stopped;
                info!(target: PROGRESS_TARGET, "Scan '{name}' stopped.");
                Ok(report)
            }
            Err(ScanError::Interrupted) => {
                run.finish_scan().await;
                report.outcome = ScanOutcome::Aborted;
                warn!(target: PROGRESS_TARGET, "Scan '{name}' aborted.");
                Ok(report)
            }
            Err(e) => {
                run.handle_abnormal_termination(&e).await;
                Err(e)
            }
        }
    }

    async fn run_repeats(&self, run: &mut ScanRun, report: &mut ScanReport) -> ScanResult<()> {
        run.apply_quick_scan_speeds(&self.config).await?;
        run.measurement.configure().await?;

        let early_move = self
            .config
            .early_move_policy
            .use_early_move(self.config.flags.early_move);

        for repeat in 0..self.config.num_scans {
            debug!(scan = %run.name, repeat, "Starting scan repeat");
            run.state = ScanState::new(&run.pattern, run.inputs.len());

            let prepared = run.prepare_for_scan_start(&self.config, &self.registry).await;
            let before = run.counter.get();
            let body = match (prepared, self.config.pattern.xafs()) {
                (Ok(()), Some(regions)) => execute_regions(self, run, regions).await,
                (Ok(()), None) => execute_scan_body(run, early_move).await,
                (Err(e), _) => Err(e),
            };
            report.measurements += run.counter.get().saturating_sub(before);

            let cleanup = run.cleanup_after_scan_end(body.is_ok()).await;
            if let Ok(Some(closed)) = &cleanup {
                report.datafiles.push(closed.clone());
            }

            body?;
            cleanup?;
            report.repeats_completed += 1;
        }
        Ok(())
    }

    /// Resolve every name in the configuration without touching hardware
    fn build_run(&self) -> ScanResult<ScanRun> {
        let config = &self.config;
        config.validate()?;

        let missing = self.records.missing(config.referenced_records());
        if !missing.is_empty() {
            let mut listed = missing
                .iter()
                .take(MAX_MISSING_LISTED)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            if missing.len() > MAX_MISSING_LISTED {
                listed.push_str(", ...");
            }
            return Err(ScanError::NotFound(format!(
                "Scan '{}' refers to {} record(s) that do not exist: {listed}",
                config.name,
                missing.len()
            )));
        }

        let motors = config
            .pattern
            .motor_names()
            .into_iter()
            .map(|name| self.records.motor(name))
            .collect::<ScanResult<Vec<_>>>()?;
        let inputs = config
            .input_devices
            .iter()
            .map(|name| self.records.input(name))
            .collect::<ScanResult<Vec<_>>>()?;
        let shutter = config
            .shutter
            .as_deref()
            .map(|name| self.records.relay(name))
            .transpose()?;

        let measurement = Measurement::parse(
            &config.measurement_type,
            &config.measurement_arguments,
            &self.records,
            &self.registry,
        )?;

        let (datafile, datafile_options) = self
            .registry
            .create_datafile(&config.datafile_description, &self.datafile_name)?;
        let (plot, plot_options) = self.registry.create_plot(
            &config.plot_description,
            &config.plot_arguments,
            &self.datafile_name,
        )?;
        let resolve_x = |names: &[String]| -> ScanResult<Vec<Arc<dyn Motor>>> {
            names.iter().map(|name| self.records.motor(name)).collect()
        };
        let datafile_x = resolve_x(&datafile_options.x_motors)?;
        let plot_x = resolve_x(&plot_options.x_motors)?;

        let retry = PauseRetry::new(
            &config.name,
            motors.clone(),
            self.pause_handler.clone(),
            self.interrupt.clone(),
        )
        .with_gating_device(measurement.gating_device());

        Ok(ScanRun {
            name: config.name.clone(),
            pattern: config.pattern.clone(),
            state: ScanState::new(&config.pattern, inputs.len()),
            motors,
            inputs,
            shutter,
            shutter_policy: config.shutter_policy,
            settling_time: config.settling_time,
            suppress_progress: config.flags.suppress_progress,
            plot_enabled: config.plot_enabled,
            measurement,
            handlers: PermitFaultController::new(),
            datafile: Arc::new(Mutex::new(datafile)),
            datafile_options,
            datafile_x,
            datafile_name: self.datafile_name.clone(),
            plot: Arc::new(Mutex::new(plot)),
            plot_options,
            plot_x,
            records: self.records.clone(),
            interrupt: self.interrupt.clone(),
            retry: Arc::new(retry),
            counter: MeasurementCounter::new(),
            saved_speeds: Vec::new(),
        })
    }
}

fn report_failure(name: &str, e: &ScanError) {
    error!(
        target: PROGRESS_TARGET,
        error = %e,
        "Scan '{name}' terminated with error code {}.",
        e.code()
    );
}

// =============================================================================
// Setup and teardown
// =============================================================================

impl ScanRun {
    /// Save the current speed of each quick-scan motor and apply the new one
    pub async fn apply_quick_scan_speeds(&mut self, config: &ScanConfig) -> ScanResult<()> {
        let Some(quick) = &config.quick_scan else {
            return Ok(());
        };
        for (name, speed) in &quick.speeds {
            let motor = self.records.motor(name)?;
            let saved = motor.speed().await?;
            self.saved_speeds.push((motor.clone(), saved));
            motor.set_speed(*speed).await?;
            debug!(motor = %name, saved, speed, "Applied quick-scan speed");
        }
        Ok(())
    }

    /// Put back every speed saved by `apply_quick_scan_speeds`
    pub async fn restore_speeds(&mut self) {
        while let Some((motor, speed)) = self.saved_speeds.pop() {
            if let Err(e) = motor.set_speed(speed).await {
                warn!(motor = %motor.name(), error = %e, "Failed to restore motor speed");
            }
        }
    }

    /// Create the handler lists, open the sinks and publish this scan to
    /// child scans.
    pub async fn prepare_for_scan_start(
        &mut self,
        config: &ScanConfig,
        registry: &DriverRegistry,
    ) -> ScanResult<()> {
        self.handlers = PermitFaultController::create(
            &config.permit_handlers,
            &config.fault_handlers,
            registry,
            &self.records,
        )?;

        for input in &self.inputs {
            input.update_dark_current().await?;
        }

        let step_number = self.state.step_number.clone();
        {
            let datafile = self.datafile.clone();
            let mut datafile = datafile.lock().await;
            datafile
                .open(
                    &self.datafile_name,
                    &self.datafile_scope(&step_number),
                    &self.records,
                )
                .await?;
            self.state.datafile_open = true;
            datafile
                .write_main_header(&self.datafile_scope(&step_number))
                .await?;

            match &*datafile {
                DataSink::Child(child) => {
                    let parent = self.records.find_parent_scan(child.parent_name()).await?;
                    self.counter = parent.counter;
                }
                _ => self.counter.reset(),
            }
        }

        if self.plot_enabled {
            let plot = self.plot.clone();
            let mut plot = plot.lock().await;
            plot.open(&self.plot_scope(&step_number), &self.records)
                .await?;
            self.state.plot_open = true;
        }

        self.records
            .register_scan(
                &self.name,
                ParentScan {
                    datafile: self.datafile.clone(),
                    plot: self.plot.clone(),
                    counter: self.counter.clone(),
                },
            )
            .await;

        if self.shutter_policy == ShutterPolicy::OpenForScan {
            if let Some(relay) = &self.shutter {
                relay.set_open(true).await?;
            }
        }
        Ok(())
    }

    /// Release everything `prepare_for_scan_start` acquired.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned. On a successful datafile close the closed filename is
    /// returned and the scan moves on to the next version.
    pub async fn cleanup_after_scan_end(&mut self, completed: bool) -> ScanResult<Option<String>> {
        let mut first_error: Option<ScanError> = None;
        let mut closed = None;

        if self.shutter_policy == ShutterPolicy::OpenForScan {
            if let Some(relay) = &self.shutter {
                if let Err(e) = relay.set_open(false).await {
                    warn!(relay = %relay.name(), error = %e, "Failed to close shutter");
                    first_error.get_or_insert(e.into());
                }
            }
        }

        if self.state.datafile_open {
            let step_number = self.state.step_number.clone();
            let datafile = self.datafile.clone();
            let mut datafile = datafile.lock().await;
            if completed {
                if let Err(e) = datafile
                    .write_trailer(&self.datafile_scope(&step_number))
                    .await
                {
                    first_error.get_or_insert(e);
                }
            }
            match datafile.close(&self.datafile_name).await {
                Ok(Some(next)) => {
                    debug!(closed = %self.datafile_name, next = %next, "Closed datafile");
                    closed = Some(std::mem::replace(&mut self.datafile_name, next));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(datafile = %self.datafile_name, error = %e, "Failed to close datafile");
                    first_error.get_or_insert(e);
                }
            }
            self.state.datafile_open = false;
        }

        if self.state.fast_mode_owned {
            if let Err(e) = self.records.set_fast_mode(false).await {
                first_error.get_or_insert(e);
            }
            self.state.fast_mode_owned = false;
        }

        self.handlers.free();

        if self.state.plot_open {
            if let Err(e) = self.plot.lock().await.close().await {
                warn!(error = %e, "Failed to close plot");
                first_error.get_or_insert(e);
            }
            self.state.plot_open = false;
        }

        self.records.unregister_scan(&self.name).await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }

    /// Restore speeds, deconfigure the measurement and free the handlers.
    ///
    /// Safe to call any number of times.
    pub async fn finish_scan(&mut self) {
        self.restore_speeds().await;
        if self.measurement.needs_deconfigure() {
            if let Err(e) = self.measurement.deconfigure().await {
                warn!(scan = %self.name, error = %e, "Failed to deconfigure measurement");
            }
        }
        self.handlers.free();
    }

    /// Release everything and report `error` as the scan's termination code
    pub async fn handle_abnormal_termination(&mut self, error: &ScanError) {
        self.finish_scan().await;
        report_failure(&self.name, error);
    }
}
