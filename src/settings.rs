//! Application settings.
//!
//! Settings are read with the `config` crate from `config/<name>.toml`
//! (`config/default.toml` when no name is given). They hold the log level,
//! the command line of the plot helper, and the simulated devices the CLI
//! registers before running a scan.

use config::{Config, FileFormat};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::ScanResult;
use crate::hardware::mock::{
    MockDigitalOutput, MockInput, MockMotor, MockRelay, MockScaler, MockTimer,
};
use crate::records::Records;

fn default_log_level() -> String {
    "info".to_string()
}

fn default_speed() -> f64 {
    1000.0
}

fn default_precision() -> usize {
    3
}

fn default_rate() -> f64 {
    1000.0
}

/// Application settings
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Default log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Plot helper command line; empty selects the built-in default
    #[serde(default)]
    pub plot_command: Vec<String>,
    /// Simulated devices
    #[serde(default)]
    pub devices: DeviceSettings,
}

/// Simulated devices, grouped by class
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DeviceSettings {
    #[serde(default)]
    pub motors: Vec<MotorSettings>,
    #[serde(default)]
    pub timers: Vec<TimerSettings>,
    #[serde(default)]
    pub scalers: Vec<ScalerSettings>,
    #[serde(default)]
    pub inputs: Vec<InputSettings>,
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// A simulated motor
#[derive(Debug, Deserialize, Clone)]
pub struct MotorSettings {
    pub name: String,
    #[serde(default)]
    pub position: f64,
    #[serde(default = "default_speed")]
    pub speed: f64,
    #[serde(default = "default_precision")]
    pub precision: usize,
    #[serde(default)]
    pub units: String,
}

/// A simulated timer
#[derive(Debug, Deserialize, Clone)]
pub struct TimerSettings {
    pub name: String,
    /// Gate signal; defaults to the timer's own name
    #[serde(default)]
    pub gate: Option<String>,
}

/// A simulated scaler
#[derive(Debug, Deserialize, Clone)]
pub struct ScalerSettings {
    pub name: String,
    #[serde(default)]
    pub gate: Option<String>,
    /// Counts per second when gating in preset mode
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// Readings of successive measurements
    #[serde(default)]
    pub script: Vec<f64>,
}

/// A simulated analog or digital input
#[derive(Debug, Deserialize, Clone)]
pub struct InputSettings {
    pub name: String,
    /// Values of successive reads; the last one repeats
    pub values: Vec<f64>,
    #[serde(default = "default_precision")]
    pub precision: usize,
}

impl Settings {
    /// Load `config/<name>.toml`, or `config/default.toml`
    pub fn new(config_name: Option<&str>) -> ScanResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()?;

        Ok(s.try_deserialize()?)
    }

    /// Settings from TOML text
    pub fn from_toml_str(text: &str) -> ScanResult<Self> {
        let s = Config::builder()
            .add_source(config::File::from_str(text, FileFormat::Toml))
            .build()?;

        Ok(s.try_deserialize()?)
    }

    /// Register every configured simulated device
    pub fn mock_records(&self) -> Records {
        let devices = &self.devices;
        let mut records = Records::new();

        for motor in &devices.motors {
            records = records.with_motor(Arc::new(
                MockMotor::new(&motor.name)
                    .with_position(motor.position)
                    .with_speed(motor.speed)
                    .with_precision(motor.precision)
                    .with_units(&motor.units),
            ));
        }

        for timer in &devices.timers {
            let gate = timer.gate.as_deref().unwrap_or(&timer.name);
            let device = Arc::new(MockTimer::on_gate(&timer.name, gate));
            records = records.with_triggerable(device.clone()).with_input(device);
        }

        for scaler in &devices.scalers {
            let gate = scaler.gate.as_deref().unwrap_or(&scaler.name);
            let device = Arc::new(
                MockScaler::on_gate(&scaler.name, gate, scaler.rate)
                    .with_script(scaler.script.iter().copied()),
            );
            records = records.with_triggerable(device.clone()).with_input(device);
        }

        for input in &devices.inputs {
            records = records.with_input(Arc::new(
                MockInput::scripted(&input.name, input.values.iter().copied())
                    .with_precision(input.precision),
            ));
        }

        for relay in &devices.relays {
            records = records.with_relay(Arc::new(MockRelay::new(relay)));
        }

        for output in &devices.outputs {
            records = records.with_output(Arc::new(MockDigitalOutput::new(output)));
        }

        records
    }
}
