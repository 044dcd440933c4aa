//! Device database used for name resolution.
//!
//! Scans refer to motors, gating devices, inputs and shutters by record
//! name. `Records` maps those names to capability handles and reports the
//! two resolution failures the engine distinguishes: a name that does not
//! exist (`NotFound`) and a name that exists with the wrong device class
//! (`TypeMismatch`).
//!
//! Open scans also register themselves here so that child sinks can find
//! their parent scan by name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{ScanError, ScanResult};
use crate::hardware::{DigitalOutput, InputDevice, Motor, Relay, Triggerable};
use crate::sink::{DataSink, PlotSink};

/// Measurement counter shared between a scan and its child scans
#[derive(Debug, Clone, Default)]
pub struct MeasurementCounter(Arc<AtomicU64>);

impl MeasurementCounter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Increment and return the new value
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reset to zero
    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// Handles a running scan exposes to its child scans
#[derive(Clone)]
pub struct ParentScan {
    /// Parent's open datafile
    pub datafile: Arc<Mutex<DataSink>>,
    /// Parent's open plot
    pub plot: Arc<Mutex<PlotSink>>,
    /// Parent's measurement counter
    pub counter: MeasurementCounter,
}

/// Name → device handle tables
#[derive(Default)]
pub struct Records {
    motors: HashMap<String, Arc<dyn Motor>>,
    triggerables: HashMap<String, Arc<dyn Triggerable>>,
    inputs: HashMap<String, Arc<dyn InputDevice>>,
    relays: HashMap<String, Arc<dyn Relay>>,
    outputs: HashMap<String, Arc<dyn DigitalOutput>>,
    scans: RwLock<HashMap<String, ParentScan>>,
    fast_mode: AtomicBool,
}

impl Records {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a motor
    pub fn with_motor(mut self, motor: Arc<dyn Motor>) -> Self {
        self.motors.insert(motor.name().to_string(), motor);
        self
    }

    /// Add a gating device
    pub fn with_triggerable(mut self, device: Arc<dyn Triggerable>) -> Self {
        self.triggerables.insert(device.name().to_string(), device);
        self
    }

    /// Add an input device
    pub fn with_input(mut self, device: Arc<dyn InputDevice>) -> Self {
        self.inputs.insert(device.name().to_string(), device);
        self
    }

    /// Add a relay
    pub fn with_relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.relays.insert(relay.name().to_string(), relay);
        self
    }

    /// Add a digital output
    pub fn with_output(mut self, output: Arc<dyn DigitalOutput>) -> Self {
        self.outputs.insert(output.name().to_string(), output);
        self
    }

    /// True if any table (or an open scan) uses `name`
    pub fn contains(&self, name: &str) -> bool {
        self.motors.contains_key(name)
            || self.triggerables.contains_key(name)
            || self.inputs.contains_key(name)
            || self.relays.contains_key(name)
            || self.outputs.contains_key(name)
    }

    fn resolve<T: ?Sized>(
        &self,
        table: &HashMap<String, Arc<T>>,
        name: &str,
        class: &str,
    ) -> ScanResult<Arc<T>> {
        if let Some(device) = table.get(name) {
            return Ok(device.clone());
        }
        if self.contains(name) {
            return Err(ScanError::TypeMismatch(format!(
                "Record '{name}' is not a {class}."
            )));
        }
        Err(ScanError::NotFound(format!(
            "The {class} record '{name}' does not exist."
        )))
    }

    /// Look up a motor
    pub fn motor(&self, name: &str) -> ScanResult<Arc<dyn Motor>> {
        self.resolve(&self.motors, name, "motor")
    }

    /// Look up a timer or scaler usable as a gating device
    pub fn triggerable(&self, name: &str) -> ScanResult<Arc<dyn Triggerable>> {
        self.resolve(&self.triggerables, name, "timer or scaler")
    }

    /// Look up an input device
    pub fn input(&self, name: &str) -> ScanResult<Arc<dyn InputDevice>> {
        self.resolve(&self.inputs, name, "input device")
    }

    /// Look up a relay
    pub fn relay(&self, name: &str) -> ScanResult<Arc<dyn Relay>> {
        self.resolve(&self.relays, name, "relay")
    }

    /// Look up a digital output
    pub fn output(&self, name: &str) -> ScanResult<Arc<dyn DigitalOutput>> {
        self.resolve(&self.outputs, name, "digital output")
    }

    /// Every gating device wired to `gate`
    pub fn triggerables_on_gate(&self, gate: &str) -> Vec<Arc<dyn Triggerable>> {
        let mut devices: Vec<_> = self
            .triggerables
            .values()
            .filter(|device| device.gate() == gate)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.name().cmp(b.name()));
        devices
    }

    /// The subset of `names` not present in any table, in order
    pub fn missing<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        names
            .into_iter()
            .filter(|name| !self.contains(name))
            .map(str::to_string)
            .collect()
    }

    /// Names of all registered motors, sorted
    pub fn motor_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.motors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Make a running scan visible to child scans
    pub async fn register_scan(&self, name: &str, parent: ParentScan) {
        debug!(scan = %name, "Registering open scan");
        self.scans.write().await.insert(name.to_string(), parent);
    }

    /// Remove a scan registered with [`register_scan`](Self::register_scan)
    pub async fn unregister_scan(&self, name: &str) {
        self.scans.write().await.remove(name);
    }

    /// Find the open parent scan a child sink delegates to
    pub async fn find_parent_scan(&self, name: &str) -> ScanResult<ParentScan> {
        if let Some(parent) = self.scans.read().await.get(name) {
            return Ok(parent.clone());
        }
        if self.contains(name) {
            return Err(ScanError::TypeMismatch(format!(
                "Record '{name}' named as a parent scan is not a scan."
            )));
        }
        Err(ScanError::NotFound(format!(
            "Parent scan '{name}' is not running."
        )))
    }

    /// Whether cached-parameter mode is active
    pub fn fast_mode(&self) -> bool {
        self.fast_mode.load(Ordering::SeqCst)
    }

    /// Switch cached-parameter mode on every motor
    pub async fn set_fast_mode(&self, enabled: bool) -> ScanResult<()> {
        self.fast_mode.store(enabled, Ordering::SeqCst);
        for motor in self.motors.values() {
            if let Err(e) = motor.set_fast_mode(enabled).await {
                warn!(motor = %motor.name(), error = %e, "Failed to change fast mode");
                return Err(e.into());
            }
        }
        Ok(())
    }
}
