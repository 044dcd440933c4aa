//! Measurement engine.
//!
//! A measurement gates the scan's input devices through one triggerable
//! (timer or scaler). `configure` switches that device into preset mode and
//! every other triggerable wired to the same gate signal into counter mode;
//! `deconfigure` puts all of them back the way they were.
//!
//! `acquire_data` clears the inputs, starts the gate and polls it to
//! completion while watching the interrupt flag. An interrupted acquisition
//! stops the gating device before returning.

pub mod k_power_law;
pub mod preset;

pub use k_power_law::KPowerLaw;
pub use preset::{PresetKind, PresetMeasurement};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::error::{ScanError, ScanResult};
use crate::hardware::{CounterMode, InputDevice, Triggerable};
use crate::interrupt::InterruptFlag;
use crate::records::Records;
use crate::registry::{lookup, DriverRegistry, MeasurementType, MEASUREMENT_TYPES};

/// Runtime-registered measurement
#[async_trait]
pub trait MeasurementDriver: Send + Sync {
    /// Prepare hardware before the first acquisition
    async fn configure(&mut self) -> ScanResult<()> {
        Ok(())
    }

    /// Undo `configure`
    async fn deconfigure(&mut self) -> ScanResult<()> {
        Ok(())
    }

    /// Perform one gated acquisition; the inputs are already cleared
    async fn acquire_data(&mut self, interrupt: &InterruptFlag) -> ScanResult<()>;

    /// Length of the last acquisition in seconds, when meaningful
    fn measurement_time(&self) -> Option<f64> {
        None
    }

    /// Device gating the acquisition, if any
    fn gating_device(&self) -> Option<Arc<dyn Triggerable>> {
        None
    }
}

/// Measurement variants
pub enum MeasurementKind {
    /// No gating
    None,
    /// Fixed time on a timer
    PresetTime(PresetMeasurement),
    /// Fixed count on a scaler
    PresetCount(PresetMeasurement),
    /// Time growing with k
    KPowerLaw(KPowerLaw),
    /// Runtime-registered driver
    Custom(Box<dyn MeasurementDriver>),
}

/// A configured measurement and the device modes it must restore
pub struct Measurement {
    type_name: String,
    kind: MeasurementKind,
    siblings: Vec<Arc<dyn Triggerable>>,
    prior_modes: Vec<(Arc<dyn Triggerable>, CounterMode)>,
    configured: bool,
}

impl Measurement {
    /// Measurement that does nothing
    pub fn none() -> Self {
        Self::from_kind("none", MeasurementKind::None, Vec::new())
    }

    fn from_kind(
        type_name: &str,
        kind: MeasurementKind,
        siblings: Vec<Arc<dyn Triggerable>>,
    ) -> Self {
        Self {
            type_name: type_name.to_string(),
            kind,
            siblings,
            prior_modes: Vec::new(),
            configured: false,
        }
    }

    /// Build a measurement from its type name and argument string
    pub fn parse(
        type_name: &str,
        arguments: &str,
        records: &Records,
        registry: &DriverRegistry,
    ) -> ScanResult<Self> {
        let kind = match lookup(MEASUREMENT_TYPES, type_name) {
            Some(MeasurementType::None) => MeasurementKind::None,
            Some(MeasurementType::PresetTime) => MeasurementKind::PresetTime(
                PresetMeasurement::parse(PresetKind::Time, arguments, records)?,
            ),
            Some(MeasurementType::PresetCount) => MeasurementKind::PresetCount(
                PresetMeasurement::parse(PresetKind::Count, arguments, records)?,
            ),
            Some(MeasurementType::KPowerLaw) => {
                MeasurementKind::KPowerLaw(KPowerLaw::parse(arguments, records)?)
            }
            None => {
                MeasurementKind::Custom(registry.create_measurement(type_name, arguments, records)?)
            }
        };

        let mut measurement = Self::from_kind(type_name, kind, Vec::new());
        if let Some(gate) = measurement.gating_device() {
            measurement.siblings = records
                .triggerables_on_gate(gate.gate())
                .into_iter()
                .filter(|device| device.name() != gate.name())
                .collect();
        }
        Ok(measurement)
    }

    /// Type name as configured
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The gating timer or scaler
    pub fn gating_device(&self) -> Option<Arc<dyn Triggerable>> {
        match &self.kind {
            MeasurementKind::None => None,
            MeasurementKind::PresetTime(preset) | MeasurementKind::PresetCount(preset) => {
                Some(preset.device.clone())
            }
            MeasurementKind::KPowerLaw(schedule) => Some(schedule.device.clone()),
            MeasurementKind::Custom(driver) => driver.gating_device(),
        }
    }

    /// Duration of a measurement in seconds, where one is defined
    pub fn measurement_time(&self) -> Option<f64> {
        match &self.kind {
            MeasurementKind::PresetTime(preset) => Some(preset.preset),
            MeasurementKind::KPowerLaw(schedule) => schedule.last_exposure(),
            MeasurementKind::Custom(driver) => driver.measurement_time(),
            MeasurementKind::None | MeasurementKind::PresetCount(_) => None,
        }
    }

    /// True between `configure` and `deconfigure`
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Put the gating device into preset mode and its gate siblings into
    /// counter mode, remembering every prior mode.
    ///
    /// On failure every mode already changed is put back before the error is
    /// returned.
    #[instrument(skip(self), fields(measurement = %self.type_name), err)]
    pub async fn configure(&mut self) -> ScanResult<()> {
        if let MeasurementKind::KPowerLaw(schedule) = &mut self.kind {
            schedule.reset();
        }

        let mut result = self.set_gate_modes().await;
        if result.is_ok() {
            if let MeasurementKind::Custom(driver) = &mut self.kind {
                result = driver.configure().await;
            }
        }

        if let Err(e) = result {
            if let Err(restore_err) = self.restore_modes().await {
                warn!(error = %restore_err, "Failed to undo partial measurement configuration");
            }
            return Err(e);
        }
        self.configured = true;
        Ok(())
    }

    async fn set_gate_modes(&mut self) -> ScanResult<()> {
        let Some(gate) = self.gating_device() else {
            return Ok(());
        };
        let prior = gate.mode().await?;
        self.prior_modes.push((gate.clone(), prior));
        gate.set_mode(CounterMode::Preset).await?;

        for sibling in &self.siblings {
            let prior = sibling.mode().await?;
            self.prior_modes.push((sibling.clone(), prior));
            sibling.set_mode(CounterMode::Counter).await?;
            debug!(
                device = %sibling.name(),
                gate = %gate.gate(),
                "Slaved gate sibling to counter mode"
            );
        }
        Ok(())
    }

    /// Put back every saved mode, newest first; the first failure is returned
    async fn restore_modes(&mut self) -> ScanResult<()> {
        let mut first_error = None;
        while let Some((device, mode)) = self.prior_modes.pop() {
            if let Err(e) = device.set_mode(mode).await {
                warn!(device = %device.name(), error = %e, "Failed to restore counter mode");
                first_error.get_or_insert(ScanError::from(e));
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// True while any device mode still needs restoring
    pub fn needs_deconfigure(&self) -> bool {
        self.configured || !self.prior_modes.is_empty()
    }

    /// Restore the modes saved by `configure`.
    ///
    /// Every device is restored even if one fails; the first failure is
    /// returned.
    pub async fn deconfigure(&mut self) -> ScanResult<()> {
        let mut first_error = self.restore_modes().await.err();

        if self.configured {
            if let MeasurementKind::Custom(driver) = &mut self.kind {
                if let Err(e) = driver.deconfigure().await {
                    first_error.get_or_insert(e);
                }
            }
        }
        self.configured = false;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Clear the inputs, gate once and wait for the gate to finish
    pub async fn acquire_data(
        &mut self,
        inputs: &[Arc<dyn InputDevice>],
        interrupt: &InterruptFlag,
    ) -> ScanResult<()> {
        let (device, preset) = match &mut self.kind {
            MeasurementKind::None => return Ok(()),
            MeasurementKind::PresetTime(preset) | MeasurementKind::PresetCount(preset) => {
                (preset.device.clone(), preset.preset)
            }
            MeasurementKind::KPowerLaw(schedule) => {
                (schedule.device.clone(), schedule.next_exposure())
            }
            MeasurementKind::Custom(driver) => {
                clear_inputs(inputs).await?;
                return driver.acquire_data(interrupt).await;
            }
        };

        clear_inputs(inputs).await?;
        device.start(preset).await?;

        let result = interrupt
            .poll_until(false, || {
                let device = device.clone();
                async move {
                    let busy = device.is_busy().await?;
                    Ok::<bool, ScanError>(!busy)
                }
            })
            .await;

        if let Err(e) = &result {
            if e.is_user_request() {
                debug!(device = %device.name(), reason = %e, "Stopping interrupted acquisition");
                if let Err(stop_err) = device.stop().await {
                    warn!(
                        device = %device.name(),
                        error = %stop_err,
                        "Failed to stop gating device"
                    );
                }
            }
        }
        result
    }
}

async fn clear_inputs(inputs: &[Arc<dyn InputDevice>]) -> ScanResult<()> {
    for input in inputs {
        input.clear().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockScaler, MockTimer};
    use tokio::time::Duration;

    fn gate_records() -> (Records, Arc<MockTimer>, Arc<MockScaler>) {
        let timer = Arc::new(MockTimer::on_gate("t1", "gate0"));
        let scaler = Arc::new(MockScaler::on_gate("s1", "gate0", 1000.0));
        let records = Records::new()
            .with_triggerable(timer.clone())
            .with_triggerable(scaler.clone())
            .with_input(timer.clone())
            .with_input(scaler.clone());
        (records, timer, scaler)
    }

    #[tokio::test]
    async fn configure_slaves_siblings_and_deconfigure_restores() {
        let (records, timer, scaler) = gate_records();
        scaler.set_mode(CounterMode::Preset).await.unwrap();

        let mut measurement =
            Measurement::parse("preset_time", "0.01 t1", &records, &DriverRegistry::new()).unwrap();
        measurement.configure().await.unwrap();
        assert_eq!(timer.mode().await.unwrap(), CounterMode::Preset);
        assert_eq!(scaler.mode().await.unwrap(), CounterMode::Counter);

        measurement.deconfigure().await.unwrap();
        assert_eq!(timer.mode().await.unwrap(), CounterMode::Counter);
        assert_eq!(scaler.mode().await.unwrap(), CounterMode::Preset);
        assert!(!measurement.is_configured());
    }

    #[tokio::test]
    async fn preset_time_gates_for_the_preset() {
        let (records, timer, scaler) = gate_records();
        let inputs: Vec<Arc<dyn InputDevice>> = vec![scaler.clone()];
        let mut measurement =
            Measurement::parse("preset_time", "0.02 t1", &records, &DriverRegistry::new()).unwrap();
        measurement.configure().await.unwrap();

        let started = tokio::time::Instant::now();
        measurement
            .acquire_data(&inputs, &InterruptFlag::new())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(timer.preset_history().await, vec![0.02]);
        assert_eq!(scaler.clear_count().await, 1);
        assert_eq!(measurement.measurement_time(), Some(0.02));
    }

    #[tokio::test]
    async fn abort_stops_the_gating_device() {
        let (records, timer, _) = gate_records();
        let mut measurement =
            Measurement::parse("preset_time", "30 t1", &records, &DriverRegistry::new()).unwrap();
        measurement.configure().await.unwrap();

        let interrupt = InterruptFlag::new();
        let remote = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.request_abort();
        });

        let result = measurement.acquire_data(&[], &interrupt).await;
        assert!(matches!(result, Err(ScanError::Interrupted)));
        assert_eq!(timer.stop_count().await, 1);
    }

    #[tokio::test]
    async fn pause_stops_the_gating_device_too() {
        let (records, timer, _) = gate_records();
        let mut measurement =
            Measurement::parse("preset_time", "30 t1", &records, &DriverRegistry::new()).unwrap();
        measurement.configure().await.unwrap();

        let interrupt = InterruptFlag::new();
        interrupt.request_pause();
        let result = measurement.acquire_data(&[], &interrupt).await;
        assert!(matches!(result, Err(ScanError::PauseRequested)));
        assert_eq!(timer.stop_count().await, 1);
    }

    #[tokio::test]
    async fn k_power_law_resets_at_configure() {
        let (records, timer, _) = gate_records();
        let mut measurement =
            Measurement::parse("k_power_law", "0.002 1 1 1 t1", &records, &DriverRegistry::new())
                .unwrap();
        measurement.configure().await.unwrap();
        for _ in 0..3 {
            measurement
                .acquire_data(&[], &InterruptFlag::new())
                .await
                .unwrap();
        }
        assert_eq!(measurement.measurement_time(), Some(0.006));

        measurement.deconfigure().await.unwrap();
        measurement.configure().await.unwrap();
        measurement
            .acquire_data(&[], &InterruptFlag::new())
            .await
            .unwrap();
        assert_eq!(timer.preset_history().await, vec![0.002, 0.004, 0.006, 0.002]);
    }

    #[tokio::test]
    async fn none_is_a_no_op() {
        let mut measurement =
            Measurement::parse("none", "", &Records::new(), &DriverRegistry::new()).unwrap();
        measurement.configure().await.unwrap();
        measurement
            .acquire_data(&[], &InterruptFlag::new())
            .await
            .unwrap();
        assert!(measurement.gating_device().is_none());
        assert_eq!(measurement.measurement_time(), None);
    }

    /// Triggerable on `gate0` that refuses every mode change
    struct Unswitchable;

    #[async_trait]
    impl Triggerable for Unswitchable {
        fn name(&self) -> &str {
            "stuck"
        }

        fn gate(&self) -> &str {
            "gate0"
        }

        async fn mode(&self) -> anyhow::Result<CounterMode> {
            Ok(CounterMode::Counter)
        }

        async fn set_mode(&self, _mode: CounterMode) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("wire fault"))
        }

        async fn start(&self, _preset: f64) -> anyhow::Result<()> {
            Ok(())
        }

        async fn is_busy(&self) -> anyhow::Result<bool> {
            Ok(false)
        }

        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_sibling_switch_restores_the_gate() {
        let timer = Arc::new(MockTimer::on_gate("t1", "gate0"));
        let records = Records::new()
            .with_triggerable(timer.clone())
            .with_triggerable(Arc::new(Unswitchable));

        let mut measurement =
            Measurement::parse("preset_time", "0.01 t1", &records, &DriverRegistry::new()).unwrap();
        let err = measurement.configure().await.unwrap_err();

        assert!(matches!(err, ScanError::DeviceIo(_)));
        assert_eq!(timer.mode().await.unwrap(), CounterMode::Counter);
        assert!(!measurement.is_configured());
        assert!(!measurement.needs_deconfigure());
    }

    #[test]
    fn unknown_type_is_not_found() {
        assert!(matches!(
            Measurement::parse("bogus", "", &Records::new(), &DriverRegistry::new()),
            Err(ScanError::NotFound(_))
        ));
    }
}
