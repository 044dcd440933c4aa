//! Permit and fault gating around each measurement.
//!
//! Permit handlers must all grant permission before an acquisition starts.
//! Fault handlers inspect the acquisition afterwards; if any reports a
//! fault, every fault handler is reset and the measurement is repeated.
//!
//! Handlers are created from `{ type, description }` entries through the
//! [`DriverRegistry`]. A factory may decline to create a handler, in which
//! case the entry is skipped.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::HandlerSpec;
use crate::error::{ScanError, ScanResult};
use crate::hardware::{DigitalOutput, InputDevice};
use crate::interrupt::{InterruptFlag, POLL_INTERVAL};
use crate::records::Records;
use crate::registry::DriverRegistry;

/// Gate that must be open before each acquisition
#[async_trait]
pub trait PermitHandler: Send + Sync {
    /// Registered type name
    fn type_name(&self) -> &str;

    /// Single non-blocking check
    async fn check_for_permission(&self) -> ScanResult<bool>;

    /// Block until permission is granted or an interrupt arrives
    async fn wait_for_permission(&self, interrupt: &InterruptFlag) -> ScanResult<()> {
        interrupt
            .poll_until(false, || self.check_for_permission())
            .await
    }
}

/// Point in the measurement cycle a fault reset happens at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStage {
    /// Before the first attempt of a measurement
    PrepareForFirstAttempt,
    /// After an attempt was rejected
    AfterFault,
}

/// Post-acquisition validity check
#[async_trait]
pub trait FaultHandler: Send + Sync {
    /// Registered type name
    fn type_name(&self) -> &str;

    /// True if the last acquisition must be discarded
    async fn check_for_fault(&self) -> ScanResult<bool>;

    /// Clear the fault condition
    async fn reset(&self, stage: ResetStage) -> ScanResult<()>;
}

// =============================================================================
// Built-in `simple` handlers
// =============================================================================

fn split_record_value<'a>(
    part: &'a str,
    description: &str,
) -> ScanResult<(&'a str, Option<i64>)> {
    let (name, value) = match part.split_once(',') {
        Some((name, value)) => (name.trim(), Some(value.trim())),
        None => (part.trim(), None),
    };
    if name.is_empty() {
        return Err(ScanError::UnparseableArguments(format!(
            "No record name found in handler description '{description}'."
        )));
    }
    let value = value
        .map(|text| {
            text.parse::<i64>().map_err(|_| {
                ScanError::UnparseableArguments(format!(
                    "Value '{text}' in handler description '{description}' is not an integer."
                ))
            })
        })
        .transpose()?;
    Ok((name, value))
}

/// Permits while a record reads a given value.
///
/// Description: `record[,permit_value]`, default permit value 1.
pub struct SimplePermit {
    record: Arc<dyn InputDevice>,
    permit_value: i64,
}

impl SimplePermit {
    /// Parse a description against the record database
    pub fn parse(description: &str, records: &Records) -> ScanResult<Self> {
        let (name, value) = split_record_value(description, description)?;
        Ok(Self {
            record: records.input(name)?,
            permit_value: value.unwrap_or(1),
        })
    }
}

#[async_trait]
impl PermitHandler for SimplePermit {
    fn type_name(&self) -> &str {
        "simple"
    }

    async fn check_for_permission(&self) -> ScanResult<bool> {
        let reading = self.record.read().await?;
        Ok(reading.round() as i64 == self.permit_value)
    }
}

/// Reports a fault while a record differs from its no-fault value.
///
/// Description: `fault_record[,no_fault_value];reset_record[,reset_value]`,
/// defaults 0 and 1.
pub struct SimpleFault {
    record: Arc<dyn InputDevice>,
    no_fault_value: i64,
    reset: Option<(Arc<dyn DigitalOutput>, u64)>,
}

impl SimpleFault {
    /// Parse a description against the record database
    pub fn parse(description: &str, records: &Records) -> ScanResult<Self> {
        let (fault_part, reset_part) = match description.split_once(';') {
            Some((fault, reset)) => (fault, Some(reset)),
            None => (description, None),
        };

        let (name, value) = split_record_value(fault_part, description)?;
        let reset = match reset_part.map(str::trim).filter(|part| !part.is_empty()) {
            Some(part) => {
                let (reset_name, reset_value) = split_record_value(part, description)?;
                let reset_value = u64::try_from(reset_value.unwrap_or(1)).map_err(|_| {
                    ScanError::UnparseableArguments(format!(
                        "Reset value in handler description '{description}' must not be negative."
                    ))
                })?;
                Some((records.output(reset_name)?, reset_value))
            }
            None => None,
        };

        Ok(Self {
            record: records.input(name)?,
            no_fault_value: value.unwrap_or(0),
            reset,
        })
    }
}

#[async_trait]
impl FaultHandler for SimpleFault {
    fn type_name(&self) -> &str {
        "simple"
    }

    async fn check_for_fault(&self) -> ScanResult<bool> {
        let reading = self.record.read().await?;
        Ok(reading.round() as i64 != self.no_fault_value)
    }

    async fn reset(&self, _stage: ResetStage) -> ScanResult<()> {
        if let Some((output, value)) = &self.reset {
            output.write(*value).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Controller
// =============================================================================

/// The permit and fault handler lists of one scan
#[derive(Default)]
pub struct PermitFaultController {
    permits: Vec<Box<dyn PermitHandler>>,
    faults: Vec<Box<dyn FaultHandler>>,
}

impl PermitFaultController {
    /// Controller with no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a permit handler
    pub fn with_permit(mut self, handler: Box<dyn PermitHandler>) -> Self {
        self.permits.push(handler);
        self
    }

    /// Add a fault handler
    pub fn with_fault(mut self, handler: Box<dyn FaultHandler>) -> Self {
        self.faults.push(handler);
        self
    }

    /// Build both lists.
    ///
    /// On any failure the handlers created so far are dropped and the error
    /// is returned.
    pub fn create(
        permit_specs: &[HandlerSpec],
        fault_specs: &[HandlerSpec],
        registry: &DriverRegistry,
        records: &Records,
    ) -> ScanResult<Self> {
        let mut controller = Self::new();

        for spec in permit_specs {
            match registry.create_permit(&spec.r#type, &spec.description, records) {
                Ok(Some(handler)) => controller.permits.push(handler),
                Ok(None) => debug!(handler = %spec.r#type, "Permit handler not needed"),
                Err(e) => {
                    warn!(
                        handler = %spec.r#type,
                        description = %spec.description,
                        error = %e,
                        "Permit handler creation failed"
                    );
                    controller.free();
                    return Err(e);
                }
            }
        }

        for spec in fault_specs {
            match registry.create_fault(&spec.r#type, &spec.description, records) {
                Ok(Some(handler)) => controller.faults.push(handler),
                Ok(None) => debug!(handler = %spec.r#type, "Fault handler not needed"),
                Err(e) => {
                    warn!(
                        handler = %spec.r#type,
                        description = %spec.description,
                        error = %e,
                        "Fault handler creation failed"
                    );
                    controller.free();
                    return Err(e);
                }
            }
        }

        Ok(controller)
    }

    /// Number of permit handlers
    pub fn num_permits(&self) -> usize {
        self.permits.len()
    }

    /// Number of fault handlers
    pub fn num_faults(&self) -> usize {
        self.faults.len()
    }

    /// Reset every fault handler
    pub async fn reset_all_faults(&self, stage: ResetStage) -> ScanResult<()> {
        for handler in &self.faults {
            handler.reset(stage).await?;
        }
        Ok(())
    }

    /// Wait on each permit handler in turn
    pub async fn wait_for_all_permits(&self, interrupt: &InterruptFlag) -> ScanResult<()> {
        for (index, handler) in self.permits.iter().enumerate() {
            if index > 0 {
                interrupt.sleep(POLL_INTERVAL).await?;
            }
            handler.wait_for_permission(interrupt).await?;
        }
        Ok(())
    }

    /// Check every fault handler, stopping at the first fault.
    ///
    /// When a fault is found all fault handlers are reset and `true` is
    /// returned.
    pub async fn check_for_all_faults(&self) -> ScanResult<bool> {
        for handler in &self.faults {
            if handler.check_for_fault().await? {
                debug!(handler = %handler.type_name(), "Fault reported");
                self.reset_all_faults(ResetStage::AfterFault).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drop every handler
    pub fn free(&mut self) {
        if !self.permits.is_empty() || !self.faults.is_empty() {
            debug!(
                permits = self.permits.len(),
                faults = self.faults.len(),
                "Freeing permit and fault handlers"
            );
        }
        self.permits.clear();
        self.faults.clear();
    }
}
