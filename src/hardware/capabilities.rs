//! Hardware Capabilities Consumed by the Scan Engine
//!
//! The engine never talks to a specific instrument. It drives devices through
//! small capability traits, and the drivers behind them live outside this
//! crate:
//!
//! - A stage or goniometer axis implements `Motor`
//! - A timer or scaler that can gate a measurement implements `Triggerable`
//! - Anything whose value is recorded per measurement implements `InputDevice`
//! - A shutter implements `Relay`
//! - A register that clears an interlock implements `DigitalOutput`
//!
//! A scaler commonly implements both `Triggerable` and `InputDevice`.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn park<M: Motor + ?Sized>(motor: &M) -> Result<()> {
//!     motor.move_absolute(0.0).await?;
//!     while motor.is_busy().await? {
//!         tokio::time::sleep(Duration::from_millis(1)).await;
//!     }
//!     Ok(())
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

/// Capability: Motion Control
///
/// Devices that can be commanded to absolute positions.
///
/// # Contract
/// - Positions are in user units (see `units`)
/// - `move_absolute` starts the motion and returns without waiting for it
/// - `is_busy` reports whether the last commanded motion is still in progress
/// - `soft_abort` decelerates to a stop and must be safe to call while idle
///
/// # Thread Safety
/// - All methods are async and require `&self` (immutable reference)
/// - Interior mutability (Mutex/RwLock) should be used for state
#[async_trait]
pub trait Motor: Send + Sync {
    /// Record name of this motor
    fn name(&self) -> &str;

    /// Get current position
    async fn get_position(&self) -> Result<f64>;

    /// Start a move to an absolute position
    ///
    /// # Returns
    /// - Ok(()) once motion has been initiated
    /// - Err if the position is out of range or the controller refused it
    async fn move_absolute(&self, position: f64) -> Result<()>;

    /// True while the motor is in motion
    async fn is_busy(&self) -> Result<bool>;

    /// Decelerate to a stop
    async fn soft_abort(&self) -> Result<()>;

    /// Number of decimal places used when displaying positions
    fn precision(&self) -> usize {
        3
    }

    /// User units, used in plot labels
    fn units(&self) -> &str {
        ""
    }

    /// Current speed in user units per second
    async fn speed(&self) -> Result<f64>;

    /// Change the speed
    async fn set_speed(&self, speed: f64) -> Result<()>;

    /// Enable or disable cached-parameter ("fast") mode
    ///
    /// Drivers that always re-query the controller can ignore this.
    async fn set_fast_mode(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }
}

/// Counting mode of a triggerable timer or scaler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMode {
    /// Counts until the preset value is reached, then stops the shared gate
    Preset,
    /// Counts for as long as the shared gate is open
    Counter,
}

/// Capability: Gated Counting
///
/// Timers and scalers that can define the length of a measurement.
///
/// # Contract
/// - `start` arms the device with a preset in device units (seconds for
///   timers, counts for scalers) and returns immediately
/// - Devices reporting the same `gate` share one physical gate signal
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Record name of this device
    fn name(&self) -> &str;

    /// Identifier of the physical gate signal this device is wired to
    fn gate(&self) -> &str;

    /// Current counting mode
    async fn mode(&self) -> Result<CounterMode>;

    /// Change the counting mode
    async fn set_mode(&self, mode: CounterMode) -> Result<()>;

    /// Start counting towards `preset`
    async fn start(&self, preset: f64) -> Result<()>;

    /// True while counting
    async fn is_busy(&self) -> Result<bool>;

    /// Stop counting immediately
    async fn stop(&self) -> Result<()>;
}

/// Capability: Per-measurement readout
#[async_trait]
pub trait InputDevice: Send + Sync {
    /// Record name of this device
    fn name(&self) -> &str;

    /// Zero any accumulated value before a measurement
    async fn clear(&self) -> Result<()>;

    /// Read the current value
    async fn read(&self) -> Result<f64>;

    /// True for integer-valued counting devices (scalers)
    ///
    /// Only counting devices are normalized by measurement time.
    fn is_counter(&self) -> bool {
        false
    }

    /// Decimal places used when formatting analog values
    fn precision(&self) -> usize {
        3
    }

    /// Refresh the dark-current offset, called once per scan before the body
    async fn update_dark_current(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability: Two-state relay (shutters, valves)
#[async_trait]
pub trait Relay: Send + Sync {
    /// Record name of this relay
    fn name(&self) -> &str;

    /// Open (`true`) or close (`false`) the relay
    async fn set_open(&self, open: bool) -> Result<()>;
}

/// Capability: Digital output register
#[async_trait]
pub trait DigitalOutput: Send + Sync {
    /// Record name of this output
    fn name(&self) -> &str;

    /// Write a value to the output
    async fn write(&self, value: u64) -> Result<()>;
}
