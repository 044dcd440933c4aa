//! Plot sinks.
//!
//! Mirrors [`DataSink`](super::DataSink): a closed enum with a `Custom`
//! arm. A child plot forwards to the parent scan's plot, except that it
//! never starts a new section when the parent plot is continuous.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::gnuplot::GnuplotPlot;
use super::ResolutionScope;
use crate::error::{ScanError, ScanResult};
use crate::records::Records;

/// Caller-supplied plot backend
#[async_trait]
pub trait PlotDriver: Send + Sync {
    /// Prepare the plot for a scan repeat
    async fn open(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()>;

    /// Tear the plot down
    async fn close(&mut self) -> ScanResult<()>;

    /// Begin a new section
    async fn start_section(&mut self, _scope: &ResolutionScope<'_>) -> ScanResult<()> {
        Ok(())
    }

    /// Add the current measurement
    async fn add_measurement(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()>;

    /// Add a row from caller-supplied buffers
    async fn add_array(
        &mut self,
        _scope: &ResolutionScope<'_>,
        _positions: &[f64],
        _data: &[f64],
    ) -> ScanResult<()> {
        Ok(())
    }

    /// Redraw
    async fn display(&mut self) -> ScanResult<()> {
        Ok(())
    }

    /// Fix the X range
    async fn set_x_range(&mut self, _min: f64, _max: f64) -> ScanResult<()> {
        Ok(())
    }

    /// Fix the Y range
    async fn set_y_range(&mut self, _min: f64, _max: f64) -> ScanResult<()> {
        Ok(())
    }

    /// Whether child scans share one section
    fn is_continuous(&self) -> bool {
        false
    }
}

/// Plot delegating to a parent scan's plot
pub struct ChildPlot {
    parent_name: String,
    target: Option<Arc<Mutex<PlotSink>>>,
    parent_continuous: bool,
}

impl ChildPlot {
    /// Child of the scan named `parent_name`
    pub fn new(parent_name: &str) -> Self {
        Self {
            parent_name: parent_name.to_string(),
            target: None,
            parent_continuous: false,
        }
    }

    /// Name of the parent scan
    pub fn parent_name(&self) -> &str {
        &self.parent_name
    }

    fn target(&self) -> ScanResult<Arc<Mutex<PlotSink>>> {
        self.target.clone().ok_or_else(|| {
            ScanError::CorruptState(format!(
                "Child plot of '{}' used before it was opened.",
                self.parent_name
            ))
        })
    }
}

/// Plot variants
pub enum PlotSink {
    /// No plotting
    None,
    /// Forward to a parent scan's plot
    Child(ChildPlot),
    /// External gnuplot helper
    Gnuplot(GnuplotPlot),
    /// Runtime-registered backend
    Custom {
        /// Registered type name
        type_name: String,
        /// Backend instance
        driver: Box<dyn PlotDriver>,
        /// Set by the `continuous_plot` option
        continuous: bool,
    },
}

impl PlotSink {
    /// Type name as used in descriptions
    pub fn type_name(&self) -> &str {
        match self {
            PlotSink::None => "none",
            PlotSink::Child(_) => "child",
            PlotSink::Gnuplot(_) => "gnuplot",
            PlotSink::Custom { type_name, .. } => type_name,
        }
    }

    /// Whether the plot keeps child scans in one section
    pub fn is_continuous(&self) -> bool {
        match self {
            PlotSink::None => false,
            PlotSink::Child(child) => child.parent_continuous,
            PlotSink::Gnuplot(gnuplot) => gnuplot.is_continuous(),
            PlotSink::Custom {
                driver, continuous, ..
            } => *continuous || driver.is_continuous(),
        }
    }

    /// Open the plot for a new scan repeat
    pub async fn open(&mut self, scope: &ResolutionScope<'_>, records: &Records) -> ScanResult<()> {
        match self {
            PlotSink::None => Ok(()),
            PlotSink::Gnuplot(gnuplot) => gnuplot.open(scope).await,
            PlotSink::Custom { driver, .. } => driver.open(scope).await,
            PlotSink::Child(child) => {
                let parent = records.find_parent_scan(&child.parent_name).await?;
                let (target, continuous) = {
                    let guard = parent.plot.lock().await;
                    match &*guard {
                        PlotSink::Child(grandparent) => {
                            (grandparent.target()?, grandparent.parent_continuous)
                        }
                        other => (parent.plot.clone(), other.is_continuous()),
                    }
                };
                debug!(parent = %child.parent_name, continuous, "Child plot attached to parent");
                child.target = Some(target);
                child.parent_continuous = continuous;
                Ok(())
            }
        }
    }

    /// Close the plot
    pub async fn close(&mut self) -> ScanResult<()> {
        match self {
            PlotSink::None => Ok(()),
            PlotSink::Gnuplot(gnuplot) => gnuplot.close().await,
            PlotSink::Custom { driver, .. } => driver.close().await,
            PlotSink::Child(child) => {
                child.target = None;
                Ok(())
            }
        }
    }

    /// Begin a new section; skipped by a child of a continuous plot
    pub async fn start_section(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        match self {
            PlotSink::Child(child) => {
                if child.parent_continuous {
                    return Ok(());
                }
                let target = child.target()?;
                let mut parent = target.lock().await;
                parent.owned_start_section(scope).await
            }
            owned => owned.owned_start_section(scope).await,
        }
    }

    /// Add the current measurement
    pub async fn add_measurement(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        match self {
            PlotSink::Child(child) => {
                let target = child.target()?;
                let mut parent = target.lock().await;
                parent.owned_add_measurement(scope).await
            }
            owned => owned.owned_add_measurement(scope).await,
        }
    }

    /// Add a row from caller-supplied buffers
    pub async fn add_array(
        &mut self,
        scope: &ResolutionScope<'_>,
        positions: &[f64],
        data: &[f64],
    ) -> ScanResult<()> {
        match self {
            PlotSink::Child(child) => {
                let target = child.target()?;
                let mut parent = target.lock().await;
                parent.owned_add_array(scope, positions, data).await
            }
            owned => owned.owned_add_array(scope, positions, data).await,
        }
    }

    /// Redraw
    pub async fn display(&mut self) -> ScanResult<()> {
        match self {
            PlotSink::Child(child) => {
                let target = child.target()?;
                let mut parent = target.lock().await;
                parent.owned_display().await
            }
            owned => owned.owned_display().await,
        }
    }

    /// Fix the X range
    pub async fn set_x_range(&mut self, min: f64, max: f64) -> ScanResult<()> {
        match self {
            PlotSink::None | PlotSink::Child(_) => Ok(()),
            PlotSink::Gnuplot(gnuplot) => gnuplot.set_x_range(min, max).await,
            PlotSink::Custom { driver, .. } => driver.set_x_range(min, max).await,
        }
    }

    /// Fix the Y range
    pub async fn set_y_range(&mut self, min: f64, max: f64) -> ScanResult<()> {
        match self {
            PlotSink::None | PlotSink::Child(_) => Ok(()),
            PlotSink::Gnuplot(gnuplot) => gnuplot.set_y_range(min, max).await,
            PlotSink::Custom { driver, .. } => driver.set_y_range(min, max).await,
        }
    }

    async fn owned_start_section(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        match self {
            PlotSink::None => Ok(()),
            PlotSink::Gnuplot(gnuplot) => gnuplot.start_section(scope).await,
            PlotSink::Custom { driver, .. } => driver.start_section(scope).await,
            PlotSink::Child(_) => Err(chained_child()),
        }
    }

    async fn owned_add_measurement(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        match self {
            PlotSink::None => Ok(()),
            PlotSink::Gnuplot(gnuplot) => gnuplot.add_measurement(scope).await,
            PlotSink::Custom { driver, .. } => driver.add_measurement(scope).await,
            PlotSink::Child(_) => Err(chained_child()),
        }
    }

    async fn owned_add_array(
        &mut self,
        scope: &ResolutionScope<'_>,
        positions: &[f64],
        data: &[f64],
    ) -> ScanResult<()> {
        match self {
            PlotSink::None => Ok(()),
            PlotSink::Gnuplot(gnuplot) => gnuplot.add_array(scope, positions, data).await,
            PlotSink::Custom { driver, .. } => driver.add_array(scope, positions, data).await,
            PlotSink::Child(_) => Err(chained_child()),
        }
    }

    async fn owned_display(&mut self) -> ScanResult<()> {
        match self {
            PlotSink::None => Ok(()),
            PlotSink::Gnuplot(gnuplot) => gnuplot.display().await,
            PlotSink::Custom { driver, .. } => driver.display().await,
            PlotSink::Child(_) => Err(chained_child()),
        }
    }
}

fn chained_child() -> ScanError {
    ScanError::CorruptState("A child plot resolved to another child plot.".to_string())
}
