//! Datafile sinks.
//!
//! [`DataSink`] is a closed set of variants plus a `Custom` arm holding a
//! runtime-registered [`DatafileDriver`].
//!
//! A child datafile owns no output of its own. At open it resolves its
//! parent scan by name and from then on forwards every write to the
//! parent's sink, passing the child's own scope. A child of a child
//! forwards directly to the sink that actually owns the file.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::text::TextDatafile;
use super::{bump_version, ResolutionScope};
use crate::error::{ScanError, ScanResult};
use crate::records::Records;

/// Caller-supplied datafile backend
#[async_trait]
pub trait DatafileDriver: Send + Sync {
    /// Create the output named `filename`
    async fn open(&mut self, filename: &str, scope: &ResolutionScope<'_>) -> ScanResult<()>;

    /// Finish the output
    async fn close(&mut self) -> ScanResult<()>;

    /// Header written once per scan repeat
    async fn write_main_header(&mut self, _scope: &ResolutionScope<'_>) -> ScanResult<()> {
        Ok(())
    }

    /// Header written at the start of each child scan section
    async fn write_segment_header(&mut self, _scope: &ResolutionScope<'_>) -> ScanResult<()> {
        Ok(())
    }

    /// Trailer written after a successful scan body
    async fn write_trailer(&mut self, _scope: &ResolutionScope<'_>) -> ScanResult<()> {
        Ok(())
    }

    /// Append one measurement from live device state
    async fn append_measurement(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()>;

    /// Append one row from caller-supplied buffers
    async fn append_array(
        &mut self,
        scope: &ResolutionScope<'_>,
        positions: &[f64],
        data: &[f64],
    ) -> ScanResult<()>;
}

/// Datafile delegating to a parent scan's datafile
pub struct ChildDatafile {
    parent_name: String,
    target: Option<Arc<Mutex<DataSink>>>,
}

impl ChildDatafile {
    /// Child of the scan named `parent_name`
    pub fn new(parent_name: &str) -> Self {
        Self {
            parent_name: parent_name.to_string(),
            target: None,
        }
    }

    /// Name of the parent scan
    pub fn parent_name(&self) -> &str {
        &self.parent_name
    }

    fn target(&self) -> ScanResult<Arc<Mutex<DataSink>>> {
        self.target.clone().ok_or_else(|| {
            ScanError::CorruptState(format!(
                "Child datafile of '{}' used before it was opened.",
                self.parent_name
            ))
        })
    }
}

/// Datafile variants
pub enum DataSink {
    /// Discard everything
    None,
    /// Space-separated text, one line per measurement
    Text(TextDatafile),
    /// Forward to a parent scan's datafile
    Child(ChildDatafile),
    /// Runtime-registered backend
    Custom {
        /// Registered type name
        type_name: String,
        /// Backend instance
        driver: Box<dyn DatafileDriver>,
    },
}

impl DataSink {
    /// Type name as used in descriptions
    pub fn type_name(&self) -> &str {
        match self {
            DataSink::None => "none",
            DataSink::Text(_) => "text",
            DataSink::Child(_) => "child",
            DataSink::Custom { type_name, .. } => type_name,
        }
    }

    /// True for the child variant
    pub fn is_child(&self) -> bool {
        matches!(self, DataSink::Child(_))
    }

    /// Open the datafile for a new scan repeat
    pub async fn open(
        &mut self,
        filename: &str,
        scope: &ResolutionScope<'_>,
        records: &Records,
    ) -> ScanResult<()> {
        match self {
            DataSink::None => Ok(()),
            DataSink::Text(text) => text.open(filename).await,
            DataSink::Custom { driver, .. } => driver.open(filename, scope).await,
            DataSink::Child(child) => {
                let parent = records.find_parent_scan(&child.parent_name).await?;
                let target = {
                    let guard = parent.datafile.lock().await;
                    match &*guard {
                        DataSink::Child(grandparent) => grandparent.target()?,
                        _ => parent.datafile.clone(),
                    }
                };
                debug!(parent = %child.parent_name, "Child datafile attached to parent");
                child.target = Some(target);
                Ok(())
            }
        }
    }

    /// Close the datafile.
    ///
    /// For sinks that own an output file the next versioned filename is
    /// returned.
    pub async fn close(&mut self, filename: &str) -> ScanResult<Option<String>> {
        match self {
            DataSink::None => Ok(None),
            DataSink::Text(text) => {
                text.close().await?;
                bump_version(filename).map(Some)
            }
            DataSink::Custom { driver, .. } => {
                driver.close().await?;
                bump_version(filename).map(Some)
            }
            DataSink::Child(child) => {
                child.target = None;
                Ok(None)
            }
        }
    }

    /// Write the main header; a child writes a segment header into its parent
    pub async fn write_main_header(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        match self {
            DataSink::Child(child) => {
                let target = child.target()?;
                let mut parent = target.lock().await;
                parent.owned_segment_header(scope).await
            }
            DataSink::Custom { driver, .. } => driver.write_main_header(scope).await,
            _ => Ok(()),
        }
    }

    /// Write a segment header
    pub async fn write_segment_header(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        match self {
            DataSink::Child(child) => {
                let target = child.target()?;
                let mut parent = target.lock().await;
                parent.owned_segment_header(scope).await
            }
            owned => owned.owned_segment_header(scope).await,
        }
    }

    /// Write the trailer
    pub async fn write_trailer(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        match self {
            DataSink::Child(_) => Ok(()),
            DataSink::Custom { driver, .. } => driver.write_trailer(scope).await,
            _ => Ok(()),
        }
    }

    /// Append the current measurement
    pub async fn append_measurement(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        match self {
            DataSink::Child(child) => {
                let target = child.target()?;
                let mut parent = target.lock().await;
                parent.owned_append_measurement(scope).await
            }
            owned => owned.owned_append_measurement(scope).await,
        }
    }

    /// Append a row from caller-supplied buffers
    pub async fn append_array(
        &mut self,
        scope: &ResolutionScope<'_>,
        positions: &[f64],
        data: &[f64],
    ) -> ScanResult<()> {
        match self {
            DataSink::Child(child) => {
                let target = child.target()?;
                let mut parent = target.lock().await;
                parent.owned_append_array(scope, positions, data).await
            }
            owned => owned.owned_append_array(scope, positions, data).await,
        }
    }

    async fn owned_segment_header(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        match self {
            DataSink::Custom { driver, .. } => driver.write_segment_header(scope).await,
            DataSink::Child(_) => Err(chained_child()),
            _ => Ok(()),
        }
    }

    async fn owned_append_measurement(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        match self {
            DataSink::None => Ok(()),
            DataSink::Text(text) => text.append_measurement(scope).await,
            DataSink::Custom { driver, .. } => driver.append_measurement(scope).await,
            DataSink::Child(_) => Err(chained_child()),
        }
    }

    async fn owned_append_array(
        &mut self,
        scope: &ResolutionScope<'_>,
        positions: &[f64],
        data: &[f64],
    ) -> ScanResult<()> {
        match self {
            DataSink::None => Ok(()),
            DataSink::Text(text) => text.append_array(positions, data).await,
            DataSink::Custom { driver, .. } => driver.append_array(scope, positions, data).await,
            DataSink::Child(_) => Err(chained_child()),
        }
    }
}

fn chained_child() -> ScanError {
    ScanError::CorruptState("A child datafile resolved to another child datafile.".to_string())
}
