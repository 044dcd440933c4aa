//! Plain-text datafile.
//!
//! One line per measurement: the X columns at each motor's precision,
//! then every input reading, separated by single spaces. Each line is
//! flushed as soon as it is written.

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::ResolutionScope;
use crate::error::{ScanError, ScanResult};

/// Text datafile state
#[derive(Default)]
pub struct TextDatafile {
    writer: Option<BufWriter<File>>,
    lines: u64,
}

impl TextDatafile {
    /// Create a closed text datafile
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines written since the last open
    pub fn lines_written(&self) -> u64 {
        self.lines
    }

    /// Create (or truncate) `filename`
    pub async fn open(&mut self, filename: &str) -> ScanResult<()> {
        let file = File::create(filename).await?;
        self.writer = Some(BufWriter::new(file));
        self.lines = 0;
        debug!(filename = %filename, "Opened text datafile");
        Ok(())
    }

    /// Flush and close
    pub async fn close(&mut self) -> ScanResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.shutdown().await?;
        }
        Ok(())
    }

    /// Render the row for the current measurement
    pub fn format_row(scope: &ResolutionScope<'_>) -> String {
        let mut fields: Vec<String> = scope
            .x_columns()
            .into_iter()
            .map(|(motor, position)| format!("{:.*}", motor.precision(), position))
            .collect();
        fields.extend(scope.formatted_readings());
        fields.join(" ")
    }

    /// Write one row from the scope's live state
    pub async fn append_measurement(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        let line = Self::format_row(scope);
        self.write_line(&line).await
    }

    /// Write one row from caller-supplied buffers
    pub async fn append_array(&mut self, positions: &[f64], data: &[f64]) -> ScanResult<()> {
        let line = positions
            .iter()
            .chain(data.iter())
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        self.write_line(&line).await
    }

    async fn write_line(&mut self, line: &str) -> ScanResult<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            ScanError::CorruptState("Text datafile written before it was opened.".to_string())
        })?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        self.lines += 1;
        Ok(())
    }
}
