//! Flat-file sink: JSON lines or classic CSV.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::cdr::ExternalRecord;
use crate::config::RecordFormat;

use super::{Backend, BackendError};

/// Appends one line per record to a file, creating it on first use.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    format: RecordFormat,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FileBackend {
    pub fn new(path: PathBuf, format: RecordFormat) -> Self {
        Self {
            path,
            format,
            writer: Mutex::new(None),
        }
    }

    fn render(&self, record: &ExternalRecord) -> Result<String, BackendError> {
        match self.format {
            RecordFormat::Jsonl => serde_json::to_string(record)
                .map_err(|e| BackendError::Serialization(e.to_string())),
            RecordFormat::Csv => Ok(record.to_csv_line()),
        }
    }

    fn open_if_needed(
        &self,
        writer: &mut Option<BufWriter<File>>,
    ) -> Result<(), BackendError> {
        if writer.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let fresh = file.metadata()?.len() == 0;
        let mut buf = BufWriter::new(file);

        if fresh && self.format == RecordFormat::Csv {
            writeln!(buf, "{}", ExternalRecord::csv_header())?;
        }

        info!(path = %self.path.display(), "opened CDR file");
        *writer = Some(buf);
        Ok(())
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn post(&self, record: &ExternalRecord) -> Result<(), BackendError> {
        let line = self.render(record)?;
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        self.open_if_needed(&mut writer)?;
        if let Some(buf) = writer.as_mut() {
            writeln!(buf, "{line}")?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), BackendError> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(buf) = writer.as_mut() {
            buf.flush()?;
        }
        Ok(())
    }
}
