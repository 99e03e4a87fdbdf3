use anyhow::{Context, Result};
use async_trait::async_trait;
use bt1bridge_lib::dispatcher::{Sink, SinkResult};
use bt1bridge_lib::telemetry::{Field, TelemetryRecord};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const TIMESTAMP_COLUMN: &str = "createAt";

/// Appends one row per record to a CSV file.
pub struct CsvLogSink {
    path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
}

impl CsvLogSink {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Cannot open CSV log {path:?}"))?;
        let is_empty = file
            .metadata()
            .with_context(|| format!("Cannot stat CSV log {path:?}"))?
            .len()
            == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_empty {
            writer
                .write_record(header())
                .with_context(|| format!("Cannot write CSV header to {path:?}"))?;
            writer
                .flush()
                .with_context(|| format!("Cannot flush CSV log {path:?}"))?;
        }
        log::info!("Logging records to {path:?}");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
        })
    }

    fn append(&self, record: &TelemetryRecord) -> Result<()> {
        let row = row(record, chrono::Utc::now())?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("CSV writer lock poisoned"))?;
        writer
            .write_record(&row)
            .with_context(|| format!("Cannot append to CSV log {:?}", self.path))?;
        writer
            .flush()
            .with_context(|| format!("Cannot flush CSV log {:?}", self.path))
    }
}

fn header() -> Vec<&'static str> {
    Field::ALL
        .iter()
        .map(|field| field.name())
        .chain(std::iter::once(TIMESTAMP_COLUMN))
        .collect()
}

fn row(record: &TelemetryRecord, created_at: chrono::DateTime<chrono::Utc>) -> Result<Vec<String>> {
    let value = serde_json::to_value(record)?;
    let mut row: Vec<String> = Field::ALL
        .iter()
        .map(|field| match &value[field.name()] {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect();
    row.push(created_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
    Ok(row)
}

#[async_trait]
impl Sink for CsvLogSink {
    fn name(&self) -> &str {
        "csv"
    }

    async fn on_read_result(&self, record: &TelemetryRecord) -> SinkResult {
        self.append(record).map_err(Into::into)
    }
}
