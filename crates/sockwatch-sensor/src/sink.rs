//! Output sinks for decoded events

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use sockwatch_core::{Event, OutputFormat};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// JSON line shape: the event fields plus a receive timestamp
#[derive(Serialize)]
struct JsonRecord<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a Event,
}

/// Writes one line per event
pub struct EventSink {
    format: OutputFormat,
    writer: Box<dyn Write + Send>,
    written: u64,
}

impl EventSink {
    /// `path` is only used (and required) for [`OutputFormat::Jsonl`]
    pub fn open(format: OutputFormat, path: Option<&Path>) -> anyhow::Result<Self> {
        let writer: Box<dyn Write + Send> = match format {
            OutputFormat::Text | OutputFormat::Json => Box::new(std::io::stdout()),
            OutputFormat::Jsonl => {
                let path = path.context("jsonl output requires an output path")?;
                Box::new(BufWriter::new(open_append(path)?))
            }
        };
        Ok(Self::with_writer(format, writer))
    }

    pub fn with_writer(format: OutputFormat, writer: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            writer,
            written: 0,
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn write(&mut self, event: &Event) -> anyhow::Result<()> {
        let line = format_line(self.format, event)?;
        writeln!(self.writer, "{}", line).context("Failed to write event")?;
        self.written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush().context("Failed to flush output")
    }
}

fn open_append(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

/// Render one event for `format`
pub fn format_line(format: OutputFormat, event: &Event) -> anyhow::Result<String> {
    match format {
        OutputFormat::Text => Ok(format!(
            "{} {}",
            Local::now().format("%H:%M:%S%.3f"),
            event
        )),
        OutputFormat::Json | OutputFormat::Jsonl => {
            let record = JsonRecord {
                timestamp: Utc::now(),
                event,
            };
            serde_json::to_string(&record).context("Failed to serialize event")
        }
    }
}
