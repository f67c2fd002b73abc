use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const EVENTS_FILE: &str = "events.jsonl";

/// One scalar measurement, keyed by tag and global step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub value: f64,
    pub step: u64,
}

/// Append-only destination for scalar events.
pub trait MetricsSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64);

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes one JSON object per line to `<dir>/events.jsonl`.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(dir: &Path) -> Result<JsonlSink> {
        fs::create_dir_all(dir)?;
        let path = dir.join(EVENTS_FILE);
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(JsonlSink { path, writer: BufWriter::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) {
        let event = ScalarEvent { tag: tag.to_string(), value, step };
        let written = serde_json::to_string(&event)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(self.writer, "{line}"));
        if let Err(e) = written {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write metric event");
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to flush metric events");
        }
    }
}

/// Keeps events in memory. Clones share the same event list.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ScalarEvent>>>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    pub fn events(&self) -> Vec<ScalarEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Values recorded under `tag`, in insertion order.
    pub fn values(&self, tag: &str) -> Vec<f64> {
        self.events().into_iter().filter(|e| e.tag == tag).map(|e| e.value).collect()
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) {
        let event = ScalarEvent { tag: tag.to_string(), value, step };
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn add_scalar(&mut self, _tag: &str, _value: f64, _step: u64) {}
}

/// Separate event streams for training and validation.
pub struct MetricsChannels {
    pub train: Box<dyn MetricsSink>,
    pub val: Box<dyn MetricsSink>,
}

impl MetricsChannels {
    pub fn null() -> MetricsChannels {
        MetricsChannels { train: Box::new(NullSink), val: Box::new(NullSink) }
    }

    /// JSONL channels under `<work_dir>/trainlogs`.
    ///
    /// In debug mode training events go to `trainlogs/debug` and validation
    /// events are dropped.
    pub fn open(work_dir: &Path, debug: bool) -> Result<MetricsChannels> {
        let root = log_dir(work_dir);
        if debug {
            return Ok(MetricsChannels {
                train: Box::new(JsonlSink::create(&root.join("debug"))?),
                val: Box::new(NullSink),
            });
        }
        Ok(MetricsChannels {
            train: Box::new(JsonlSink::create(&root.join("train"))?),
            val: Box::new(JsonlSink::create(&root.join("val"))?),
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        self.train.flush()?;
        self.val.flush()
    }
}

/// Root of the event logs for a work directory.
pub fn log_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("trainlogs")
}
