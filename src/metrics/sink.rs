use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, Stage, TrainError};

/// One scalar sample of a named time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub name: String,
    pub value: f64,
    pub step: usize,
}

/// Write-only destination for scalar time series keyed by
/// `(name, global_step)`.
pub trait MetricsSink: Send {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per line: `{"name":..,"value":..,"step":..}`.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Opens `<dir>/scalars.jsonl` for appending, creating `dir` if needed.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| TrainError::io(Stage::MetricsSink, dir, e))?;
        let path = dir.join("scalars.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TrainError::io(Stage::MetricsSink, &path, e))?;
        Ok(Self { path, writer: BufWriter::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        let event = ScalarEvent { name: name.to_string(), value, step };
        let line = serde_json::to_string(&event)
            .map_err(|e| TrainError::stage(Stage::MetricsSink, e.to_string()))?;
        writeln!(self.writer, "{line}").map_err(|e| TrainError::io(Stage::MetricsSink, &self.path, e))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| TrainError::io(Stage::MetricsSink, &self.path, e))
    }
}

/// Forwards events over a channel. Once the receiver is gone, events are
/// dropped silently.
pub struct ChannelSink {
    tx: mpsc::Sender<ScalarEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ScalarEvent>) -> Self {
        Self { tx }
    }
}

impl MetricsSink for ChannelSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        let _ = self.tx.send(ScalarEvent { name: name.to_string(), value, step });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<ScalarEvent>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values recorded under `name`, in emission order.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.events.iter()
            .filter(|e| e.name == name)
            .map(|e| (e.step, e.value))
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.events.push(ScalarEvent { name: name.to_string(), value, step });
        Ok(())
    }
}

/// Used on non-primary workers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn add_scalar(&mut self, _name: &str, _value: f64, _step: usize) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("run");
        {
            let mut sink = JsonlSink::create(&logs).unwrap();
            sink.add_scalar("train/loss", 0.5, 1).unwrap();
            sink.add_scalar("train/lr", 0.01, 1).unwrap();
            sink.flush().unwrap();
        }
        let mut sink = JsonlSink::create(&logs).unwrap();
        sink.add_scalar("train/loss", 0.25, 2).unwrap();
        sink.flush().unwrap();

        let text = fs::read_to_string(logs.join("scalars.jsonl")).unwrap();
        let events: Vec<ScalarEvent> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], ScalarEvent { name: "train/loss".into(), value: 0.25, step: 2 });
    }

    #[test]
    fn channel_sink_ignores_dropped_receiver() {
        let (tx, rx) = mpsc::channel();
        let mut sink = ChannelSink::new(tx);
        sink.add_scalar("test/accuracy", 0.9, 10).unwrap();
        assert_eq!(rx.recv().unwrap().step, 10);
        drop(rx);
        assert!(sink.add_scalar("test/accuracy", 0.9, 20).is_ok());
    }

    #[test]
    fn memory_sink_series() {
        let mut sink = MemorySink::new();
        sink.add_scalar("a", 1.0, 1).unwrap();
        sink.add_scalar("b", 2.0, 1).unwrap();
        sink.add_scalar("a", 3.0, 2).unwrap();
        assert_eq!(sink.series("a"), vec![(1, 1.0), (2, 3.0)]);
    }
}
