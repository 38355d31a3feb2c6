//! Classification metrics, training history and scalar metric sinks.
use crate::error::Result;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

/// Accuracy of probabilities against 0/1 labels at threshold 0.5
pub fn binary_accuracy(probs: &[f64], labels: &[f64]) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    let correct = probs
        .iter()
        .zip(labels)
        .filter(|(&p, &y)| (p >= 0.5) == (y >= 0.5))
        .count();
    correct as f64 / probs.len() as f64
}

/// `[[tn, fp], [fn, tp]]`
pub fn confusion_matrix(probs: &[f64], labels: &[f64]) -> [[usize; 2]; 2] {
    let mut cm = [[0; 2]; 2];
    for (&p, &y) in probs.iter().zip(labels) {
        cm[(y >= 0.5) as usize][(p >= 0.5) as usize] += 1;
    }
    cm
}

/// Per-epoch summary of classifier training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
}

/// One sample of the adversarial value functions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub step: usize,
    pub d_value: f64,
    pub g_value: f64,
}

/// Append-only record of V(D) and V(G) over training.
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    points: Vec<HistoryPoint>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: usize, d_value: f64, g_value: f64) {
        self.points.push(HistoryPoint { step, d_value, g_value });
    }

    pub fn points(&self) -> &[HistoryPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Write `step,d_value,g_value` rows.
    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for point in &self.points {
            writer.serialize(point)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Destination for step-indexed scalar metrics.
pub trait MetricSink {
    fn scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Emits each scalar as a tracing event.
#[derive(Debug, Default)]
pub struct LogSink;

impl MetricSink for LogSink {
    fn scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        info!(target: "netlearner::metrics", metric = name, value, step);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ScalarRow<'a> {
    name: &'a str,
    value: f64,
    step: usize,
}

/// Appends `name,value,step` rows to a CSV file.
pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new().has_headers(!exists).from_writer(file);
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricSink for CsvSink {
    fn scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.writer.serialize(ScalarRow { name, value, step })?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Forwards every scalar to each inner sink.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn MetricSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricSink for FanoutSink {
    fn scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        for sink in &mut self.sinks {
            sink.scalar(name, value, step)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

/// Keeps scalars in memory; handy for inspecting a run programmatically.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub scalars: Vec<(String, f64, usize)>,
}

impl MetricSink for MemorySink {
    fn scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.scalars.push((name.to_string(), value, step));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_accuracy_and_confusion() {
        let probs = [0.9, 0.2, 0.6, 0.4];
        let labels = [1.0, 0.0, 0.0, 1.0];
        assert!((binary_accuracy(&probs, &labels) - 0.5).abs() < 1e-12);
        assert_eq!(confusion_matrix(&probs, &labels), [[1, 1], [1, 1]]);
    }

    #[test]
    fn test_history_is_append_only_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = TrainingHistory::new();
        history.record(0, -1.3, -0.7);
        history.record(10, -1.1, -0.8);
        assert_eq!(history.len(), 2);
        assert_eq!(history.points()[1].step, 10);
        let path = dir.path().join("history.csv");
        history.save_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("step,d_value,g_value"));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_csv_sink_writes_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        {
            let mut sink = CsvSink::create(&path).unwrap();
            sink.scalar("DV", -1.2, 0).unwrap();
            sink.scalar("GV", -0.6, 0).unwrap();
            sink.flush().unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "name,value,step");
        assert_eq!(lines[1], "DV,-1.2,0");
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let mut fan = FanoutSink::new(vec![Box::new(LogSink), Box::new(MemorySink::default())]);
        fan.scalar("DV", 1.0, 3).unwrap();
        fan.flush().unwrap();
    }
}
