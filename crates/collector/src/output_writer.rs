use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{Context, Result};
use engine::{CollectError, MetricId, SampleSink};
use instrumentation::Timestamp;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Something the engine produced for the output
#[derive(Debug, Clone, PartialEq)]
pub enum OutputRecord {
    Sample {
        metric: MetricId,
        start: Timestamp,
        end: Timestamp,
        value: f64,
    },
    Trace {
        metric: MetricId,
        timestamp: Timestamp,
        len: usize,
    },
    Failed {
        metric: MetricId,
        error: String,
    },
}

/// Sink forwarding engine output to the writer task.
///
/// The engine never waits on the writer: records that do not fit the
/// channel are counted and dropped.
pub struct ChannelSink {
    sender: mpsc::Sender<OutputRecord>,
    dropped: usize,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<OutputRecord>) -> Self {
        Self { sender, dropped: 0 }
    }

    fn forward(&mut self, record: OutputRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped.is_power_of_two() {
                    log::warn!("output channel full, {} records dropped so far", self.dropped);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("output channel closed, record discarded");
            }
        }
    }
}

impl SampleSink for ChannelSink {
    fn on_sample(&mut self, metric: MetricId, start: Timestamp, end: Timestamp, value: f64) {
        self.forward(OutputRecord::Sample {
            metric,
            start,
            end,
            value,
        });
    }

    fn on_trace(&mut self, metric: MetricId, timestamp: Timestamp, payload: &[u8]) {
        self.forward(OutputRecord::Trace {
            metric,
            timestamp,
            len: payload.len(),
        });
    }

    fn on_collect_failed(&mut self, metric: MetricId, error: &CollectError) {
        self.forward(OutputRecord::Failed {
            metric,
            error: error.to_string(),
        });
    }
}

fn format_time() -> String {
    if let Ok(now) = OffsetDateTime::now_local() {
        let format = format_description!("[hour]:[minute]:[second].[subsecond digits:3]");
        now.format(&format)
            .unwrap_or_else(|_| "00:00:00.000".to_string())
    } else {
        "00:00:00.000".to_string()
    }
}

/// Formats records as text lines, one per record
pub struct OutputWriter<W: Write> {
    out: W,
    names: BTreeMap<MetricId, String>,
    written: u64,
}

impl<W: Write> OutputWriter<W> {
    /// `names` labels each metric in the output
    pub fn new(out: W, names: BTreeMap<MetricId, String>) -> Self {
        Self {
            out,
            names,
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn name(&self, metric: MetricId) -> String {
        self.names
            .get(&metric)
            .cloned()
            .unwrap_or_else(|| metric.to_string())
    }

    pub fn write(&mut self, record: &OutputRecord) -> Result<()> {
        let now = format_time();
        match record {
            OutputRecord::Sample {
                metric,
                start,
                end,
                value,
            } => writeln!(
                self.out,
                "{} SAMPLE metric={:<16} start={:<12} end={:<12} value={:.3}",
                now,
                self.name(*metric),
                start,
                end,
                value
            ),
            OutputRecord::Trace {
                metric,
                timestamp,
                len,
            } => writeln!(
                self.out,
                "{} TRACE metric={:<16} timestamp={:<12} bytes={}",
                now,
                self.name(*metric),
                timestamp,
                len
            ),
            OutputRecord::Failed { metric, error } => writeln!(
                self.out,
                "{} FAILED metric={:<16} error={}",
                now,
                self.name(*metric),
                error
            ),
        }
        .context("failed to write output record")?;
        self.written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().context("failed to flush output")
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Task draining the output channel into an [`OutputWriter`]
pub struct OutputWriterTask<W: Write> {
    receiver: mpsc::Receiver<OutputRecord>,
    writer: OutputWriter<W>,
    shutdown: CancellationToken,
}

impl<W: Write> OutputWriterTask<W> {
    pub fn new(writer: OutputWriter<W>, receiver: mpsc::Receiver<OutputRecord>, shutdown: CancellationToken) -> Self {
        Self {
            receiver,
            writer,
            shutdown,
        }
    }

    /// Writes records until every sender is gone or shutdown is requested.
    /// Returns the number of records written.
    pub async fn run(mut self) -> Result<u64> {
        loop {
            tokio::select! {
                record = self.receiver.recv() => match record {
                    Some(record) => self.writer.write(&record)?,
                    None => break,
                },
                _ = self.shutdown.cancelled() => {
                    // Keep whatever is already queued
                    while let Ok(record) = self.receiver.try_recv() {
                        self.writer.write(&record)?;
                    }
                    break;
                }
            }
        }

        self.writer.flush()?;
        log::info!("output writer finished after {} records", self.writer.written());
        Ok(self.writer.written())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> BTreeMap<MetricId, String> {
        let mut names = BTreeMap::new();
        names.insert(MetricId(1), "cpu_time".to_string());
        names
    }

    fn sample(metric: u32, value: f64) -> OutputRecord {
        OutputRecord::Sample {
            metric: MetricId(metric),
            start: 1_000,
            end: 2_000,
            value,
        }
    }

    #[test]
    fn test_write_lines() {
        let mut writer = OutputWriter::new(Vec::new(), names());
        writer.write(&sample(1, 1.5)).unwrap();
        writer.write(&sample(7, 2.0)).unwrap();
        writer
            .write(&OutputRecord::Failed {
                metric: MetricId(1),
                error: "boom".to_string(),
            })
            .unwrap();
        assert_eq!(writer.written(), 3);

        let text = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("SAMPLE metric=cpu_time"));
        assert!(lines[0].contains("value=1.500"));
        assert!(lines[1].contains("metric=metric#7"));
        assert!(lines[2].contains("FAILED metric=cpu_time"));
        assert!(lines[2].ends_with("error=boom"));
    }

    #[test]
    fn test_full_channel_drops_records() {
        let (sender, mut receiver) = mpsc::channel(1);
        let mut sink = ChannelSink::new(sender);
        sink.on_sample(MetricId(1), 0, 10, 1.0);
        sink.on_sample(MetricId(1), 10, 20, 2.0);
        assert_eq!(sink.dropped, 1);
        assert_eq!(receiver.try_recv().unwrap(), sample_at(0, 10, 1.0));
        assert!(receiver.try_recv().is_err());
    }

    fn sample_at(start: Timestamp, end: Timestamp, value: f64) -> OutputRecord {
        OutputRecord::Sample {
            metric: MetricId(1),
            start,
            end,
            value,
        }
    }

    #[tokio::test]
    async fn test_task_drains_until_senders_close() {
        let (sender, receiver) = mpsc::channel(8);
        let task = OutputWriterTask::new(
            OutputWriter::new(Vec::new(), names()),
            receiver,
            CancellationToken::new(),
        );
        let handle = tokio::spawn(task.run());

        let mut sink = ChannelSink::new(sender);
        sink.on_sample(MetricId(1), 0, 10, 1.0);
        sink.on_trace(MetricId(1), 5, b"abc");
        drop(sink);

        assert_eq!(handle.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_task_stops_on_shutdown() {
        let (sender, receiver) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let task = OutputWriterTask::new(OutputWriter::new(Vec::new(), names()), receiver, shutdown.clone());

        sender.send(sample(1, 1.0)).await.unwrap();
        shutdown.cancel();
        assert_eq!(task.run().await.unwrap(), 1);
        drop(sender);
    }
}
