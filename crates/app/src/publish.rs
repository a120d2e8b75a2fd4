//! JSON-lines detection sink.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::PathBuf,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ml_core::Detection;
use serde::Serialize;
use tracing::{debug, info};
use vision::Publisher;

/// Log a publish heartbeat every this many messages.
const LOG_EVERY: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTarget {
    Stdout,
    File(PathBuf),
}

/// One line of output. An empty `detections` list with `clear` set tells the
/// consumer to drop whatever it last received.
#[derive(Debug, Serialize)]
pub struct DetectionsMessage<'a> {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub clear: bool,
    pub detections: &'a [Detection],
}

pub struct JsonLinesPublisher {
    target: PublishTarget,
    writer: Mutex<Box<dyn Write + Send>>,
    sequence: AtomicU64,
    publish_count: AtomicU64,
    error_count: AtomicU64,
    last_ok: AtomicBool,
}

impl JsonLinesPublisher {
    pub fn open(target: PublishTarget) -> Result<Self> {
        let writer = open_writer(&target)?;
        info!(output = ?target, "detection publisher ready");
        Ok(Self::with_writer(target, writer))
    }

    fn with_writer(target: PublishTarget, writer: Box<dyn Write + Send>) -> Self {
        Self {
            target,
            writer: Mutex::new(writer),
            sequence: AtomicU64::new(0),
            publish_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_ok: AtomicBool::new(true),
        }
    }

    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Healthy while the most recent write went through.
    pub fn is_healthy(&self) -> bool {
        self.last_ok.load(Ordering::SeqCst)
    }

    /// Reopen the output, used as the supervisor's recovery action.
    pub fn reopen(&self) -> Result<bool> {
        let writer = open_writer(&self.target)?;
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = writer;
        self.last_ok.store(true, Ordering::SeqCst);
        info!(output = ?self.target, "detection publisher reopened");
        Ok(true)
    }

    fn write_message(&self, message: &DetectionsMessage<'_>) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, message).context("failed to encode detections")?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl Publisher for JsonLinesPublisher {
    fn publish(&self, detections: &[Detection]) -> Result<()> {
        let message = DetectionsMessage {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            clear: detections.is_empty(),
            detections,
        };

        match self.write_message(&message) {
            Ok(()) => {
                self.last_ok.store(true, Ordering::SeqCst);
                let count = self.publish_count.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("publisher_messages_total").increment(1);
                if count % LOG_EVERY == 0 {
                    debug!(
                        detections = detections.len(),
                        total = count,
                        "published detections"
                    );
                }
                Ok(())
            }
            Err(err) => {
                self.last_ok.store(false, Ordering::SeqCst);
                self.error_count.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("publisher_errors_total").increment(1);
                Err(err)
            }
        }
    }
}

fn open_writer(target: &PublishTarget) -> Result<Box<dyn Write + Send>> {
    Ok(match target {
        PublishTarget::Stdout => Box::new(io::stdout()),
        PublishTarget::File(path) => {
            let file: File = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            Box::new(BufWriter::new(file))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ml_core::{Point3, Rect};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "consumer gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn lines(buffer: &SharedBuffer) -> Vec<serde_json::Value> {
        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn writes_one_line_per_publish() {
        let buffer = SharedBuffer::default();
        let publisher = JsonLinesPublisher::with_writer(PublishTarget::Stdout, Box::new(buffer.clone()));

        let detection = Detection::new(Rect::new(1, 2, 30, 40), 3, 0.75)
            .with_position(Point3 { x: 0.1, y: -0.2, z: 1.5 }, 1500.0);
        publisher.publish(&[detection]).unwrap();
        publisher.publish(&[]).unwrap();

        let messages = lines(&buffer);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["sequence"], 0);
        assert_eq!(messages[0]["clear"], false);
        assert_eq!(messages[0]["detections"][0]["class_id"], 3);
        assert_eq!(messages[0]["detections"][0]["rect"]["right"], 30);
        assert_eq!(messages[1]["sequence"], 1);
        assert_eq!(messages[1]["clear"], true);
        assert_eq!(publisher.publish_count(), 2);
        assert!(publisher.is_healthy());
    }

    #[test]
    fn write_failures_are_counted_and_reported() {
        let publisher = JsonLinesPublisher::with_writer(PublishTarget::Stdout, Box::new(BrokenPipe));
        assert!(publisher.publish(&[]).is_err());
        assert_eq!(publisher.error_count(), 1);
        assert!(!publisher.is_healthy());

        assert!(publisher.reopen().unwrap());
        assert!(publisher.is_healthy());
    }
}
