//! Periodic data records
//!
//! Each polling cycle produces one [`DataRecord`]: the waveform index plus
//! eight float slots `[frequency, Vhigh, Vlow, output, pulse.width, 0, 0, 0]`,
//! where the pulse width slot is only filled while the shape is `PULS`.
//! Records fan out over a `broadcast` channel; [`spawn_json_lines_writer`]
//! is one subscriber that appends them to a file.

use crate::driver::Shape;
use crate::error::{AppResult, DaqError};
use crate::schema::InstrumentSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Number of float slots in a record
pub const PARA_LEN: usize = 8;

/// Capacity of the record broadcast channel
pub const CHANNEL_CAPACITY: usize = 64;

/// One published data record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// Time the cycle completed
    pub timestamp: DateTime<Utc>,
    /// Equipment that produced the record
    pub equipment: String,
    /// Waveform index, or -1 when the instrument reported an unknown shape
    pub func: i32,
    /// `[frequency, Vhigh, Vlow, output, pulse.width or 0, 0, 0, 0]`
    pub para: [f32; PARA_LEN],
}

impl DataRecord {
    /// Build a record from one cycle's snapshot
    pub fn from_snapshot(equipment: &str, snapshot: &InstrumentSnapshot) -> Self {
        let shape = snapshot.shape.parse::<Shape>();
        let func = match shape {
            Ok(shape) => shape.index() as i32,
            Err(_) => {
                warn!(equipment, shape = %snapshot.shape, "unknown waveform shape in readout");
                -1
            }
        };
        let mut para = [0.0f32; PARA_LEN];
        para[0] = snapshot.frequency as f32;
        para[1] = snapshot.vhigh as f32;
        para[2] = snapshot.vlow as f32;
        para[3] = if snapshot.output { 1.0 } else { 0.0 };
        if matches!(shape, Ok(Shape::Pulse)) {
            para[4] = snapshot.pulse_width as f32;
        }
        Self {
            timestamp: Utc::now(),
            equipment: equipment.to_string(),
            func,
            para,
        }
    }
}

/// Sending half of the record stream
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<DataRecord>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(CHANNEL_CAPACITY)
    }
}

impl EventPublisher {
    /// Publisher with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// New receiver for records published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DataRecord> {
        self.tx.subscribe()
    }

    /// Publish a record; returns the number of receivers it reached
    pub fn publish(&self, record: DataRecord) -> usize {
        // no subscribers is not an error
        self.tx.send(record).unwrap_or(0)
    }
}

/// Append every record from `rx` to `path` as one JSON object per line
///
/// The task ends when the channel closes. Lagged receivers skip ahead and
/// log how many records were dropped.
pub fn spawn_json_lines_writer(
    mut rx: broadcast::Receiver<DataRecord>,
    path: PathBuf,
) -> JoinHandle<AppResult<()>> {
    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!(path = %path.display(), "data log opened");

        loop {
            match rx.recv().await {
                Ok(record) => {
                    let mut line = serde_json::to_vec(&record)?;
                    line.push(b'\n');
                    file.write_all(&line).await?;
                    file.flush().await?;
                    debug!(equipment = %record.equipment, func = record.func, "record logged");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "data log lagging, records dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        Ok::<(), DaqError>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse_snapshot() -> InstrumentSnapshot {
        InstrumentSnapshot {
            shape: "PULS".to_string(),
            output: true,
            frequency: 1000.0,
            vhigh: 5.0,
            vlow: 0.0,
            pulse_width: 0.002,
        }
    }

    #[test]
    fn test_record_layout() {
        let record = DataRecord::from_snapshot("SGEN-33250A-00", &pulse_snapshot());
        assert_eq!(record.func, 3);
        assert_eq!(record.para, [1000.0, 5.0, 0.0, 1.0, 0.002, 0.0, 0.0, 0.0]);
        assert_eq!(record.equipment, "SGEN-33250A-00");
    }

    #[test]
    fn test_unknown_shape_maps_to_minus_one() {
        let mut snapshot = pulse_snapshot();
        snapshot.shape = String::new();
        snapshot.output = false;
        let record = DataRecord::from_snapshot("SGEN-33250A-00", &snapshot);
        assert_eq!(record.func, -1);
        assert_eq!(record.para[3], 0.0);
        assert_eq!(record.para[4], 0.0);
    }

    #[test]
    fn test_pulse_width_only_for_pulse_shape() {
        let mut snapshot = pulse_snapshot();
        snapshot.shape = "SQU".to_string();
        let record = DataRecord::from_snapshot("x", &snapshot);
        assert_eq!(record.func, 1);
        assert_eq!(record.para, [1000.0, 5.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let publisher = EventPublisher::default();
        let record = DataRecord::from_snapshot("x", &pulse_snapshot());
        assert_eq!(publisher.publish(record), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_records() {
        let publisher = EventPublisher::new(4);
        let mut rx = publisher.subscribe();
        publisher.publish(DataRecord::from_snapshot("x", &pulse_snapshot()));

        let record = rx.recv().await.unwrap();
        assert_eq!(record.func, 3);
    }

    #[tokio::test]
    async fn test_json_lines_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("sgen.jsonl");

        let publisher = EventPublisher::new(4);
        let handle = spawn_json_lines_writer(publisher.subscribe(), path.clone());
        publisher.publish(DataRecord::from_snapshot("a", &pulse_snapshot()));
        publisher.publish(DataRecord::from_snapshot("b", &pulse_snapshot()));
        drop(publisher);

        handle.await.unwrap().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let records: Vec<DataRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].equipment, "b");
    }
}
