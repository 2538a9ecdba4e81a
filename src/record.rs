//! Records read from a partitioned stream

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A single immutable entry in a partition.
///
/// Offsets are strictly increasing within a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    partition_id: String,
    offset: u64,
    payload: Bytes,
    arrival_timestamp: DateTime<Utc>,
}

impl Record {
    pub fn new(
        partition_id: impl Into<String>,
        offset: u64,
        payload: impl Into<Bytes>,
        arrival_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            offset,
            payload: payload.into(),
            arrival_timestamp,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn arrival_timestamp(&self) -> DateTime<Utc> {
        self.arrival_timestamp
    }

    /// Payload decoded as UTF-8
    pub fn payload_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}
