use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::Payload;
use crate::work_item::WorkItemId;
use crate::worker::WorkerId;

/// Outcome of one execution attempt of a [`crate::WorkItem`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub item_id: WorkItemId,
    pub success: bool,
    pub data: Option<Payload>,
    pub error: Option<String>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn success(
        item_id: WorkItemId,
        worker_id: WorkerId,
        data: Payload,
        duration: Duration,
    ) -> Self {
        Self {
            item_id,
            success: true,
            data: Some(data),
            error: None,
            duration,
            worker_id,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        item_id: WorkItemId,
        worker_id: WorkerId,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            item_id,
            success: false,
            data: None,
            error: Some(error.into()),
            duration,
            worker_id,
            timestamp: Utc::now(),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
