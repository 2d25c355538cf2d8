//! Control-channel message shapes exchanged with a worker child process.
//!
//! Messages are line-delimited JSON, one object per line, in each direction —
//! the same shape this stack uses for other child-process control channels.

use serde::{Deserialize, Serialize};
use swarmforge_core::{Payload, WorkItemId};

/// Parent → child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    Execute { id: WorkItemId, payload: Payload },
    Terminate,
    StatusRequest,
}

/// Child → parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildMessage {
    Ready,
    Result {
        id: WorkItemId,
        success: bool,
        result: Option<Payload>,
        error: Option<String>,
    },
    Status { stats: serde_json::Value },
    Context { blob: Payload },
    Log { line: String },
    Error { desc: String },
}
