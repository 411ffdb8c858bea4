//! Checkpoint: a semantic marker event, stored as a `checkpoint`-type
//! Event (spec §3). `CheckpointInput` is what `POST /runs/{id}/checkpoints`
//! accepts before it is turned into an `EventInput`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInput {
    #[serde(rename = "type")]
    pub checkpoint_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CheckpointInput {
    pub fn validate(&self) -> Result<(), String> {
        if self.checkpoint_type.trim().is_empty() {
            return Err("invalid checkpoint type".to_string());
        }
        Ok(())
    }
}
