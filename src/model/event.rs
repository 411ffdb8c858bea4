//! The Event is the atom of observable run progress: totally ordered per
//! run by an assigned, run-scoped, dense, monotonically increasing id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type discriminant. Control-flow events never carry agent
/// side-effects; they only narrate scheduler decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Hello,
    Status,
    Log,
    Checkpoint,
    NodeStatus,
    RunStatus,
    Progress,
    StreamStart,
    StreamData,
    StreamEnd,
    Error,
    ConditionEvaluated,
    BranchSelected,
    BranchSkipped,
    LoopStarted,
    LoopIteration,
    LoopComplete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Hello => "hello",
            EventType::Status => "status",
            EventType::Log => "log",
            EventType::Checkpoint => "checkpoint",
            EventType::NodeStatus => "node_status",
            EventType::RunStatus => "run_status",
            EventType::Progress => "progress",
            EventType::StreamStart => "stream_start",
            EventType::StreamData => "stream_data",
            EventType::StreamEnd => "stream_end",
            EventType::Error => "error",
            EventType::ConditionEvaluated => "condition_evaluated",
            EventType::BranchSelected => "branch_selected",
            EventType::BranchSkipped => "branch_skipped",
            EventType::LoopStarted => "loop_started",
            EventType::LoopIteration => "loop_iteration",
            EventType::LoopComplete => "loop_complete",
        }
    }
}

/// (De)serialize `Event.id` as a JSON string, not a number: spec §3
/// requires the wire id to be "rendered as string" in the canonical Event
/// JSON, not just in the out-of-band SSE `id:` line.
mod id_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A stored, append-only event. `id` is rendered as a string on the wire
/// (per spec) even though it is assigned as a dense run-scoped integer
/// internally — SSE `Last-Event-ID` and `id:` frames are text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "id_as_string")]
    pub id: u64,
    pub run_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    /// Render the wire-format `id` field as required by the SSE contract
    /// (the `id:` line and `Last-Event-ID` header are both textual).
    pub fn id_str(&self) -> String {
        self.id.to_string()
    }
}

/// Input to `RunStore::append_event` — everything except the assigned id
/// and timestamp, which the store fills in atomically with the sequence
/// advance.
#[derive(Debug, Clone)]
pub struct EventInput {
    pub event_type: EventType,
    pub node_id: Option<String>,
    pub data: serde_json::Value,
}

impl EventInput {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            node_id: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names_match_spec() {
        assert_eq!(EventType::NodeStatus.as_str(), "node_status");
        assert_eq!(EventType::ConditionEvaluated.as_str(), "condition_evaluated");
    }

    #[test]
    fn event_serializes_id_as_string_friendly_integer() {
        let event = Event {
            id: 42,
            run_id: "R1".into(),
            event_type: EventType::Log,
            node_id: Some("A".into()),
            timestamp: Utc::now(),
            data: serde_json::json!({"message": "hi"}),
        };
        assert_eq!(event.id_str(), "42");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["id"], serde_json::Value::String("42".to_string()));
    }

    #[test]
    fn event_id_round_trips_through_its_string_wire_form() {
        let event = Event {
            id: 7,
            run_id: "R1".into(),
            event_type: EventType::Log,
            node_id: None,
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
        };
        let json = serde_json::to_value(&event).unwrap();
        let round_tripped: Event = serde_json::from_value(json).unwrap();
        assert_eq!(round_tripped.id, 7);
    }
}
