//! NDJSON output parsing shared by every driver implementation.
//!
//! Each line written by an agent process is expected to be a single JSON
//! object `{"type": "...", ...}` naming one of the recognized event
//! kinds; anything else (plain text, malformed JSON) is preserved as a
//! `log` line rather than discarded, since a misbehaving agent's stderr
//! chatter is still diagnostic signal.

use super::DriverEvent;

pub fn parse_line(line: &str) -> DriverEvent {
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return DriverEvent::Log { message: String::new() };
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => {
            return DriverEvent::Log {
                message: trimmed.to_string(),
            }
        }
    };

    let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("log");
    match kind {
        "progress" => DriverEvent::Progress {
            data: value.get("data").cloned().unwrap_or(serde_json::Value::Null),
        },
        "checkpoint" => DriverEvent::Checkpoint {
            data: value.get("data").cloned().unwrap_or(serde_json::Value::Null),
        },
        "stream_data" => DriverEvent::StreamData {
            data: value.get("data").cloned().unwrap_or(serde_json::Value::Null),
        },
        "error" => DriverEvent::Error {
            message: value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("driver reported an error")
                .to_string(),
        },
        _ => DriverEvent::Log {
            message: value
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or(trimmed.to_string()),
        },
    }
}
