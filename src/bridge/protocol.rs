//! Newline-delimited JSON frames exchanged with plugin processes.
//!
//! Child → parent, one frame per stdout line:
//!
//! ```text
//! {"type":"log","level":"info","message":"fetched 30 issues"}
//! {"type":"progress","current":30,"total":120,"increment":30}
//! {"type":"result","data":{...}}
//! {"type":"error","message":"token expired"}
//! ```
//!
//! Parent → child, on stdin: `{"type":"cancel"}`, written at most once.
//! Stdout lines that are not a tagged JSON object are plain log text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const FRAME_TAGS: [&str; 4] = ["log", "progress", "result", "error"];

/// Progress reported by a remote subtask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProgress {
    #[serde(default)]
    pub current: u64,
    /// 0 when unknown.
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub increment: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Log {
        #[serde(default = "default_level")]
        level: String,
        message: String,
    },
    Progress(RemoteProgress),
    Result {
        #[serde(default)]
        data: Value,
    },
    Error {
        message: String,
    },
}

fn default_level() -> String {
    "info".to_string()
}

/// Messages the parent writes to the child's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Cancel,
}

impl ControlMessage {
    /// The message as one newline-terminated line.
    pub fn to_line(&self) -> String {
        let mut line = match self {
            ControlMessage::Cancel => r#"{"type":"cancel"}"#.to_string(),
        };
        line.push('\n');
        line
    }
}

/// Classification of one stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Frame(Frame),
    Text(String),
    /// A known frame tag with an invalid body.
    Malformed(String),
    Empty,
}

pub fn decode_line(line: &str) -> Decoded {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Decoded::Empty;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => return Decoded::Text(line.to_string()),
    };
    let tagged = value
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|tag| FRAME_TAGS.contains(&tag));
    if !tagged {
        return Decoded::Text(line.to_string());
    }

    match serde_json::from_value::<Frame>(value) {
        Ok(frame) => Decoded::Frame(frame),
        Err(e) => Decoded::Malformed(format!("{}: {}", e, line)),
    }
}
