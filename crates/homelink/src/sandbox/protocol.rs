//! Messages exchanged with the script process.
//!
//! Newline-delimited JSON over the process's stdin (host -> script) and
//! stdout (script -> host). Every line is one internally tagged message.

use serde::Deserialize;
use serde::Serialize;

/// Messages sent from the script process to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptMessage {
    /// Script compiled and its top level ran without throwing
    Ready,

    /// Script failed to compile or threw during top level evaluation
    CompileError { error: String },

    /// Every listener finished handling message `seq`
    Done { seq: u64 },

    /// A listener threw while handling message `seq`
    Failed { seq: u64, error: String },

    /// A timer callback threw
    Uncaught { error: String },

    /// Envelope produced by `set(...)`
    Host { message: serde_json::Value },

    /// Console output from the script
    Log { level: LogLevel, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Messages sent from the host to the script process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Deliver an envelope to `handleMessage`
    HandleMessage {
        seq: u64,
        message: serde_json::Value,
    },

    /// Graceful shutdown signal
    Shutdown,
}

/// Serialize as one protocol line, newline included.
pub fn encode_line(message: &HostMessage) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line(line: &str) -> serde_json::Result<ScriptMessage> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_encode_handle_message() {
        let line = encode_line(&HostMessage::HandleMessage {
            seq: 3,
            message: json!({"version": 1, "type": "deviceList", "data": []}),
        })
        .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "handle_message");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["message"]["type"], "deviceList");

        assert_eq!(
            encode_line(&HostMessage::Shutdown).unwrap(),
            "{\"type\":\"shutdown\"}\n"
        );
    }

    #[test]
    fn test_decode_script_messages() {
        assert_eq!(decode_line("{\"type\":\"ready\"}\n").unwrap(), ScriptMessage::Ready);
        assert_eq!(
            decode_line(r#"{"type":"failed","seq":2,"error":"boom"}"#).unwrap(),
            ScriptMessage::Failed {
                seq: 2,
                error: "boom".to_string()
            }
        );
        assert_eq!(
            decode_line(r#"{"type":"log","level":"warning","message":"hi"}"#).unwrap(),
            ScriptMessage::Log {
                level: LogLevel::Warning,
                message: "hi".to_string()
            }
        );
        assert!(decode_line(r#"{"type":"exec","cmd":"rm"}"#).is_err());
        assert!(decode_line("console noise").is_err());
    }
}
