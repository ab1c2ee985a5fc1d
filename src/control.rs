//! Control Protocol (spec.md §4.6, component C6): newline-delimited JSON
//! requests and responses exchanged over the admin Unix socket.
//!
//! Grounded on `command/ipc.rs::Message` in the codebase this crate is
//! grounded on for the idea of a small serializable command enum read
//! off a stream, generalized from that module's single fire-and-forget
//! signal messages to the full request/response pair spec.md §4.6
//! requires (every request gets exactly one reply, and several carry a
//! structured payload back).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::roster::RosterError;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Reload,
    Ps,
    Start { daemon: String },
    Stop { daemon: String },
    Restart { daemon: String },
    CancelRestart { daemon: String },
    ListCommands { daemon: String },
    AdminCommand { daemon: String, admin_command: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub name: String,
    pub state: String,
    pub pid: Option<i32>,
    /// Unix timestamp the current child started, if any (spec.md §4.6).
    pub since_ts: Option<i64>,
    pub restart_cursor: usize,
    /// Seconds remaining until the next scheduled (re)start, if the
    /// daemon is `cooling_down` (spec.md §3, §4.6).
    pub next_wake: Option<u64>,
    pub last_exit_code: Option<i32>,
    pub last_exit_signal: Option<i32>,
}

/// `ps` result payload (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsResult {
    pub daemons: Vec<DaemonStatus>,
}

/// `list_commands` result payload (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsResult {
    pub names: Vec<String>,
}

/// `admin_command` result payload (spec.md §4.6, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminCommandResult {
    pub output: String,
    pub truncated: bool,
    pub exit: Option<i32>,
    pub signal: Option<i32>,
}

/// `stop`/`restart` result payload, mirroring the stopped child's final
/// exit disposition (spec.md §4.6). `output` is always empty — only
/// `admin_command` captures real output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResult {
    pub output: String,
    pub exit: Option<i32>,
    pub signal: Option<i32>,
}

/// The wire envelope (spec.md §4.6, §8): every reply is either
/// `{"status":"ok"}` (result absent — `start`, `cancel_restart`,
/// `reload`), `{"status":"ok","result":...}` (a payload riding along —
/// `ps`, `stop`, `restart`, `list_commands`, `admin_command`), or
/// `{"status":"error","message":...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        result: Option<serde_json::Value>,
    },
    Error {
        message: String,
    },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok { result: None }
    }

    pub fn ok_with(result: impl Serialize) -> Self {
        Response::Ok {
            result: Some(serde_json::to_value(result).unwrap_or(serde_json::Value::Null)),
        }
    }

    pub fn error(err: impl std::fmt::Display) -> Self {
        Response::Error {
            message: err.to_string(),
        }
    }
}

pub fn encode(response: &Response) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    Ok(line)
}

pub fn decode(line: &str) -> Result<Request, ProtocolError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_simple_request() {
        let decoded = decode(r#"{"command":"ps"}"#).unwrap();
        assert!(matches!(decoded, Request::Ps));
    }

    #[test]
    fn round_trips_a_request_with_a_payload() {
        let decoded = decode(r#"{"command":"stop","daemon":"messenger"}"#).unwrap();
        match decoded {
            Request::Stop { daemon } => assert_eq!(daemon, "messenger"),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn encode_appends_newline_framing() {
        let line = encode(&Response::ok()).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        assert!(matches!(
            decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn ok_without_result_serializes_to_the_bare_envelope() {
        let line = encode(&Response::ok()).unwrap();
        assert_eq!(line, "{\"status\":\"ok\"}\n");
    }

    #[test]
    fn ok_with_result_nests_the_payload_under_result() {
        let line = encode(&Response::ok_with(StopResult {
            output: String::new(),
            exit: Some(0),
            signal: None,
        }))
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["result"]["exit"], 0);
    }

    #[test]
    fn error_serializes_with_a_message_and_no_result() {
        let line = encode(&Response::error("no such daemon: `x`")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "no such daemon: `x`");
    }
}
