//! Wire protocol between controller and supervisor.
//!
//! Both directions carry newline-terminated UTF-8 frames with `:` separating
//! the prefix from the payload. There is no escaping; payloads never contain
//! a newline. The death channel is a separate fd carrying one `<pid>\n` line
//! per departed child.

use crate::errors::PrewarmError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Command prefixes, controller -> supervisor
pub const CMD_FORK: &str = "fork";
pub const CMD_READY: &str = "ready";
pub const CMD_RELOAD_CONFIG: &str = "reload_kitty_config";
pub const CMD_ECHO: &str = "echo";

// Reply prefixes, supervisor -> controller
pub const REPLY_CHILD: &str = "CHILD";
pub const REPLY_ERR: &str = "ERR";

/// One parsed command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read the request from the named region and fork a child.
    Fork { shm_name: String },
    /// Release the child's readiness gate.
    Ready { child_id: u64 },
    /// Re-apply configuration from the frame payload.
    ReloadConfig { payload: String },
    /// Liveness probe; the payload is echoed back verbatim.
    Echo { text: String },
}

pub fn parse_command(line: &str) -> Result<Command, PrewarmError> {
    let (cmd, payload) = line
        .split_once(':')
        .ok_or_else(|| PrewarmError::Protocol(format!("frame without separator: {line:?}")))?;
    match cmd {
        CMD_FORK => Ok(Command::Fork {
            shm_name: payload.to_string(),
        }),
        CMD_READY => payload
            .parse()
            .map(|child_id| Command::Ready { child_id })
            .map_err(|_| PrewarmError::Protocol(format!("bad child id: {payload:?}"))),
        CMD_RELOAD_CONFIG => Ok(Command::ReloadConfig {
            payload: payload.to_string(),
        }),
        CMD_ECHO => Ok(Command::Echo {
            text: payload.to_string(),
        }),
        other => Err(PrewarmError::Protocol(format!("unknown command: {other:?}"))),
    }
}

/// One parsed reply frame, as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Child { child_id: u64, pid: i32 },
    Err { message: String },
    /// Anything else (echo replies); handed through verbatim.
    Other(String),
}

pub fn parse_reply(line: &str) -> Reply {
    if let Some(rest) = line.strip_prefix("CHILD:") {
        if let Some((id, pid)) = rest.split_once(':') {
            if let (Ok(child_id), Ok(pid)) = (id.parse(), pid.parse()) {
                return Reply::Child { child_id, pid };
            }
        }
    }
    if let Some(message) = line.strip_prefix("ERR:") {
        return Reply::Err {
            message: message.to_string(),
        };
    }
    Reply::Other(line.to_string())
}

/// Encode a successful fork reply.
pub fn child_frame(child_id: u64, pid: i32) -> String {
    format!("{REPLY_CHILD}:{child_id}:{pid}\n")
}

/// Encode a fork failure reply. Newlines in the message would break framing
/// and are replaced with spaces.
pub fn err_frame(message: &str) -> String {
    format!("{REPLY_ERR}:{}\n", message.replace('\n', " "))
}

/// The fork request fingerprint carried through shared memory.
///
/// `stdin_size` is omitted from the JSON when zero; when positive, that many
/// literal stdin bytes follow the JSON payload inside the region.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ForkRequest {
    #[serde(default)]
    pub tty_name: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "size_is_zero")]
    pub stdin_size: usize,
}

fn size_is_zero(n: &usize) -> bool {
    *n == 0
}

/// Per-direction accumulation buffer: bytes in, complete frames out.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, without its terminating newline.
    /// A non-UTF-8 frame is consumed and reported as a protocol error.
    pub fn next_line(&mut self) -> Option<Result<String, PrewarmError>> {
        let idx = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=idx).collect();
        Some(
            String::from_utf8(line[..line.len() - 1].to_vec())
                .map_err(|_| PrewarmError::Protocol("frame is not UTF-8".to_string())),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fork_command() {
        let cmd = parse_command("fork:/kitty-prewarm-abc").unwrap();
        assert_eq!(
            cmd,
            Command::Fork {
                shm_name: "/kitty-prewarm-abc".to_string()
            }
        );
    }

    #[test]
    fn test_parse_ready_command() {
        assert_eq!(
            parse_command("ready:17").unwrap(),
            Command::Ready { child_id: 17 }
        );
        assert!(parse_command("ready:not-a-number").is_err());
    }

    #[test]
    fn test_echo_payload_may_contain_separator() {
        let cmd = parse_command("echo:a:b:c").unwrap();
        assert_eq!(
            cmd,
            Command::Echo {
                text: "a:b:c".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(parse_command("launch:now").is_err());
        assert!(parse_command("no separator").is_err());
    }

    #[test]
    fn test_err_frame_replaces_newlines() {
        assert_eq!(err_frame("line one\nline two"), "ERR:line one line two\n");
    }

    #[test]
    fn test_parse_reply_variants() {
        assert_eq!(
            parse_reply("CHILD:3:4242"),
            Reply::Child {
                child_id: 3,
                pid: 4242
            }
        );
        assert_eq!(
            parse_reply("ERR:no such tty"),
            Reply::Err {
                message: "no such tty".to_string()
            }
        );
        assert_eq!(parse_reply("pong"), Reply::Other("pong".to_string()));
        // A CHILD frame with a mangled pid is not silently misread
        assert_eq!(
            parse_reply("CHILD:3:x"),
            Reply::Other("CHILD:3:x".to_string())
        );
    }

    #[test]
    fn test_line_buffer_reassembles_fragments() {
        let mut buf = LineBuffer::new();
        buf.extend(b"ec");
        assert!(buf.next_line().is_none());
        buf.extend(b"ho:hi\nready:");
        assert_eq!(buf.next_line().unwrap().unwrap(), "echo:hi");
        assert!(buf.next_line().is_none());
        buf.extend(b"2\n");
        assert_eq!(buf.next_line().unwrap().unwrap(), "ready:2");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_line_buffer_rejects_non_utf8() {
        let mut buf = LineBuffer::new();
        buf.extend(&[0xff, 0xfe, b'\n', b'o', b'k', b'\n']);
        assert!(buf.next_line().unwrap().is_err());
        assert_eq!(buf.next_line().unwrap().unwrap(), "ok");
    }

    #[test]
    fn test_fork_request_json_omits_zero_stdin_size() {
        let req = ForkRequest {
            tty_name: "/dev/pts/3".to_string(),
            cwd: "/tmp".to_string(),
            argv: vec!["echo".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("stdin_size"));

        let back: ForkRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_fork_request_json_with_stdin_size() {
        let json = r#"{"tty_name":"/dev/pts/0","cwd":"/","argv":["save","/tmp/x"],"env":{"A":"1"},"stdin_size":5}"#;
        let req: ForkRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.stdin_size, 5);
        assert_eq!(req.env.get("A").map(String::as_str), Some("1"));
    }
}
