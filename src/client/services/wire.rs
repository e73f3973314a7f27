use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::models::conversation::Message;
use crate::client::services::error::ExchangeError;

/// Frames the client writes to the chat socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    Chat(ChatSend),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSend {
    pub receiver_username: String,
    pub content: String,
}

/// Frames the chat socket pushes. Anything outside this set is a protocol
/// error the caller logs and drops; the connection stays up.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Welcome frame the server emits right after the upgrade.
    Connection(ConnectionInfo),
    /// A message relevant to some open conversation.
    NewMessage(Message),
    /// Ack-with-payload for a message this user just sent.
    MessageSent(Message),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl ServerFrame {
    pub fn message(&self) -> Option<&Message> {
        match self {
            ServerFrame::NewMessage(m) | ServerFrame::MessageSent(m) => Some(m),
            ServerFrame::Connection(_) => None,
        }
    }
}

pub fn decode_frame(text: &str) -> Result<ServerFrame, ExchangeError> {
    serde_json::from_str(text)
        .map_err(|e| ExchangeError::Protocol(format!("unrecognized frame: {}", e)))
}

pub fn encode_frame(frame: &ClientFrame) -> Result<String, ExchangeError> {
    serde_json::to_string(frame)
        .map_err(|e| ExchangeError::Protocol(format!("encode failed: {}", e)))
}

/// Payload of the `downloadNotification` SSE event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadNotice {
    #[serde(default)]
    pub downloader: String,
    #[serde(default)]
    pub article_id: i64,
    #[serde(default)]
    pub article_title: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub name: String,
    pub data: String,
}

/// Incremental server-sent-events parser.
///
/// Feed it one line at a time; a blank line dispatches the accumulated event.
/// Comment lines (leading `:`) carry the server's heartbeat and are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    event: String,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if self.data.is_empty() {
                self.event.clear();
                return None;
            }
            let event = SseEvent {
                name: std::mem::take(&mut self.event),
                data: self.data.join("\n"),
            };
            self.data.clear();
            return Some(event);
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = value.to_string(),
            "data" => self.data.push(value.to_string()),
            // id / retry are not part of the contract with this backend
            _ => {}
        }
        None
    }
}

pub const DOWNLOAD_EVENT: &str = "downloadNotification";

pub fn decode_download_notice(event: &SseEvent) -> Result<DownloadNotice, ExchangeError> {
    if event.name != DOWNLOAD_EVENT {
        return Err(ExchangeError::Protocol(format!(
            "unexpected sse event: {}",
            event.name
        )));
    }
    serde_json::from_str(&event.data)
        .map_err(|e| ExchangeError::Protocol(format!("bad notification payload: {}", e)))
}

/// Pick the filename to save a downloaded payload under.
///
/// The extended `filename*=UTF-8''…` form wins over the basic `filename=`,
/// which wins over the caller-suggested name.
pub fn resolve_filename(content_disposition: Option<&str>, fallback: &str) -> String {
    let header = match content_disposition {
        Some(h) => h,
        None => return fallback.to_string(),
    };
    if let Some(extended) = header_param(header, "filename*") {
        let value = extended
            .strip_prefix("UTF-8''")
            .or_else(|| extended.strip_prefix("utf-8''"))
            .unwrap_or(&extended);
        let decoded = percent_decode(value);
        if !decoded.is_empty() {
            return decoded;
        }
    }
    if let Some(basic) = header_param(header, "filename") {
        let trimmed = basic.trim_matches('"');
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    fallback.to_string()
}

fn header_param(header: &str, name: &str) -> Option<String> {
    for part in header.split(';') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let high = hex_val(bytes[i + 1]);
            let low = hex_val(bytes[i + 2]);
            if let (Some(h), Some(l)) = (high, low) {
                out.push((h << 4) | l);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|v| v as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_chat_frame_matches_the_contract() {
        let frame = ClientFrame::Chat(ChatSend {
            receiver_username: "bob".to_string(),
            content: "hello".to_string(),
        });
        let json = encode_frame(&frame).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "chat");
        assert_eq!(value["data"]["receiverUsername"], "bob");
        assert_eq!(value["data"]["content"], "hello");
    }

    #[test]
    fn inbound_message_frames_decode() {
        let text = r#"{"type":"new_message","data":{"id":3,"sender":{"username":"bob"},
            "receiver":{"username":"alice"},"content":"hi","is_read":false,
            "created_at":"2026-08-01T10:00:00Z"}}"#;
        match decode_frame(text).unwrap() {
            ServerFrame::NewMessage(m) => {
                assert_eq!(m.id, 3);
                assert_eq!(m.sender.username, "bob");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn welcome_frame_decodes() {
        let text = r#"{"type":"connection","data":{"message":"connected","timestamp":"2026-08-01T10:00:00Z"}}"#;
        assert!(matches!(
            decode_frame(text).unwrap(),
            ServerFrame::Connection(_)
        ));
    }

    #[test]
    fn unknown_tag_and_malformed_json_are_protocol_errors() {
        assert!(matches!(
            decode_frame(r#"{"type":"presence","data":{}}"#),
            Err(ExchangeError::Protocol(_))
        ));
        assert!(matches!(
            decode_frame("{nope"),
            Err(ExchangeError::Protocol(_))
        ));
    }

    #[test]
    fn sse_parser_dispatches_on_blank_line_and_skips_heartbeats() {
        let mut parser = SseParser::new();
        assert_eq!(parser.feed_line(": ping"), None);
        assert_eq!(parser.feed_line("event: downloadNotification"), None);
        assert_eq!(
            parser.feed_line(r#"data: {"downloader":"bob","articleId":9,"articleTitle":"apt report"}"#),
            None
        );
        let event = parser.feed_line("").expect("event complete");
        assert_eq!(event.name, DOWNLOAD_EVENT);
        let notice = decode_download_notice(&event).unwrap();
        assert_eq!(notice.downloader, "bob");
        assert_eq!(notice.article_id, 9);
        assert_eq!(notice.article_title, "apt report");
    }

    #[test]
    fn sse_parser_handles_crlf_and_multiline_data() {
        let mut parser = SseParser::new();
        parser.feed_line("event: downloadNotification\r");
        parser.feed_line("data: {\"downloader\":\"x\",");
        parser.feed_line("data: \"articleTitle\":\"t\"}");
        let event = parser.feed_line("\r").unwrap();
        assert_eq!(event.data, "{\"downloader\":\"x\",\n\"articleTitle\":\"t\"}");
    }

    #[test]
    fn extended_filename_wins_over_basic() {
        let header = r#"attachment; filename="plain.bin"; filename*=UTF-8''%E6%8A%A5%E5%91%8A.pdf"#;
        assert_eq!(resolve_filename(Some(header), "fallback"), "报告.pdf");
    }

    #[test]
    fn basic_filename_is_unquoted() {
        let header = r#"attachment; filename="report.pdf""#;
        assert_eq!(resolve_filename(Some(header), "fallback"), "report.pdf");
    }

    #[test]
    fn missing_header_falls_back_to_suggestion() {
        assert_eq!(resolve_filename(None, "article_9_file"), "article_9_file");
        assert_eq!(resolve_filename(Some("attachment"), "article_9_file"), "article_9_file");
    }
}
