//! Session transcripts: directory layout, plain-text rendering, and the
//! process-wide "transcript updated" event bus.
//!
//! Transcripts are append-only JSONL files, one message object per line.
//! For indexing they are rendered to plain text (`role: text` lines); the
//! renderer records a line map from every rendered line back to the JSONL
//! line that produced it, so chunk provenance points at real transcript
//! lines.

use once_cell::sync::Lazy;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// State directory for one agent: `~/.memidx/agents/<agent-id>`.
pub fn resolve_agent_dir(agent_id: &str) -> PathBuf {
    let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join(".memidx").join("agents").join(agent_id)
}

/// Directory holding an agent's session transcript files.
pub fn resolve_session_transcripts_dir_for_agent(agent_id: &str) -> PathBuf {
    resolve_agent_dir(agent_id).join("sessions")
}

/// A transcript rendered for chunking.
#[derive(Debug, Clone, Default)]
pub struct RenderedTranscript {
    pub text: String,
    /// `line_map[i]` is the 1-based transcript line that produced
    /// rendered line `i + 1`.
    pub line_map: Vec<usize>,
}

/// Render a JSONL transcript to plain text with a line map.
///
/// Non-JSON lines are kept verbatim (a transcript may carry banners or
/// partial trailing writes); blank lines are skipped. Message content is
/// taken from `content` when it is a string, or from the concatenated
/// `text` fields when it is a block array.
pub fn render_transcript(raw: &str) -> RenderedTranscript {
    let mut out = RenderedTranscript::default();

    for (idx, line) in raw.lines().enumerate() {
        let source_line = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let rendered = match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => render_message(&value),
            Err(_) => Some(trimmed.to_string()),
        };

        if let Some(rendered) = rendered {
            for rendered_line in rendered.lines() {
                if rendered_line.trim().is_empty() {
                    continue;
                }
                out.text.push_str(rendered_line);
                out.text.push('\n');
                out.line_map.push(source_line);
            }
        }
    }

    out
}

fn render_message(value: &Value) -> Option<String> {
    let role = value.get("role").and_then(Value::as_str).unwrap_or("event");
    let content = value.get("content").or_else(|| {
        value
            .get("message")
            .and_then(|message| message.get("content"))
    })?;

    let text = match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect();
            if parts.is_empty() {
                return None;
            }
            parts.join("\n")
        }
        _ => return None,
    };

    if text.trim().is_empty() {
        return None;
    }
    Some(format!("{role}: {text}"))
}

/// A "transcript file grew" notification.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_file: PathBuf,
}

static SESSION_EVENTS: Lazy<broadcast::Sender<SessionEvent>> = Lazy::new(|| {
    let (tx, _rx) = broadcast::channel(256);
    tx
});

/// Subscribe to transcript-update events. Dropping the receiver
/// unsubscribes.
pub fn subscribe_session_updates() -> broadcast::Receiver<SessionEvent> {
    SESSION_EVENTS.subscribe()
}

/// Publish a transcript-update event. Whitespace is trimmed and empty
/// paths are dropped.
pub fn publish_session_update(session_file: &Path) {
    let trimmed = session_file.to_string_lossy().trim().to_string();
    if trimmed.is_empty() {
        return;
    }
    let _ = SESSION_EVENTS.send(SessionEvent {
        session_file: PathBuf::from(trimmed),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_string_and_block_content() {
        let raw = concat!(
            r#"{"role":"user","content":"hello there"}"#,
            "\n",
            r#"{"role":"assistant","content":[{"type":"text","text":"hi"},{"type":"text","text":"second"}]}"#,
            "\n",
        );
        let rendered = render_transcript(raw);
        let lines: Vec<&str> = rendered.text.lines().collect();
        assert_eq!(
            lines,
            vec!["user: hello there", "assistant: hi", "second"]
        );
        // Rendered lines 2 and 3 both come from transcript line 2.
        assert_eq!(rendered.line_map, vec![1, 2, 2]);
    }

    #[test]
    fn skips_blank_and_non_text_messages() {
        let raw = concat!(
            "\n",
            r#"{"role":"user","content":""}"#,
            "\n",
            r#"{"role":"tool","content":[{"type":"image"}]}"#,
            "\n",
            r#"{"role":"user","content":"real"}"#,
            "\n",
        );
        let rendered = render_transcript(raw);
        assert_eq!(rendered.text, "user: real\n");
        assert_eq!(rendered.line_map, vec![4]);
    }

    #[test]
    fn keeps_non_json_lines_verbatim() {
        let rendered = render_transcript("plain banner line\n");
        assert_eq!(rendered.text, "plain banner line\n");
        assert_eq!(rendered.line_map, vec![1]);
    }

    #[test]
    fn empty_event_paths_are_dropped() {
        let mut rx = subscribe_session_updates();
        publish_session_update(Path::new("   "));
        assert!(rx.try_recv().is_err());

        publish_session_update(Path::new("/tmp/session.jsonl"));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.session_file, PathBuf::from("/tmp/session.jsonl"));
    }

    #[test]
    fn transcripts_dir_is_under_agent_dir() {
        let dir = resolve_session_transcripts_dir_for_agent("agent-1");
        assert!(dir.ends_with("agents/agent-1/sessions"));
    }
}
