use crate::errors::{SeeFlowError, SeeFlowResult};
use crate::llm::types::{StreamChunk, StreamChunkKind};

/// Parses a raw SSE line (OpenAI-compatible format) into a StreamChunk.
/// Returns None if the line is a keep-alive or non-data line.
pub fn parse_sse_line(line: &str) -> SeeFlowResult<Option<StreamChunk>> {
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return Ok(None);
    };

    if data == "[DONE]" {
        return Ok(Some(StreamChunk {
            kind: StreamChunkKind::Done,
            content: String::new(),
        }));
    }

    let json: serde_json::Value =
        serde_json::from_str(data).map_err(|e| SeeFlowError::SseParsing(e.to_string()))?;

    if let Some(message) = json["error"]["message"].as_str() {
        return Err(SeeFlowError::ModelProvider(format!("stream error: {message}")));
    }

    let Some(first) = json["choices"].as_array().and_then(|c| c.first()) else {
        return Ok(None);
    };
    let delta = &first["delta"];

    // Some models (DeepSeek, Qwen) expose their reasoning separately.
    if let Some(reasoning) = delta["reasoning_content"].as_str() {
        if !reasoning.is_empty() {
            return Ok(Some(StreamChunk {
                kind: StreamChunkKind::Reasoning,
                content: reasoning.to_string(),
            }));
        }
    }

    if let Some(content) = delta["content"].as_str() {
        if !content.is_empty() {
            return Ok(Some(StreamChunk {
                kind: StreamChunkKind::Content,
                content: content.to_string(),
            }));
        }
    }

    if first["finish_reason"].as_str().is_some() {
        return Ok(Some(StreamChunk {
            kind: StreamChunkKind::Done,
            content: String::new(),
        }));
    }

    Ok(None)
}

/// Folds raw stream bytes into the reply text.
///
/// Bytes are buffered until a full `\n`-terminated line is available, so a UTF-8
/// sequence split across network chunks decodes intact.
#[derive(Debug, Default)]
pub struct StreamCollector {
    pending: Vec<u8>,
    content: String,
    reasoning_len: usize,
    done: bool,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one network chunk. Returns `true` once the stream signalled completion.
    pub fn push(&mut self, bytes: &[u8]) -> SeeFlowResult<bool> {
        if self.done {
            return Ok(true);
        }
        self.pending.extend_from_slice(bytes);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.apply_line(&line)?;
            if self.done {
                self.pending.clear();
                break;
            }
        }
        Ok(self.done)
    }

    /// Processes an unterminated trailing line and returns the collected content.
    pub fn finish(mut self) -> SeeFlowResult<String> {
        if !self.done && !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.apply_line(&rest)?;
        }
        Ok(self.content)
    }

    pub fn reasoning_len(&self) -> usize {
        self.reasoning_len
    }

    fn apply_line(&mut self, raw: &[u8]) -> SeeFlowResult<()> {
        let decoded = String::from_utf8_lossy(raw);
        let line = decoded.trim();
        if line.is_empty() {
            return Ok(());
        }
        match parse_sse_line(line) {
            Ok(Some(chunk)) => match chunk.kind {
                StreamChunkKind::Content => self.content.push_str(&chunk.content),
                StreamChunkKind::Reasoning => self.reasoning_len += chunk.content.len(),
                StreamChunkKind::Done => self.done = true,
            },
            Ok(None) => {}
            Err(e @ SeeFlowError::ModelProvider(_)) => return Err(e),
            Err(e) => tracing::debug!("SSE parse skipped: {e}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_delta() {
        let chunk = parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Thought"}}]}"#)
            .expect("ok")
            .expect("chunk");
        assert_eq!(chunk.kind, StreamChunkKind::Content);
        assert_eq!(chunk.content, "Thought");
    }

    #[test]
    fn done_marker_and_finish_reason() {
        let done = parse_sse_line("data: [DONE]").expect("ok").expect("chunk");
        assert_eq!(done.kind, StreamChunkKind::Done);

        let finish = parse_sse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#)
            .expect("ok")
            .expect("chunk");
        assert_eq!(finish.kind, StreamChunkKind::Done);
    }

    #[test]
    fn keep_alive_and_other_fields_are_ignored() {
        assert!(parse_sse_line(": ping").expect("ok").is_none());
        assert!(parse_sse_line("event: message").expect("ok").is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            parse_sse_line("data: {nope"),
            Err(SeeFlowError::SseParsing(_))
        ));
    }

    #[test]
    fn provider_error_payload_surfaces() {
        assert!(matches!(
            parse_sse_line(r#"data: {"error":{"message":"rate limited"}}"#),
            Err(SeeFlowError::ModelProvider(_))
        ));
    }

    #[test]
    fn multibyte_character_split_across_chunks_survives() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"Type(\\\"café ✓\\\")\"}}]}\n";
        let bytes = line.as_bytes();
        let split = line.find('✓').expect("check mark") + 1;

        let mut collector = StreamCollector::new();
        assert!(!collector.push(&bytes[..split]).expect("first half"));
        assert!(!collector.push(&bytes[split..]).expect("second half"));
        assert_eq!(collector.finish().expect("finish"), "Type(\"café ✓\")");
    }

    #[test]
    fn trailing_line_without_newline_is_kept() {
        let mut collector = StreamCollector::new();
        collector
            .push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Thought: \"}}]}\n")
            .expect("push");
        collector
            .push(b"data: {\"choices\":[{\"delta\":{\"content\":\"done\"}}]}")
            .expect("push");
        assert_eq!(collector.finish().expect("finish"), "Thought: done");
    }

    #[test]
    fn content_after_done_is_ignored() {
        let mut collector = StreamCollector::new();
        let done = collector
            .push(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n")
            .expect("push");
        assert!(done);
        assert_eq!(collector.finish().expect("finish"), "a");
    }
}
