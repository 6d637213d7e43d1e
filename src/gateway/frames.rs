//! Pull-based SSE frame decoding.
//!
//! The upstream log stream arrives as arbitrary byte chunks. [`FrameDecoder`]
//! buffers them and yields complete `event`/`data` frames split on blank-line
//! boundaries; the consumer is a plain loop. `reset` makes one decoder safe
//! to reuse across upstream reconnects without leaking a partial frame from
//! the dead connection into the new one.

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    #[must_use]
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// Parse the data payload as JSON, if it is JSON.
    #[must_use]
    pub fn data_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.data).ok()
    }
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(boundary) = find_blank_line(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..boundary + 2).collect();
            let text = String::from_utf8_lossy(&raw[..boundary]);
            if let Some(frame) = parse_frame(&text) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Drop any partial frame; call before reconnecting upstream.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

fn parse_frame(text: &str) -> Option<SseFrame> {
    let mut event = "message".to_string();
    let mut data_lines: Vec<&str> = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(value) = line.strip_prefix("event:") {
            event = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim());
        }
        // Comments and id/retry fields pass through unused.
    }
    if data_lines.is_empty() && event == "message" {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"event: log\ndata: {\"msg\":\"hi\"}\n\n");
        assert_eq!(frames, vec![SseFrame::new("log", r#"{"msg":"hi"}"#)]);
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"event: lo").is_empty());
        assert!(decoder.feed(b"g\ndata: pay").is_empty());
        let frames = decoder.feed(b"load\n\n");
        assert_eq!(frames, vec![SseFrame::new("log", "payload")]);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"event: a\ndata: 1\n\nevent: b\ndata: 2\n\n");
        assert_eq!(
            frames,
            vec![SseFrame::new("a", "1"), SseFrame::new("b", "2")]
        );
    }

    #[test]
    fn chunking_does_not_change_output() {
        let input = b"event: log\ndata: one\n\nevent: end\ndata: {}\n\n";
        let mut whole = FrameDecoder::new();
        let expected = whole.feed(input);

        let mut byte_by_byte = FrameDecoder::new();
        let mut collected = Vec::new();
        for byte in input {
            collected.extend(byte_by_byte.feed(&[*byte]));
        }
        assert_eq!(collected, expected);
    }

    #[test]
    fn default_event_is_message() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"data: hello\n\n");
        assert_eq!(frames, vec![SseFrame::new("message", "hello")]);
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"event: log\ndata: one\ndata: two\n\n");
        assert_eq!(frames, vec![SseFrame::new("log", "one\ntwo")]);
    }

    #[test]
    fn crlf_lines_are_tolerated() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"event: log\r\ndata: x\r\n\n");
        assert_eq!(frames, vec![SseFrame::new("log", "x")]);
    }

    #[test]
    fn comment_only_frames_are_skipped() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b": keep-alive\n\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"event: log\ndata: stale").is_empty());
        decoder.reset();
        let frames = decoder.feed(b"event: fresh\ndata: 1\n\n");
        assert_eq!(frames, vec![SseFrame::new("fresh", "1")]);
    }

    #[test]
    fn data_json_parses_objects() {
        let frame = SseFrame::new("log", r#"{"msg":"m","level":"info"}"#);
        let value = frame.data_json().expect("json");
        assert_eq!(value["msg"], "m");

        let frame = SseFrame::new("log", "not-json");
        assert!(frame.data_json().is_none());
    }
}
