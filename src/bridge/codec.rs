//! Newline-delimited JSON framing for the worker channel.
//!
//! Encoding produces one frame per request; `serde_json` escapes any newline
//! inside string values, so the `0x0A` delimiter cannot occur unescaped
//! within a frame. Decoding is a pure function of (buffered bytes, new
//! chunk) with no I/O, so it can be driven with arbitrarily split input.

use serde_json::{json, Value};

/// Maximum accepted frame size. A worker that streams more than this without
/// a delimiter has desynchronized; the buffer is dropped and decoding
/// resumes at the next delimiter.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// A decoded unit of worker output that correlates to a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Result {
        id: u64,
        payload: Value,
    },
    Error {
        id: u64,
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl Reply {
    pub fn id(&self) -> u64 {
        match self {
            Self::Result { id, .. } | Self::Error { id, .. } => *id,
        }
    }
}

/// One decode outcome. Diagnostics and malformed frames are surfaced rather
/// than dropped so the caller can route them to the log.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Reply(Reply),
    Diagnostic(String),
    Malformed { reason: String },
}

/// Encode one request frame: a JSON-RPC request object plus the trailing
/// newline delimiter.
pub fn encode_request(id: u64, method: &str, params: &Value) -> Vec<u8> {
    let mut frame = serde_json::to_vec(&json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    }))
    .expect("request frame serialization");
    frame.push(b'\n');
    frame
}

/// Incremental frame decoder. Feed it raw chunks as they arrive; complete
/// frames are emitted in order and partial trailing bytes are retained for
/// the next push.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every frame completed by it. The same
    /// byte sequence produces the same decode events regardless of how it
    /// is split across pushes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = decode_line(&line[..line.len() - 1]) {
                events.push(event);
            }
        }

        if self.buffer.len() > MAX_FRAME_BYTES {
            let buffered = self.buffer.len();
            self.buffer.clear();
            events.push(Decoded::Malformed {
                reason: format!("frame exceeds {MAX_FRAME_BYTES} bytes ({buffered} buffered)"),
            });
        }

        events
    }
}

/// Classify one delimited line.
///
/// Lines that do not start with `{` are out-of-band diagnostic text (worker
/// print statements). Lines that look like protocol frames but cannot be
/// parsed, or that carry a correlation id without a result or error, are
/// malformed. Worker-initiated requests and notifications carry a `method`
/// and are reported as diagnostics; the bridge never answers them.
fn decode_line(line: &[u8]) -> Option<Decoded> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.starts_with('{') {
        return Some(Decoded::Diagnostic(trimmed.to_string()));
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            return Some(Decoded::Malformed {
                reason: err.to_string(),
            })
        }
    };

    let Some(id) = value.get("id").and_then(Value::as_u64) else {
        return Some(Decoded::Diagnostic(trimmed.to_string()));
    };

    if let Some(payload) = value.get("result") {
        return Some(Decoded::Reply(Reply::Result {
            id,
            payload: payload.clone(),
        }));
    }

    if let Some(error) = value.get("error") {
        return Some(Decoded::Reply(Reply::Error {
            id,
            code: error.get("code").and_then(Value::as_i64).unwrap_or(-32603),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified worker error")
                .to_string(),
            data: error.get("data").cloned(),
        }));
    }

    if value.get("method").is_some() {
        return Some(Decoded::Diagnostic(trimmed.to_string()));
    }

    Some(Decoded::Malformed {
        reason: "frame carries an id but neither result nor error".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder, bytes: &[u8]) -> Vec<Decoded> {
        decoder.push(bytes)
    }

    #[test]
    fn encode_produces_one_delimited_frame() {
        let frame = encode_request(7, "tools/call", &json!({"name": "read_file"}));
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|&&b| b == b'\n').count(), 1);

        let parsed: Value = serde_json::from_slice(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["id"], 7);
        assert_eq!(parsed["method"], "tools/call");
        assert_eq!(parsed["params"]["name"], "read_file");
    }

    #[test]
    fn encode_escapes_embedded_newlines() {
        let frame = encode_request(1, "tools/call", &json!({"text": "line1\nline2"}));
        // The delimiter must be the only literal newline in the frame.
        assert_eq!(frame.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn decodes_result_reply() {
        let mut decoder = FrameDecoder::new();
        let events = decode_all(
            &mut decoder,
            b"{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"elements\":[]}}\n",
        );
        assert_eq!(
            events,
            vec![Decoded::Reply(Reply::Result {
                id: 3,
                payload: json!({"elements": []}),
            })]
        );
    }

    #[test]
    fn decodes_error_reply() {
        let mut decoder = FrameDecoder::new();
        let events = decode_all(
            &mut decoder,
            b"{\"jsonrpc\":\"2.0\",\"id\":9,\"error\":{\"code\":-32601,\"message\":\"unknown tool\"}}\n",
        );
        assert_eq!(
            events,
            vec![Decoded::Reply(Reply::Error {
                id: 9,
                code: -32601,
                message: "unknown tool".to_string(),
                data: None,
            })]
        );
    }

    #[test]
    fn partial_frame_is_retained_until_complete() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"{\"jsonrpc\":\"2.0\",\"id\":1,").is_empty());
        let events = decoder.push(b"\"result\":{}}\n");
        assert_eq!(
            events,
            vec![Decoded::Reply(Reply::Result {
                id: 1,
                payload: json!({}),
            })]
        );
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(
            b"{\"id\":1,\"result\":1}\n{\"id\":2,\"result\":2}\n{\"id\":3,\"result\":3}\n",
        );
        let ids: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                Decoded::Reply(reply) => Some(reply.id()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn byte_at_a_time_decoding_matches_whole_chunk() {
        let stream = b"INFO worker booted\n{\"id\":1,\"result\":{\"a\":1}}\nnot json {\n{\"id\":2,\"error\":{\"code\":-1,\"message\":\"x\"}}\n";

        let mut whole = FrameDecoder::new();
        let expected = whole.push(stream);

        let mut split = FrameDecoder::new();
        let mut actual = Vec::new();
        for byte in stream.iter() {
            actual.extend(split.push(std::slice::from_ref(byte)));
        }

        assert_eq!(actual, expected);
        assert_eq!(expected.len(), 4);
    }

    #[test]
    fn diagnostic_text_is_not_a_reply() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"worker warming up...\n");
        assert_eq!(
            events,
            vec![Decoded::Diagnostic("worker warming up...".to_string())]
        );
    }

    #[test]
    fn malformed_frame_does_not_stop_decoding() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"{\"id\":1,\"resu\n{\"id\":2,\"result\":{}}\n");
        assert!(matches!(events[0], Decoded::Malformed { .. }));
        assert_eq!(
            events[1],
            Decoded::Reply(Reply::Result {
                id: 2,
                payload: json!({}),
            })
        );
    }

    #[test]
    fn notification_with_method_is_diagnostic() {
        let mut decoder = FrameDecoder::new();
        let events =
            decoder.push(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n");
        assert!(matches!(events[0], Decoded::Diagnostic(_)));
    }

    #[test]
    fn echoed_request_is_diagnostic_not_reply() {
        // A worker that parrots the request line back (id plus method, no
        // result) must not resolve the pending request.
        let mut decoder = FrameDecoder::new();
        let events = decoder
            .push(b"{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"tools/call\",\"params\":{}}\n");
        assert!(matches!(events[0], Decoded::Diagnostic(_)));
    }

    #[test]
    fn id_without_result_or_error_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"{\"jsonrpc\":\"2.0\",\"id\":4}\n");
        assert!(matches!(events[0], Decoded::Malformed { .. }));
    }

    #[test]
    fn empty_lines_are_skipped() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"\n\n  \n{\"id\":1,\"result\":null}\n");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn oversized_buffer_is_dropped_and_reported() {
        let mut decoder = FrameDecoder::new();
        let big = vec![b'x'; MAX_FRAME_BYTES + 1];
        let events = decoder.push(&big);
        assert!(matches!(events[0], Decoded::Malformed { .. }));

        // Decoding resumes with the next well-formed frame.
        let events = decoder.push(b"\n{\"id\":8,\"result\":true}\n");
        assert!(events
            .iter()
            .any(|e| matches!(e, Decoded::Reply(Reply::Result { id: 8, .. }))));
    }
}
