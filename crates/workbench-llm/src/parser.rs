//! `data:` line protocol -> [`Frame`]s.
//!
//! The transport delivers arbitrary byte chunks. Lines are split on `\n`
//! only, so a multi-byte UTF-8 sequence cut by a chunk boundary is
//! reassembled before decoding.

use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use workbench_core::{Citation, EvaluationResult};

use crate::error::{ProtocolError, TransportError};
use crate::frame::Frame;
use crate::provider::FrameStream;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: BytesMut,
    finished: bool,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a `Done` or `Error` frame has been produced. Further input
    /// is discarded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let line = self.buffer.split_to(newline);
            self.buffer.advance(1);
            if self.parse_line(&line, &mut frames) {
                self.buffer.clear();
                break;
            }
        }
        frames
    }

    /// Flush an unterminated trailing line at end of transport.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if !self.finished && !self.buffer.is_empty() {
            let line = self.buffer.split();
            self.parse_line(&line, &mut frames);
        }
        self.buffer.clear();
        self.finished = true;
        frames
    }

    /// Returns true when the line terminated the stream.
    fn parse_line(&mut self, line: &[u8], frames: &mut Vec<Frame>) -> bool {
        let line = match std::str::from_utf8(line) {
            Ok(line) => line.trim_end_matches('\r'),
            Err(_) => {
                log::warn!("Skipping malformed frame: {}", ProtocolError::InvalidUtf8);
                return false;
            }
        };

        let Some(data) = data_field(line) else {
            return false;
        };

        match parse_payload(data) {
            Ok(parsed) => {
                for frame in parsed {
                    let terminal = frame.is_terminal();
                    frames.push(frame);
                    if terminal {
                        self.finished = true;
                        return true;
                    }
                }
                false
            }
            Err(error) => {
                log::warn!("Skipping malformed frame: {}", error);
                false
            }
        }
    }
}

/// The value of a `data:` field, or `None` for blank lines, comments and
/// other fields.
fn data_field(line: &str) -> Option<&str> {
    let value = line.strip_prefix("data:")?;
    let value = value.strip_prefix(' ').unwrap_or(value);
    if value.trim().is_empty() {
        return None;
    }
    Some(value)
}

/// Parse one `data:` payload.
///
/// A JSON object with several of `content`, `citations` and `evaluation`
/// yields one frame per key, in that order.
pub fn parse_payload(data: &str) -> Result<Vec<Frame>, ProtocolError> {
    let data = data.trim();
    if data == DONE_SENTINEL {
        return Ok(vec![Frame::Done]);
    }

    let value: Value =
        serde_json::from_str(data).map_err(|error| ProtocolError::InvalidJson(error.to_string()))?;
    let Value::Object(map) = value else {
        return Err(ProtocolError::UnexpectedShape(
            "payload is not a JSON object".to_string(),
        ));
    };

    if let Some(message) = error_message(&map) {
        return Ok(vec![Frame::Error { message }]);
    }

    if let Some(kind) = map.get("type").and_then(Value::as_str) {
        return parse_typed(kind, &map).map(|frame| vec![frame]);
    }

    // A bad key only drops its own frame; the payload fails when nothing
    // else in it could be used.
    let mut frames = Vec::new();
    let mut rejected = Vec::new();
    if let Some(delta) = accept(content_delta(&map), &mut rejected).flatten() {
        frames.push(Frame::Content { delta });
    }
    if let Some(citations) = map.get("citations") {
        if let Some(citations) = accept(parse_citations(citations), &mut rejected) {
            frames.push(Frame::Citations { citations });
        }
    }
    if let Some(evaluation) = map.get("evaluation") {
        if let Some(evaluation) = accept(parse_evaluation(evaluation), &mut rejected) {
            frames.push(Frame::Evaluation { evaluation });
        }
    }

    if frames.is_empty() {
        if let Some(error) = rejected.into_iter().next() {
            return Err(error);
        }
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        return Err(ProtocolError::UnexpectedShape(format!(
            "no recognised keys in {{{}}}",
            keys.join(", ")
        )));
    }
    for error in rejected {
        log::warn!("Dropping malformed part of frame: {}", error);
    }
    Ok(frames)
}

fn accept<T>(result: Result<T, ProtocolError>, rejected: &mut Vec<ProtocolError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            rejected.push(error);
            None
        }
    }
}

fn parse_typed(kind: &str, map: &Map<String, Value>) -> Result<Frame, ProtocolError> {
    match kind {
        "content" => {
            let delta = map
                .get("content")
                .or_else(|| map.get("delta"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ProtocolError::UnexpectedShape("content frame without text".to_string())
                })?;
            Ok(Frame::content(delta))
        }
        "citations" => {
            let citations = map.get("citations").ok_or_else(|| {
                ProtocolError::UnexpectedShape("citations frame without citations".to_string())
            })?;
            Ok(Frame::Citations {
                citations: parse_citations(citations)?,
            })
        }
        "evaluation" => {
            let evaluation = match map.get("evaluation") {
                Some(evaluation) => evaluation.clone(),
                None => {
                    let mut inline = map.clone();
                    inline.remove("type");
                    Value::Object(inline)
                }
            };
            Ok(Frame::Evaluation {
                evaluation: parse_evaluation(&evaluation)?,
            })
        }
        "error" => {
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("model reported an error");
            Ok(Frame::error(message))
        }
        "done" => Ok(Frame::Done),
        other => Err(ProtocolError::UnexpectedShape(format!(
            "unknown frame type '{other}'"
        ))),
    }
}

fn error_message(map: &Map<String, Value>) -> Option<String> {
    match map.get("error")? {
        Value::String(message) => Some(message.clone()),
        Value::Object(error) => Some(
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("model reported an error")
                .to_string(),
        ),
        Value::Null | Value::Bool(false) => None,
        other => Some(other.to_string()),
    }
}

fn content_delta(map: &Map<String, Value>) -> Result<Option<String>, ProtocolError> {
    match map.get("content") {
        Some(Value::String(delta)) => return Ok(Some(delta.clone())),
        Some(Value::Null) | None => {}
        Some(_) => {
            return Err(ProtocolError::UnexpectedShape(
                "content is not a string".to_string(),
            ))
        }
    }

    // OpenAI-compatible chunk: choices[0].delta.content
    let delta = map
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(delta)
}

fn parse_citations(value: &Value) -> Result<Vec<Citation>, ProtocolError> {
    serde_json::from_value(value.clone())
        .map_err(|error| ProtocolError::UnexpectedShape(format!("invalid citations: {error}")))
}

fn parse_evaluation(value: &Value) -> Result<EvaluationResult, ProtocolError> {
    let evaluation: EvaluationResult = serde_json::from_value(value.clone())
        .map_err(|error| ProtocolError::InvalidEvaluation(error.to_string()))?;
    if !evaluation.has_valid_score() {
        return Err(ProtocolError::InvalidEvaluation(format!(
            "overall score {} is outside 0-100",
            evaluation.overall_score
        )));
    }
    Ok(evaluation)
}

/// Adapt a byte stream into a [`FrameStream`].
///
/// The stream ends after a terminal frame, after the first transport error,
/// or when the byte stream ends (flushing any trailing line).
pub fn frame_stream<S, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut parser = FrameParser::new();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for frame in parser.push(&chunk) {
                        yield Ok(frame);
                    }
                    if parser.is_finished() {
                        return;
                    }
                }
                Err(error) => {
                    yield Err(TransportError::Stream(error.to_string()));
                    return;
                }
            }
        }

        for frame in parser.finish() {
            yield Ok(frame);
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    const SAMPLE: &str = concat!(
        ": keep-alive\n",
        "data: {\"content\":\"Hel\"}\n",
        "\n",
        "event: message\n",
        "data:{\"content\":\"lo \"}\r\n",
        "data: {\"content\":\"wörld\",\"citations\":[{\"page\":3,\"text\":\"q\"}]}\n",
        "data: not json\n",
        "data: {\"evaluation\":{\"overallScore\":87.5}}\n",
        "data: [DONE]\n",
        "data: {\"content\":\"ignored\"}\n",
    );

    fn parse_all(chunks: &[&[u8]]) -> Vec<Frame> {
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(parser.push(chunk));
        }
        frames.extend(parser.finish());
        frames
    }

    fn parse_strs(chunks: &[&str]) -> Vec<Frame> {
        let chunks: Vec<&[u8]> = chunks.iter().map(|chunk| chunk.as_bytes()).collect();
        parse_all(&chunks)
    }

    fn content_of(frames: &[Frame]) -> String {
        frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Content { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn scenario_content_frames_and_done() {
        let frames = parse_strs(&[
            "data: {\"content\":\"Hel\"}\n",
            "data: {\"content\":\"lo\"}\n",
            "data: [DONE]\n",
        ]);

        assert_eq!(
            frames,
            vec![Frame::content("Hel"), Frame::content("lo"), Frame::Done]
        );
    }

    #[test]
    fn sample_stream_parses_in_order_and_stops_at_done() {
        let frames = parse_all(&[SAMPLE.as_bytes()]);

        assert_eq!(frames.len(), 6);
        assert_eq!(content_of(&frames), "Hello wörld");
        assert!(matches!(&frames[3], Frame::Citations { citations } if citations[0].page == 3));
        assert!(matches!(&frames[4], Frame::Evaluation { evaluation } if evaluation.overall_score == 87.5));
        assert_eq!(frames[5], Frame::Done);
    }

    #[test]
    fn every_two_way_split_gives_the_same_frames() {
        let bytes = SAMPLE.as_bytes();
        let expected = parse_all(&[bytes]);

        for split in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(split);
            assert_eq!(parse_all(&[head, tail]), expected, "split at byte {split}");
        }
    }

    #[test]
    fn byte_at_a_time_gives_the_same_frames() {
        let bytes = SAMPLE.as_bytes();
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(parse_all(&chunks), parse_all(&[bytes]));

        for size in 2..9 {
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(parse_all(&chunks), parse_all(&[bytes]), "chunk size {size}");
        }
    }

    #[test]
    fn trailing_line_without_newline_is_flushed() {
        let frames = parse_strs(&["data: {\"content\":\"a\"}\ndata: {\"content\":\"b\"}"]);
        assert_eq!(content_of(&frames), "ab");
    }

    #[test]
    fn error_payload_closes_the_parser() {
        let mut parser = FrameParser::new();
        let frames = parser.push(b"data: {\"error\":{\"message\":\"quota\"}}\ndata: {\"content\":\"x\"}\n");

        assert_eq!(frames, vec![Frame::error("quota")]);
        assert!(parser.is_finished());
        assert!(parser.push(b"data: [DONE]\n").is_empty());
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn payload_accepts_typed_and_openai_shapes() {
        assert_eq!(
            parse_payload(r#"{"type":"content","delta":"x"}"#).unwrap(),
            vec![Frame::content("x")]
        );
        assert_eq!(
            parse_payload(r#"{"choices":[{"delta":{"content":"y"}}]}"#).unwrap(),
            vec![Frame::content("y")]
        );
        assert_eq!(
            parse_payload(r#"{"type":"error","message":"boom"}"#).unwrap(),
            vec![Frame::error("boom")]
        );
        assert_eq!(parse_payload(r#"{"type":"done"}"#).unwrap(), vec![Frame::Done]);
        assert!(matches!(
            &parse_payload(r#"{"type":"evaluation","overallScore":12}"#).unwrap()[0],
            Frame::Evaluation { evaluation } if evaluation.overall_score == 12.0
        ));
    }

    #[test]
    fn malformed_payloads_are_protocol_errors() {
        assert!(matches!(
            parse_payload("{oops"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_payload("[1,2]"),
            Err(ProtocolError::UnexpectedShape(_))
        ));
        assert!(matches!(
            parse_payload(r#"{"unknown":1}"#),
            Err(ProtocolError::UnexpectedShape(_))
        ));
        assert!(matches!(
            parse_payload(r#"{"type":"mystery"}"#),
            Err(ProtocolError::UnexpectedShape(_))
        ));
        assert!(matches!(
            parse_payload(r#"{"evaluation":{"overallScore":250}}"#),
            Err(ProtocolError::InvalidEvaluation(_))
        ));
    }

    #[test]
    fn bad_key_keeps_the_rest_of_the_payload() {
        assert_eq!(
            parse_payload(r#"{"content":"kept","evaluation":{"overallScore":250}}"#).unwrap(),
            vec![Frame::content("kept")]
        );
        assert_eq!(
            parse_payload(r#"{"content":"kept","citations":"not a list"}"#).unwrap(),
            vec![Frame::content("kept")]
        );
        let frames = parse_payload(r#"{"content":7,"citations":[{"page":1,"text":"q"}]}"#).unwrap();
        assert!(matches!(frames.as_slice(), [Frame::Citations { .. }]));
        assert!(matches!(
            parse_payload(r#"{"citations":"not a list"}"#),
            Err(ProtocolError::UnexpectedShape(_))
        ));
    }

    #[test]
    fn invalid_utf8_line_is_skipped() {
        let mut bytes = b"data: \xff\xfe\n".to_vec();
        bytes.extend_from_slice(b"data: {\"content\":\"ok\"}\n");
        assert_eq!(parse_all(&[bytes.as_slice()]), vec![Frame::content("ok")]);
    }

    #[tokio::test]
    async fn frame_stream_reports_transport_errors() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: {\"content\":\"par")),
            Ok(Bytes::from_static(b"tial\"}\n")),
            Err("connection reset".to_string()),
            Ok(Bytes::from_static(b"data: {\"content\":\"never\"}\n")),
        ];

        let items: Vec<_> = frame_stream(stream::iter(chunks)).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(Frame::content("partial")));
        assert!(matches!(&items[1], Err(TransportError::Stream(message)) if message == "connection reset"));
    }

    #[tokio::test]
    async fn frame_stream_ends_after_done() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: [DONE]\n")),
            Ok(Bytes::from_static(b"data: {\"content\":\"late\"}\n")),
        ];

        let items: Vec<_> = frame_stream(stream::iter(chunks)).collect().await;

        assert_eq!(items, vec![Ok(Frame::Done)]);
    }
}
