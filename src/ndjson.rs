//! Newline-delimited JSON framing over a chunked byte stream.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::stream::{unfold, Stream, StreamExt};
use serde_json::Value;

use crate::events::{decode_event, ChatEvent};

/// Splits a byte stream into JSON values, one per non-blank line.
///
/// Lines are buffered as raw bytes so a multi-byte character split across
/// chunks is decoded intact. A trailing line without a newline is decoded
/// once the source ends.
pub fn ndjson_values<S, E>(bytes_stream: S) -> impl Stream<Item = Result<Value>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = (Box::pin(bytes_stream), Vec::<u8>::new(), false);

    unfold(state, |(mut stream, mut buffer, mut finished)| async move {
        loop {
            if let Some(line) = take_line(&mut buffer, finished) {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let parsed = parse_line(&line);
                return Some((parsed, (stream, buffer, finished)));
            }

            if finished {
                return None;
            }

            match stream.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    // A broken transport ends the stream after reporting once.
                    buffer.clear();
                    let err = anyhow::Error::new(err).context("chat stream transport failed");
                    return Some((Err(err), (stream, buffer, true)));
                }
                None => finished = true,
            }
        }
    })
}

/// Decodes NDJSON bytes straight into [`ChatEvent`]s, dropping objects that
/// carry nothing for the reducer.
pub fn ndjson_events<S, E>(bytes_stream: S) -> impl Stream<Item = Result<ChatEvent>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    ndjson_values(bytes_stream).filter_map(|value| async move {
        match value.and_then(decode_event) {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                tracing::trace!("skipping chat event without reducer payload");
                None
            }
            Err(err) => Some(Err(err)),
        }
    })
}

fn take_line(buffer: &mut Vec<u8>, finished: bool) -> Option<Vec<u8>> {
    if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop();
        return Some(line);
    }

    if finished && !buffer.is_empty() {
        return Some(std::mem::take(buffer));
    }

    None
}

fn parse_line(line: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(line).context("chat stream line is not valid UTF-8")?;
    serde_json::from_str(text.trim())
        .with_context(|| format!("invalid JSON line in chat stream: {}", truncate_for_log(text)))
}

fn truncate_for_log(text: &str) -> String {
    const MAX_CHARS: usize = 120;
    if text.chars().count() <= MAX_CHARS {
        return text.trim().to_string();
    }
    let head: String = text.chars().take(MAX_CHARS).collect();
    format!("{}...", head.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
        let owned: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        stream::iter(owned)
    }

    #[tokio::test]
    async fn splits_lines_across_chunk_boundaries() {
        let source = chunks(&[b"{\"a\":1}\n{\"b\"", b":2}\n\n", b"{\"c\":3}"]);
        let values: Vec<Value> = ndjson_values(source)
            .map(|v| v.unwrap())
            .collect()
            .await;

        assert_eq!(values, vec![json!({"a": 1}), json!({"b": 2}), json!({"c": 3})]);
    }

    #[tokio::test]
    async fn keeps_multibyte_characters_split_between_chunks() {
        let line = "{\"t\":\"caf\u{e9}\"}\n".as_bytes();
        let split = line.len() - 4;
        let source = chunks(&[&line[..split], &line[split..]]);
        let values: Vec<Value> = ndjson_values(source)
            .map(|v| v.unwrap())
            .collect()
            .await;

        assert_eq!(values, vec![json!({"t": "caf\u{e9}"})]);
    }

    #[tokio::test]
    async fn malformed_line_is_an_error() {
        let source = chunks(&[b"{\"a\":1}\nnot json\n"]);
        let items: Vec<Result<Value>> = ndjson_values(source).collect().await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn transport_error_ends_stream() {
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"{\"a\":1}\n")),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "reset")),
            Ok(Bytes::from_static(b"{\"b\":2}\n")),
        ]);
        let items: Vec<Result<Value>> = ndjson_values(source).collect().await;

        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn events_skip_empty_payloads() {
        let source = chunks(&[
            b"{\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n",
            b"{\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n",
        ]);
        let events: Vec<ChatEvent> = ndjson_events(source)
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(
            events,
            vec![ChatEvent::ContentDelta {
                content: "Hi".to_string(),
                request_id: None
            }]
        );
    }
}
