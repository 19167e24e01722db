//! Chat stream events, decoded once at the network boundary.
//!
//! The backend emits OpenAI-style `chat.completion.chunk` objects with an
//! extra `context` block, plus a bare `{"error": ...}` object when the
//! request fails mid-stream. Everything downstream matches on [`ChatEvent`].

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::models::ContextPatch;

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// First event of an answer: carries retrieval results and the citation
    /// lookup table.
    ContextInit {
        context: ContextPatch,
        role: Option<String>,
        content: Option<String>,
        request_id: Option<String>,
    },
    ContentDelta {
        content: String,
        request_id: Option<String>,
    },
    ContextUpdate {
        context: ContextPatch,
        request_id: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ChatEvent {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ChatEvent::ContextInit { request_id, .. }
            | ChatEvent::ContentDelta { request_id, .. }
            | ChatEvent::ContextUpdate { request_id, .. } => request_id.as_deref(),
            ChatEvent::Error { .. } => None,
        }
    }
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(default)]
    choices: Vec<RawChoice>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Deserialize)]
struct RawChoice {
    #[serde(default)]
    delta: Option<RawDelta>,
    #[serde(default)]
    context: Option<Value>,
}

#[derive(Deserialize)]
struct RawDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// Classifies one decoded NDJSON object. Returns `Ok(None)` for shapes that
/// carry nothing for the reducer, such as a role-only delta or the closing
/// `finish_reason` chunk.
pub fn decode_event(value: Value) -> Result<Option<ChatEvent>> {
    let raw: RawEvent =
        serde_json::from_value(value).context("chat event is not a JSON object")?;

    if let Some(choice) = raw.choices.into_iter().next() {
        let (role, content) = match choice.delta {
            Some(delta) => (delta.role, delta.content),
            None => (None, None),
        };

        if let Some(context) = choice.context.filter(Value::is_object) {
            let context: ContextPatch =
                serde_json::from_value(context).context("malformed chat event context")?;

            if context
                .data_points
                .as_ref()
                .is_some_and(|points| !points.is_empty())
            {
                return Ok(Some(ChatEvent::ContextInit {
                    context,
                    role,
                    content,
                    request_id: raw.request_id,
                }));
            }

            if let Some(content) = content.filter(|c| !c.is_empty()) {
                return Ok(Some(ChatEvent::ContentDelta {
                    content,
                    request_id: raw.request_id,
                }));
            }

            return Ok(Some(ChatEvent::ContextUpdate {
                context,
                request_id: raw.request_id,
            }));
        }

        if let Some(content) = content.filter(|c| !c.is_empty()) {
            return Ok(Some(ChatEvent::ContentDelta {
                content,
                request_id: raw.request_id,
            }));
        }
    }

    if let Some(error) = raw.error.filter(|e| !e.is_null()) {
        let message = match error {
            Value::String(message) => message,
            other => other.to_string(),
        };
        return Ok(Some(ChatEvent::Error { message }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_event_with_data_points_is_context_init() {
        let event = decode_event(json!({
            "choices": [{
                "delta": {"role": "assistant"},
                "context": {
                    "data_points": ["File0| some text"],
                    "citation_lookup": {},
                    "thoughts": "Searched for: x"
                },
                "index": 0
            }],
            "request_id": "req-1"
        }))
        .unwrap()
        .unwrap();

        match event {
            ChatEvent::ContextInit {
                context,
                role,
                content,
                request_id,
            } => {
                assert_eq!(context.data_points.unwrap().len(), 1);
                assert_eq!(role.as_deref(), Some("assistant"));
                assert!(content.is_none());
                assert_eq!(request_id.as_deref(), Some("req-1"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn delta_content_is_content_delta() {
        let event = decode_event(json!({
            "choices": [{"delta": {"content": "Hel"}, "index": 0}]
        }))
        .unwrap();
        assert_eq!(
            event,
            Some(ChatEvent::ContentDelta {
                content: "Hel".to_string(),
                request_id: None
            })
        );
    }

    #[test]
    fn context_without_data_points_is_update() {
        let event = decode_event(json!({
            "choices": [{
                "delta": {"role": "assistant"},
                "context": {"followup_questions": ["What next?"]}
            }]
        }))
        .unwrap()
        .unwrap();

        let ChatEvent::ContextUpdate { context, .. } = event else {
            panic!("expected context update");
        };
        assert_eq!(context.followup_questions, Some(vec!["What next?".to_string()]));
    }

    #[test]
    fn top_level_error_is_error_event() {
        let event = decode_event(json!({"error": "The app encountered an error"}))
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ChatEvent::Error {
                message: "The app encountered an error".to_string()
            }
        );
    }

    #[test]
    fn empty_delta_is_skipped() {
        assert!(decode_event(json!({"choices": [{"delta": {"content": ""}}]}))
            .unwrap()
            .is_none());
        assert!(decode_event(json!({"choices": []})).unwrap().is_none());
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(decode_event(json!([1, 2, 3])).is_err());
    }
}
