use std::time::Duration;

use anyhow::Result;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::events::ChatEvent;
use crate::models::{AnswerEnvelope, ResponseContext};

pub const DEFAULT_RENDER_DELAY: Duration = Duration::from_millis(33);

#[derive(Clone, Debug)]
pub struct ReducerConfig {
    /// Pause after each content fragment before its snapshot is emitted.
    pub render_delay: Duration,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            render_delay: DEFAULT_RENDER_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub envelope: AnswerEnvelope,
    pub cancelled: bool,
}

/// Folds a chat event stream into one [`AnswerEnvelope`].
#[derive(Clone, Debug, Default)]
pub struct StreamReducer {
    config: ReducerConfig,
}

impl StreamReducer {
    pub fn new(config: ReducerConfig) -> Self {
        Self { config }
    }

    /// Consumes `events` until the source ends or `cancel` fires.
    ///
    /// `on_snapshot` receives an owned copy of the envelope after every
    /// content fragment. Cancellation is checked once per received item and
    /// yields the partial envelope; it takes precedence over an error event
    /// arriving afterwards.
    pub async fn reduce<S, F>(
        &self,
        events: S,
        cancel: &CancellationToken,
        mut on_snapshot: F,
    ) -> Result<StreamOutcome>
    where
        S: Stream<Item = Result<ChatEvent>>,
        F: FnMut(AnswerEnvelope),
    {
        let mut events = std::pin::pin!(events);
        let mut envelope = AnswerEnvelope::default();
        let mut fragments = 0usize;

        while let Some(item) = events.next().await {
            if cancel.is_cancelled() {
                match &item {
                    Ok(ChatEvent::Error { message }) => {
                        tracing::debug!(%message, "ignoring chat error after cancellation");
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "ignoring stream failure after cancellation");
                    }
                    Ok(_) => {}
                }
                return Ok(self.finish(envelope, fragments, true));
            }

            let event = item?;
            if let Some(request_id) = event.request_id() {
                envelope.request_id = Some(request_id.to_string());
            }

            match event {
                ChatEvent::ContextInit {
                    context,
                    role,
                    content,
                    ..
                } => {
                    envelope.context = ResponseContext::from(context);
                    if let Some(role) = role {
                        envelope.role = role;
                    }
                    if let Some(content) = content {
                        envelope.content.push_str(&content);
                    }
                }
                ChatEvent::ContentDelta { content, .. } => {
                    envelope.content.push_str(&content);
                    fragments += 1;
                    if !self.config.render_delay.is_zero() {
                        tokio::time::sleep(self.config.render_delay).await;
                    }
                    on_snapshot(envelope.clone());
                }
                ChatEvent::ContextUpdate { context, .. } => {
                    envelope.context.merge(context);
                }
                ChatEvent::Error { message } => {
                    tracing::warn!(%message, "chat stream reported an error");
                    anyhow::bail!(message);
                }
            }
        }

        let cancelled = cancel.is_cancelled();
        Ok(self.finish(envelope, fragments, cancelled))
    }

    fn finish(
        &self,
        mut envelope: AnswerEnvelope,
        fragments: usize,
        cancelled: bool,
    ) -> StreamOutcome {
        if envelope.request_id.is_none() {
            envelope.request_id = envelope.context.request_id.clone();
        }
        tracing::debug!(
            fragments,
            chars = envelope.content.chars().count(),
            cancelled,
            "chat stream finished"
        );
        StreamOutcome {
            envelope,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CitationMeta, ContextPatch};
    use futures_util::stream;
    use std::collections::HashMap;

    fn instant() -> StreamReducer {
        StreamReducer::new(ReducerConfig {
            render_delay: Duration::ZERO,
        })
    }

    fn delta(text: &str) -> Result<ChatEvent> {
        Ok(ChatEvent::ContentDelta {
            content: text.to_string(),
            request_id: Some("req-9".to_string()),
        })
    }

    fn init() -> Result<ChatEvent> {
        let mut lookup = HashMap::new();
        lookup.insert(
            "File0".to_string(),
            CitationMeta {
                citation: "https://acct/content/docs/a.pdf".to_string(),
                source_path: "docs/a.pdf".to_string(),
                page_number: "2".to_string(),
            },
        );
        Ok(ChatEvent::ContextInit {
            context: ContextPatch {
                data_points: Some(vec!["File0| text".to_string()]),
                citation_lookup: Some(lookup),
                thoughts: Some("Searched for: hello".to_string()),
                ..ContextPatch::default()
            },
            role: Some("assistant".to_string()),
            content: None,
            request_id: Some("req-9".to_string()),
        })
    }

    fn followups() -> Result<ChatEvent> {
        Ok(ChatEvent::ContextUpdate {
            context: ContextPatch {
                followup_questions: Some(vec!["And then?".to_string()]),
                ..ContextPatch::default()
            },
            request_id: None,
        })
    }

    #[tokio::test]
    async fn concatenates_fragments_in_order() {
        let events = stream::iter(vec![
            init(),
            delta("Hel"),
            delta("lo "),
            delta("world"),
            followups(),
        ]);
        let mut snapshots = Vec::new();

        let outcome = instant()
            .reduce(events, &CancellationToken::new(), |s| snapshots.push(s.content))
            .await
            .unwrap();

        assert!(!outcome.cancelled);
        assert_eq!(outcome.envelope.content, "Hello world");
        assert_eq!(snapshots, vec!["Hel", "Hello ", "Hello world"]);
        assert_eq!(outcome.envelope.request_id.as_deref(), Some("req-9"));
        assert_eq!(
            outcome.envelope.context.thoughts.as_deref(),
            Some("Searched for: hello")
        );
        assert_eq!(outcome.envelope.context.citation_lookup.len(), 1);
        assert_eq!(
            outcome.envelope.context.followup_questions,
            Some(vec!["And then?".to_string()])
        );
    }

    #[tokio::test]
    async fn first_event_seeds_role_and_content() {
        let seeded = Ok(ChatEvent::ContextInit {
            context: ContextPatch {
                data_points: Some(vec!["File0| text".to_string()]),
                ..ContextPatch::default()
            },
            role: Some("system".to_string()),
            content: Some("Pre".to_string()),
            request_id: None,
        });
        let events = stream::iter(vec![seeded, delta("fix")]);
        let mut snapshots = Vec::new();

        let outcome = instant()
            .reduce(events, &CancellationToken::new(), |s| snapshots.push(s.content))
            .await
            .unwrap();

        assert_eq!(outcome.envelope.content, "Prefix");
        assert_eq!(outcome.envelope.role, "system");
        assert_eq!(snapshots, vec!["Prefix"]);
    }

    #[tokio::test]
    async fn cancellation_returns_partial_answer() {
        let events = stream::iter(vec![
            delta("one "),
            delta("two "),
            delta("three "),
            delta("four"),
        ]);
        let cancel = CancellationToken::new();
        let mut seen = 0;

        let outcome = instant()
            .reduce(events, &cancel, |_| {
                seen += 1;
                if seen == 2 {
                    cancel.cancel();
                }
            })
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.envelope.content, "one two ");
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn error_event_fails_the_stream() {
        let events = stream::iter(vec![
            delta("partial"),
            Ok(ChatEvent::Error {
                message: "content filtered".to_string(),
            }),
            delta("never"),
        ]);

        let err = instant()
            .reduce(events, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "content filtered");
    }

    #[tokio::test]
    async fn cancellation_suppresses_later_error() {
        let events = stream::iter(vec![
            delta("kept"),
            Ok(ChatEvent::Error {
                message: "late failure".to_string(),
            }),
        ]);
        let cancel = CancellationToken::new();

        let outcome = instant()
            .reduce(events, &cancel, |_| cancel.cancel())
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.envelope.content, "kept");
    }

    #[tokio::test]
    async fn transport_error_propagates() {
        let events = stream::iter(vec![delta("a"), Err(anyhow::anyhow!("connection reset"))]);

        let err = instant()
            .reduce(events, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_wait_for_render_delay() {
        let reducer = StreamReducer::default();
        let events = stream::iter(vec![delta("a"), delta("b"), delta("c")]);
        let started = tokio::time::Instant::now();

        let outcome = reducer
            .reduce(events, &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(outcome.envelope.content, "abc");
        assert!(started.elapsed() >= DEFAULT_RENDER_DELAY * 3);
    }

    #[tokio::test]
    async fn context_update_merges_over_init() {
        let update = Ok(ChatEvent::ContextUpdate {
            context: ContextPatch {
                thoughts: Some("refined".to_string()),
                request_id: Some("ctx-req".to_string()),
                ..ContextPatch::default()
            },
            request_id: None,
        });
        let events = stream::iter(vec![init(), update]);

        let outcome = instant()
            .reduce(events, &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        let context = outcome.envelope.context;
        assert_eq!(context.thoughts.as_deref(), Some("refined"));
        assert_eq!(context.data_points.len(), 1);
        assert_eq!(context.request_id.as_deref(), Some("ctx-req"));
        assert_eq!(outcome.envelope.request_id.as_deref(), Some("req-9"));
    }
}
