use anyhow::Result;
use futures_util::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::citations::{parse_answer, ParsedAnswer};
use crate::client::CoeusClient;
use crate::config::ClientConfig;
use crate::conversation::Conversation;
use crate::events::ChatEvent;
use crate::models::{
    AnswerEnvelope, ChatOverrides, ChatRequest, ChatRequestContext, ChatTurn, ExportRequest,
};
use crate::reducer::{StreamOutcome, StreamReducer};

/// What the caller shows for an answer: the envelope plus its resolved
/// citation markup.
#[derive(Debug, Clone)]
pub struct RenderedAnswer {
    pub envelope: AnswerEnvelope,
    pub parsed: ParsedAnswer,
    pub streaming: bool,
}

impl RenderedAnswer {
    pub fn new(envelope: AnswerEnvelope, streaming: bool) -> Self {
        let parsed = parse_answer(
            &envelope.content,
            streaming,
            &envelope.context.citation_lookup,
        );
        Self {
            envelope,
            parsed,
            streaming,
        }
    }

    pub fn followup_questions(&self) -> &[String] {
        self.envelope
            .context
            .followup_questions
            .as_deref()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct AskOutcome {
    pub answer: RenderedAnswer,
    pub cancelled: bool,
}

pub struct ChatService {
    client: CoeusClient,
    stream: bool,
    overrides: ChatOverrides,
    reducer: StreamReducer,
    conversation: Conversation,
}

impl ChatService {
    pub fn new(config: &ClientConfig, client: CoeusClient) -> Self {
        Self {
            client,
            stream: config.stream,
            overrides: config.overrides.to_overrides(),
            reducer: StreamReducer::new(config.reducer_config()),
            conversation: Conversation::new(),
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn clear(&mut self) {
        self.conversation.clear();
    }

    pub fn build_request(&self, question: &str) -> ChatRequest {
        ChatRequest {
            messages: self.conversation.history_messages(question),
            context: ChatRequestContext {
                overrides: self.overrides.clone(),
            },
            stream: self.stream,
            session_state: Value::Null,
        }
    }

    /// Asks `question` and records the turn. `on_render` sees every
    /// intermediate answer while streaming.
    ///
    /// On failure the turn is dropped so the same question can be retried.
    /// A cancelled stream keeps its partial answer as the final one; a
    /// request cancelled before the backend answered leaves no turn behind.
    pub async fn ask<F>(
        &mut self,
        question: &str,
        cancel: &CancellationToken,
        on_render: F,
    ) -> Result<AskOutcome>
    where
        F: FnMut(&RenderedAnswer),
    {
        let request = self.build_request(question);
        self.conversation.begin_turn(question)?;

        let result = if self.stream {
            self.ask_streaming(&request, cancel, on_render).await
        } else {
            self.ask_once(&request, cancel).await
        };

        let outcome = match result {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                tracing::debug!("chat request cancelled before the backend answered");
                self.conversation.abandon_pending();
                return Ok(AskOutcome {
                    answer: RenderedAnswer::new(AnswerEnvelope::default(), false),
                    cancelled: true,
                });
            }
            Err(err) => {
                self.conversation.abandon_pending();
                return Err(err.context(format!("chat request failed: {question}")));
            }
        };

        if outcome.cancelled {
            self.stop_server_stream().await;
        }
        Ok(self.record(outcome))
    }

    async fn ask_once(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<StreamOutcome>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            envelope = self.client.chat(request) => Ok(Some(StreamOutcome {
                envelope: envelope?,
                cancelled: false,
            })),
        }
    }

    async fn ask_streaming<F>(
        &mut self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        on_render: F,
    ) -> Result<Option<StreamOutcome>>
    where
        F: FnMut(&RenderedAnswer),
    {
        let events = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            events = self.client.chat_stream(request) => events?,
        };
        self.consume(events, cancel, on_render).await.map(Some)
    }

    /// Closes the in-flight turn after its `ask` future was dropped, keeping
    /// whatever answer text had already arrived.
    pub async fn settle_interrupted(&mut self) {
        if !self.conversation.has_pending() {
            return;
        }
        self.conversation.settle_pending();
        self.stop_server_stream().await;
    }

    async fn stop_server_stream(&self) {
        if let Err(err) = self.client.stop_stream().await {
            tracing::warn!(error = %err, "failed to stop server-side stream");
        }
    }

    fn record(&mut self, outcome: StreamOutcome) -> AskOutcome {
        self.conversation.finish_pending(outcome.envelope.clone());
        AskOutcome {
            answer: RenderedAnswer::new(outcome.envelope, false),
            cancelled: outcome.cancelled,
        }
    }

    /// Reduces `events` into the in-flight turn, re-rendering citations
    /// after each fragment.
    pub async fn consume<S, F>(
        &mut self,
        events: S,
        cancel: &CancellationToken,
        mut on_render: F,
    ) -> Result<StreamOutcome>
    where
        S: Stream<Item = Result<ChatEvent>>,
        F: FnMut(&RenderedAnswer),
    {
        let conversation = &mut self.conversation;
        self.reducer
            .reduce(events, cancel, |snapshot| {
                let rendered = RenderedAnswer::new(snapshot, true);
                on_render(&rendered);
                conversation.update_pending(rendered.envelope);
            })
            .await
    }

    pub fn export_request(&self, turn: &ChatTurn) -> ExportRequest {
        let rendered = RenderedAnswer::new(turn.answer.clone(), false);
        ExportRequest {
            request_id: turn.answer.request_id.clone().unwrap_or_default(),
            question: turn.question.clone(),
            answer: rendered.parsed.markup.clone(),
            citations: rendered.parsed.citation_links_text(),
        }
    }

    pub fn client(&self) -> &CoeusClient {
        &self.client
    }
}
