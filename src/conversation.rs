use chrono::Utc;

use crate::models::{AnswerEnvelope, ChatMessage, ChatTurn, Role};

/// Ordered chat history. Only the last turn can be in flight; completed
/// turns are never modified.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<ChatTurn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        self.turns.last().is_some_and(|turn| turn.streaming)
    }

    /// Request messages for `question`: every completed turn as a
    /// user/assistant pair, then the new question.
    pub fn history_messages(&self, question: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() * 2 + 1);
        for turn in self.turns.iter().filter(|turn| !turn.streaming) {
            messages.push(ChatMessage {
                role: Role::User,
                content: turn.question.clone(),
            });
            messages.push(ChatMessage {
                role: Role::Assistant,
                content: turn.answer.content.clone(),
            });
        }
        messages.push(ChatMessage {
            role: Role::User,
            content: question.to_string(),
        });
        messages
    }

    /// Appends an in-flight turn. Fails if one is already pending, since a
    /// conversation carries one request at a time.
    pub fn begin_turn(&mut self, question: &str) -> anyhow::Result<()> {
        if self.has_pending() {
            anyhow::bail!("a chat request is already in flight");
        }
        self.turns.push(ChatTurn {
            question: question.to_string(),
            answer: AnswerEnvelope::default(),
            asked_at: Utc::now(),
            streaming: true,
        });
        Ok(())
    }

    pub fn update_pending(&mut self, answer: AnswerEnvelope) {
        if let Some(turn) = self.turns.last_mut().filter(|turn| turn.streaming) {
            turn.answer = answer;
        }
    }

    pub fn finish_pending(&mut self, answer: AnswerEnvelope) -> Option<&ChatTurn> {
        let turn = self.turns.last_mut().filter(|turn| turn.streaming)?;
        turn.answer = answer;
        turn.streaming = false;
        Some(&*turn)
    }

    /// Drops the in-flight turn so its question can be asked again.
    pub fn abandon_pending(&mut self) -> Option<ChatTurn> {
        if self.has_pending() {
            self.turns.pop()
        } else {
            None
        }
    }

    /// Closes an interrupted turn: a partial answer is kept as final, a turn
    /// that never received any text is dropped.
    pub fn settle_pending(&mut self) -> Option<&ChatTurn> {
        let partial = self
            .turns
            .last()
            .filter(|turn| turn.streaming)
            .map(|turn| turn.answer.clone())?;
        if partial.content.is_empty() {
            self.turns.pop();
            return None;
        }
        self.finish_pending(partial)
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(text: &str) -> AnswerEnvelope {
        AnswerEnvelope {
            content: text.to_string(),
            ..AnswerEnvelope::default()
        }
    }

    #[test]
    fn history_pairs_completed_turns() {
        let mut conversation = Conversation::new();
        conversation.begin_turn("first?").unwrap();
        conversation.finish_pending(answer("one"));

        let messages = conversation.history_messages("second?");

        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(messages[1].content, "one");
        assert_eq!(messages[2].content, "second?");
    }

    #[test]
    fn pending_turn_is_replaced_in_place() {
        let mut conversation = Conversation::new();
        conversation.begin_turn("q").unwrap();
        conversation.update_pending(answer("par"));
        conversation.update_pending(answer("partial"));

        assert_eq!(conversation.len(), 1);
        assert!(conversation.has_pending());
        assert_eq!(conversation.turns()[0].answer.content, "partial");
        assert!(conversation.begin_turn("another").is_err());

        let turn = conversation.finish_pending(answer("partial answer")).unwrap();
        assert!(!turn.streaming);
        conversation.update_pending(answer("ignored"));
        assert_eq!(conversation.turns()[0].answer.content, "partial answer");
    }

    #[test]
    fn abandoned_turn_can_be_retried() {
        let mut conversation = Conversation::new();
        conversation.begin_turn("flaky?").unwrap();

        let dropped = conversation.abandon_pending().unwrap();
        assert_eq!(dropped.question, "flaky?");
        assert!(conversation.is_empty());
        assert!(conversation.abandon_pending().is_none());
        conversation.begin_turn("flaky?").unwrap();
        assert_eq!(conversation.turns()[0].question, "flaky?");
    }

    #[test]
    fn settling_keeps_partial_answers_only() {
        let mut conversation = Conversation::new();
        conversation.begin_turn("slow?").unwrap();
        conversation.update_pending(answer("half an"));

        let kept = conversation.settle_pending().unwrap();
        assert!(!kept.streaming);
        assert_eq!(kept.answer.content, "half an");

        conversation.begin_turn("silent?").unwrap();
        assert!(conversation.settle_pending().is_none());
        assert_eq!(conversation.len(), 1);
        assert!(!conversation.has_pending());
    }
}
