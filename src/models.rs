use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CitationMeta {
    pub citation: String,
    pub source_path: String,
    pub page_number: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResponseContext {
    #[serde(default)]
    pub thoughts: Option<String>,
    #[serde(default)]
    pub data_points: Vec<String>,
    #[serde(default)]
    pub followup_questions: Option<Vec<String>>,
    #[serde(default)]
    pub citation_lookup: HashMap<String, CitationMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Keys the client does not interpret (`generated_query`, ...), kept so
    /// merges and exports round-trip them.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Keys carried by a context-bearing event. A `None` field leaves the
/// running context untouched.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ContextPatch {
    #[serde(default)]
    pub thoughts: Option<String>,
    #[serde(default)]
    pub data_points: Option<Vec<String>>,
    #[serde(default)]
    pub followup_questions: Option<Vec<String>>,
    #[serde(default)]
    pub citation_lookup: Option<HashMap<String, CitationMeta>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponseContext {
    pub fn merge(&mut self, patch: ContextPatch) {
        if let Some(thoughts) = patch.thoughts {
            self.thoughts = Some(thoughts);
        }
        if let Some(data_points) = patch.data_points {
            self.data_points = data_points;
        }
        if let Some(questions) = patch.followup_questions {
            self.followup_questions = Some(questions);
        }
        if let Some(lookup) = patch.citation_lookup {
            self.citation_lookup = lookup;
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
        if let Some(request_id) = patch.request_id {
            self.request_id = Some(request_id);
        }
        for (key, value) in patch.extra {
            if !value.is_null() {
                self.extra.insert(key, value);
            }
        }
    }
}

impl From<ContextPatch> for ResponseContext {
    fn from(patch: ContextPatch) -> Self {
        let mut context = ResponseContext::default();
        context.merge(patch);
        context
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerEnvelope {
    pub content: String,
    pub role: String,
    pub context: ResponseContext,
    pub request_id: Option<String>,
}

impl Default for AnswerEnvelope {
    fn default() -> Self {
        Self {
            content: String::new(),
            role: Role::Assistant.as_str().to_string(),
            context: ResponseContext::default(),
            request_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub question: String,
    pub answer: AnswerEnvelope,
    pub asked_at: DateTime<Utc>,
    #[serde(default)]
    pub streaming: bool,
}

/// Page number of a resolved citation. Backends send free-form strings, so
/// anything that is not a finite number stays `Unresolved`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PageNumber {
    Number(f64),
    Unresolved,
}

impl PageNumber {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return PageNumber::Unresolved;
        }
        match trimmed.parse::<f64>() {
            Ok(value) if value.is_finite() => PageNumber::Number(value),
            _ => PageNumber::Unresolved,
        }
    }

    pub fn as_number(self) -> Option<f64> {
        match self {
            PageNumber::Number(value) => Some(value),
            PageNumber::Unresolved => None,
        }
    }

    pub fn is_resolved(self) -> bool {
        matches!(self, PageNumber::Number(_))
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageNumber::Number(value) => write!(f, "{value}"),
            PageNumber::Unresolved => f.write_str("NaN"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedCitation {
    pub short_name: String,
    pub index: usize,
    pub source_path: String,
    pub page_number: PageNumber,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Hybrid,
    Vectors,
    Text,
    None,
}

impl RetrievalMode {
    pub fn from_env_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "vectors" => RetrievalMode::Vectors,
            "text" => RetrievalMode::Text,
            "none" => RetrievalMode::None,
            _ => RetrievalMode::Hybrid,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_mode: Option<RetrievalMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_ranker: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggest_followup_questions: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_folders: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_tags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatRequestContext {
    pub overrides: ChatOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub context: ChatRequestContext,
    pub stream: bool,
    #[serde(default)]
    pub session_state: Value,
}

/// One-shot `/chat` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ResponseChoice>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseChoice {
    pub message: ResponseMessage,
    #[serde(default)]
    pub context: ResponseContext,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    /// `null` when the model produced no text, e.g. a content-filter stop.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    Role::Assistant.as_str().to_string()
}

impl ChatResponse {
    pub fn into_envelope(self) -> Option<AnswerEnvelope> {
        let request_id = self.request_id;
        self.choices.into_iter().next().map(|choice| {
            let request_id = request_id.or_else(|| choice.context.request_id.clone());
            AnswerEnvelope {
                content: choice.message.content.unwrap_or_default(),
                role: choice.message.role,
                context: choice.context,
                request_id,
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportRequest {
    pub request_id: String,
    pub question: String,
    pub answer: String,
    pub citations: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopStreamResponse {
    pub status: String,
}
