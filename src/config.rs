use std::env;
use std::time::Duration;

use crate::models::{ChatOverrides, RetrievalMode};
use crate::reducer::ReducerConfig;

#[derive(Clone, Debug)]
pub struct OverrideConfig {
    pub retrieval_mode: RetrievalMode,
    pub semantic_ranker: bool,
    pub top: u32,
    pub response_length: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub suggest_followup_questions: bool,
    pub user_persona: String,
    pub system_persona: String,
    pub selected_folders: String,
    pub selected_tags: String,
    pub prompt_template: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub base_url: String,
    pub stream: bool,
    pub render_delay: Duration,
    pub overrides: OverrideConfig,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env::var("COEUS_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:5000".to_string()),
            stream: env_flag("COEUS_STREAM", true),
            render_delay: Duration::from_millis(env_parse("COEUS_RENDER_DELAY_MS", 33)),
            overrides: OverrideConfig {
                retrieval_mode: env::var("RETRIEVAL_MODE")
                    .map(|v| RetrievalMode::from_env_value(&v))
                    .unwrap_or(RetrievalMode::Hybrid),
                semantic_ranker: env_flag("SEMANTIC_RANKER", true),
                top: env_parse("RETRIEVE_COUNT", 5),
                response_length: env_parse("RESPONSE_LENGTH", 2048),
                temperature: env_parse("RESPONSE_TEMPERATURE", 0.4),
                top_p: env_parse("RESPONSE_TOP_P", 1.0),
                suggest_followup_questions: env_flag("SUGGEST_FOLLOWUP_QUESTIONS", true),
                user_persona: env::var("USER_PERSONA")
                    .unwrap_or_else(|_| "an analyst".to_string()),
                system_persona: env::var("SYSTEM_PERSONA")
                    .unwrap_or_else(|_| "an Assistant".to_string()),
                selected_folders: env::var("SELECTED_FOLDERS")
                    .unwrap_or_else(|_| "All".to_string()),
                selected_tags: env::var("SELECTED_TAGS").unwrap_or_default(),
                prompt_template: env::var("PROMPT_TEMPLATE")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
            },
        }
    }

    pub fn reducer_config(&self) -> ReducerConfig {
        ReducerConfig {
            render_delay: self.render_delay,
        }
    }
}

impl OverrideConfig {
    pub fn to_overrides(&self) -> ChatOverrides {
        ChatOverrides {
            retrieval_mode: Some(self.retrieval_mode),
            semantic_ranker: Some(self.semantic_ranker),
            top: Some(self.top),
            temperature: Some(self.temperature),
            top_p: Some(self.top_p),
            response_length: Some(self.response_length),
            suggest_followup_questions: Some(self.suggest_followup_questions),
            user_persona: Some(self.user_persona.clone()),
            system_persona: Some(self.system_persona.clone()),
            selected_folders: Some(self.selected_folders.clone()),
            selected_tags: Some(self.selected_tags.clone()),
            prompt_template: self.prompt_template.clone(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}
