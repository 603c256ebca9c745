use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{http_client, join_url, require_credential, send, OPENAI};
use crate::config::{Language, ProviderConfig};
use crate::error::{Error, Result};
use crate::types::TranslationResult;

/// Text translation between the supported languages.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, source: Language, target: Language)
        -> Result<TranslationResult>;
}

/// OpenAI-compatible chat-completions translator.
pub struct OpenAiTranslator {
    config: Arc<ProviderConfig>,
}

impl OpenAiTranslator {
    pub fn new(config: Arc<ProviderConfig>) -> Self {
        Self { config }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatReply>,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

fn system_prompt(source: Language, target: Language) -> String {
    format!(
        "You translate spoken {} into natural spoken {}. Keep the sentence order \
         and roughly the same length so the result can be voiced over the original \
         timing. Reply with the translation only, no notes or quotes.",
        source.name(),
        target.name()
    )
}

fn build_request<'a>(model: &'a str, prompt: &'a str, text: &'a str) -> ChatRequest<'a> {
    ChatRequest {
        model,
        temperature: 0.3,
        messages: vec![
            ChatMessage {
                role: "system",
                content: prompt,
            },
            ChatMessage {
                role: "user",
                content: text,
            },
        ],
    }
}

fn parse_reply(body: &[u8]) -> Result<String> {
    let parsed: ChatResponse = serde_json::from_slice(body)?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::MalformedResponse {
            provider: OPENAI,
            detail: "translation response has no message content".into(),
        })
}

#[async_trait]
impl Translator for OpenAiTranslator {
    async fn translate(
        &self,
        text: &str,
        source: Language,
        target: Language,
    ) -> Result<TranslationResult> {
        let key = require_credential(&self.config.openai_api_key, OPENAI, "OPENAI_API_KEY")?;

        if text.trim().is_empty() {
            return Ok(TranslationResult {
                text: String::new(),
                source,
                target,
            });
        }

        info!(%source, %target, chars = text.chars().count(), "translating");
        let prompt = system_prompt(source, target);
        let body = build_request(&self.config.translation_model, &prompt, text);

        let client = http_client(self.config.translation_timeout)?;
        let request = client
            .post(join_url(&self.config.openai_base_url, "chat/completions"))
            .bearer_auth(key)
            .json(&body);
        let response = send(OPENAI, request, &self.config.secrets()).await?;
        let translated = parse_reply(&response.bytes().await?)?;

        Ok(TranslationResult {
            text: translated,
            source,
            target,
        })
    }
}
