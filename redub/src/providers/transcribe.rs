use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::multipart::Form;
use serde::Deserialize;
use tracing::info;

use super::{check_artifact, file_part, http_client, join_url, require_credential, send, OPENAI};
use crate::config::{ProviderConfig, DEFAULT_MAX_UPLOAD_BYTES};
use crate::error::{Error, Result};
use crate::types::{DetectedLanguage, TranscriptionResult};

/// Speech-to-text over a whole audio file.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> Result<TranscriptionResult>;
}

/// OpenAI-compatible `/audio/transcriptions` client.
pub struct OpenAiTranscriber {
    config: Arc<ProviderConfig>,
    max_upload_bytes: u64,
}

impl OpenAiTranscriber {
    pub fn new(config: Arc<ProviderConfig>) -> Self {
        Self {
            config,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }
}

#[derive(Deserialize)]
struct VerboseTranscription {
    text: Option<String>,
    language: Option<String>,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
}

#[derive(Deserialize)]
struct VerboseSegment {
    avg_logprob: Option<f64>,
}

/// Turn a `verbose_json` body into a [`TranscriptionResult`].
///
/// Confidence is the mean per-segment probability, when segments carry log-probs.
fn parse_transcription(body: &[u8]) -> Result<TranscriptionResult> {
    let parsed: VerboseTranscription = serde_json::from_slice(body)?;
    let text = parsed.text.ok_or_else(|| Error::MalformedResponse {
        provider: OPENAI,
        detail: "transcription response has no text".into(),
    })?;

    let detected_language = parsed
        .language
        .as_deref()
        .map(DetectedLanguage::from_provider)
        .unwrap_or(DetectedLanguage::Unknown);

    let probs: Vec<f64> = parsed
        .segments
        .iter()
        .filter_map(|s| s.avg_logprob)
        .map(f64::exp)
        .collect();
    let confidence = if probs.is_empty() {
        None
    } else {
        Some((probs.iter().sum::<f64>() / probs.len() as f64) as f32)
    };

    Ok(TranscriptionResult {
        text: text.trim().to_string(),
        detected_language,
        confidence,
    })
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, audio: &Path) -> Result<TranscriptionResult> {
        let key = require_credential(&self.config.openai_api_key, OPENAI, "OPENAI_API_KEY")?;
        let size = check_artifact(audio, self.max_upload_bytes)?;
        info!(path = %audio.display(), bytes = size, model = %self.config.transcription_model, "transcribing");

        let form = Form::new()
            .part("file", file_part(audio).await?)
            .text("model", self.config.transcription_model.clone())
            .text("response_format", "verbose_json");

        let client = http_client(self.config.transcription_timeout)?;
        let request = client
            .post(join_url(&self.config.openai_base_url, "audio/transcriptions"))
            .bearer_auth(key)
            .multipart(form);
        let response = send(OPENAI, request, &self.config.secrets()).await?;
        let body = response.bytes().await?;

        let result = parse_transcription(&body)?;
        info!(
            language = ?result.detected_language,
            chars = result.text.chars().count(),
            "transcription complete"
        );
        Ok(result)
    }
}
