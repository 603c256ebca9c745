use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{http_client, join_url, require_credential, send, stream_to_file, OPENAI};
use crate::config::{Language, ProviderConfig};
use crate::error::Result;

/// One utterance to voice.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: String,
    pub language: Language,
    /// Playback-rate hint; 1.0 is the voice's natural pace.
    pub speed: f64,
}

/// Text-to-speech into an audio file.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Voice `request` into `output`. The file format is implementation defined
    /// but must be decodable by ffmpeg.
    async fn synthesize(&self, request: &SpeechRequest, output: &Path) -> Result<()>;

    /// Extension for files this synthesizer writes.
    fn file_extension(&self) -> &'static str {
        "mp3"
    }
}

/// OpenAI-compatible `/audio/speech` client.
pub struct OpenAiSpeech {
    config: Arc<ProviderConfig>,
}

impl OpenAiSpeech {
    pub fn new(config: Arc<ProviderConfig>) -> Self {
        Self { config }
    }
}

#[derive(Serialize)]
struct SpeechBody<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    speed: f64,
    response_format: &'a str,
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, request: &SpeechRequest, output: &Path) -> Result<()> {
        let key = require_credential(&self.config.openai_api_key, OPENAI, "OPENAI_API_KEY")?;
        debug!(
            voice = %request.voice,
            speed = request.speed,
            chars = request.text.chars().count(),
            path = %output.display(),
            "synthesizing segment"
        );

        let body = SpeechBody {
            model: &self.config.speech_model,
            input: &request.text,
            voice: &request.voice,
            speed: request.speed,
            response_format: "mp3",
        };

        let client = http_client(self.config.speech_timeout)?;
        let http = client
            .post(join_url(&self.config.openai_base_url, "audio/speech"))
            .bearer_auth(key)
            .json(&body);
        let response = send(OPENAI, http, &self.config.secrets()).await?;
        stream_to_file(OPENAI, response, output).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_body_carries_speed_hint() {
        let body = SpeechBody {
            model: "tts-1",
            input: "Привет",
            voice: "echo",
            speed: 1.25,
            response_format: "mp3",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["speed"], 1.25);
        assert_eq!(json["voice"], "echo");
        assert_eq!(json["input"], "Привет");
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_sending_text() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("part.mp3");
        let synth = OpenAiSpeech::new(Arc::new(ProviderConfig::new()));
        let request = SpeechRequest {
            text: "hello".into(),
            voice: "nova".into(),
            language: Language::En,
            speed: 1.0,
        };
        let err = synth.synthesize(&request, &out).await.unwrap_err();
        assert!(matches!(err, Error::CredentialMissing { .. }));
        assert!(!out.exists());
    }
}
