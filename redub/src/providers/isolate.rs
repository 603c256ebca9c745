use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::multipart::Form;
use tracing::info;

use super::{
    check_artifact, file_part, http_client, join_url, require_credential, send, stream_to_file,
    ELEVENLABS,
};
use crate::config::ProviderConfig;
use crate::error::Result;

/// Strips music and noise, leaving the voice track.
#[async_trait]
pub trait VoiceSeparator: Send + Sync {
    async fn separate(&self, input: &Path, output: &Path) -> Result<()>;
}

/// ElevenLabs audio isolation client.
pub struct ElevenLabsIsolator {
    config: Arc<ProviderConfig>,
    max_upload_bytes: u64,
}

/// Upload ceiling for the isolation endpoint.
const MAX_ISOLATION_BYTES: u64 = 500 * 1024 * 1024;

impl ElevenLabsIsolator {
    pub fn new(config: Arc<ProviderConfig>) -> Self {
        Self {
            config,
            max_upload_bytes: MAX_ISOLATION_BYTES,
        }
    }
}

#[async_trait]
impl VoiceSeparator for ElevenLabsIsolator {
    async fn separate(&self, input: &Path, output: &Path) -> Result<()> {
        let key = require_credential(
            &self.config.elevenlabs_api_key,
            ELEVENLABS,
            "ELEVENLABS_API_KEY",
        )?;
        let size = check_artifact(input, self.max_upload_bytes)?;
        info!(path = %input.display(), bytes = size, "isolating voice track");

        let form = Form::new().part("audio", file_part(input).await?);
        let client = http_client(self.config.isolation_timeout)?;
        let request = client
            .post(join_url(&self.config.elevenlabs_base_url, "v1/audio-isolation"))
            .header("xi-api-key", key)
            .multipart(form);
        let response = send(ELEVENLABS, request, &self.config.secrets()).await?;
        let bytes = stream_to_file(ELEVENLABS, response, output).await?;

        info!(path = %output.display(), bytes, "voice track isolated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_missing_key() {
        let isolator = ElevenLabsIsolator::new(Arc::new(ProviderConfig::new()));
        let err = isolator
            .separate(Path::new("/tmp/in.wav"), Path::new("/tmp/out.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CredentialMissing {
                provider: "elevenlabs",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_input_file() {
        let config = Arc::new(ProviderConfig::new().elevenlabs_api_key("xi-test"));
        let isolator = ElevenLabsIsolator::new(config);
        let err = isolator
            .separate(Path::new("/nonexistent/in.wav"), Path::new("/tmp/out.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound { .. }));
    }
}
