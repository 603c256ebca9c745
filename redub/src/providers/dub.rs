use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::Form;
use serde::Deserialize;
use tracing::info;

use super::{
    check_artifact, file_part, http_client, join_url, require_credential, send, stream_to_file,
    ELEVENLABS,
};
use crate::config::{Language, ProviderConfig};
use crate::error::{Error, Result};
use crate::poll::{poll_until_terminal, JobState, PollPolicy};

/// Whole-clip dubbing by a provider: media in, dubbed audio out.
#[async_trait]
pub trait Dubber: Send + Sync {
    async fn dub(&self, input: &Path, source: Language, target: Language, output: &Path)
        -> Result<()>;
}

/// Largest file the dubbing endpoint accepts.
const MAX_DUBBING_BYTES: u64 = 100 * 1024 * 1024;

/// ElevenLabs dubbing client: submit, poll, download.
pub struct ElevenLabsDubber {
    config: Arc<ProviderConfig>,
    policy: PollPolicy,
}

impl ElevenLabsDubber {
    pub fn new(config: Arc<ProviderConfig>) -> Self {
        Self {
            config,
            policy: PollPolicy::attempts(Duration::from_secs(5), 60),
        }
    }

    pub fn poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Deserialize)]
struct SubmitResponse {
    dubbing_id: Option<String>,
    expected_duration_sec: Option<f64>,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: Option<String>,
    error: Option<String>,
    #[serde(default)]
    target_languages: Vec<String>,
}

fn parse_submit(body: &[u8]) -> Result<(String, Option<f64>)> {
    let parsed: SubmitResponse = serde_json::from_slice(body)?;
    let id = parsed
        .dubbing_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| Error::MalformedResponse {
            provider: ELEVENLABS,
            detail: "dubbing submission has no dubbing_id".into(),
        })?;
    Ok((id, parsed.expected_duration_sec))
}

/// Map a status body to a job state. A finished job must list the target
/// language, otherwise there is nothing to download.
fn classify_status(body: &[u8], target: Language) -> Result<JobState<()>> {
    let parsed: StatusResponse = serde_json::from_slice(body)?;
    let status = parsed.status.ok_or_else(|| Error::MalformedResponse {
        provider: ELEVENLABS,
        detail: "dubbing status response has no status".into(),
    })?;

    match status.to_lowercase().as_str() {
        "dubbed" => {
            if parsed.target_languages.is_empty()
                || parsed.target_languages.iter().any(|l| l == target.code())
            {
                Ok(JobState::Succeeded(()))
            } else {
                Err(Error::MalformedResponse {
                    provider: ELEVENLABS,
                    detail: format!(
                        "dubbed job lacks target language {target} (has {:?})",
                        parsed.target_languages
                    ),
                })
            }
        }
        "failed" | "error" | "cancelled" | "canceled" => Ok(JobState::Failed {
            detail: parsed.error.unwrap_or_default(),
            status,
        }),
        _ => Ok(JobState::Running(status)),
    }
}

#[async_trait]
impl Dubber for ElevenLabsDubber {
    async fn dub(
        &self,
        input: &Path,
        source: Language,
        target: Language,
        output: &Path,
    ) -> Result<()> {
        let key = require_credential(
            &self.config.elevenlabs_api_key,
            ELEVENLABS,
            "ELEVENLABS_API_KEY",
        )?;
        check_artifact(input, MAX_DUBBING_BYTES)?;

        let secrets = self.config.secrets();
        let secrets = secrets.as_slice();
        let client = &http_client(self.config.dubbing_timeout)?;
        let base = &self.config.elevenlabs_base_url;

        let submit = move || async move {
            let form = Form::new()
                .part("file", file_part(input).await?)
                .text("source_lang", source.code())
                .text("target_lang", target.code())
                .text("num_speakers", "0")
                .text("watermark", "false");
            let request = client
                .post(join_url(base, "v1/dubbing"))
                .header("xi-api-key", key)
                .multipart(form);
            let response = send(ELEVENLABS, request, secrets).await?;
            let (id, expected) = parse_submit(&response.bytes().await?)?;
            info!(job_id = %id, expected_secs = ?expected, "dubbing job accepted");
            Ok::<_, Error>(id)
        };

        let mut dubbing_id = String::new();
        let check = |id: String| {
            dubbing_id.clone_from(&id);
            let request = client
                .get(join_url(base, &format!("v1/dubbing/{id}")))
                .header("xi-api-key", key);
            async move {
                let response = send(ELEVENLABS, request, secrets).await?;
                classify_status(&response.bytes().await?, target)
            }
        };

        poll_until_terminal(ELEVENLABS, submit, check, &self.policy).await?;

        let request = client
            .get(join_url(
                base,
                &format!("v1/dubbing/{dubbing_id}/audio/{}", target.code()),
            ))
            .header("xi-api-key", key);
        let response = send(ELEVENLABS, request, secrets).await?;
        let bytes = stream_to_file(ELEVENLABS, response, output).await?;
        info!(job_id = %dubbing_id, path = %output.display(), bytes, "dubbed audio saved");
        Ok(())
    }
}
