//! HTTP clients for the external speech and language providers.
//!
//! Each capability is a small async trait so the pipeline can run against
//! test doubles; the concrete clients are stateless apart from a shared
//! [`ProviderConfig`].

pub mod dub;
pub mod isolate;
pub mod speech;
pub mod transcribe;
pub mod translate;

pub use dub::{Dubber, ElevenLabsDubber};
pub use isolate::{ElevenLabsIsolator, VoiceSeparator};
pub use speech::{OpenAiSpeech, SpeechRequest, SpeechSynthesizer};
pub use transcribe::{OpenAiTranscriber, Transcriber};
pub use translate::{OpenAiTranslator, Translator};

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::multipart::Part;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};

/// Longest provider error body kept in an error value.
const MAX_ERROR_BODY_CHARS: usize = 1000;

pub(crate) const OPENAI: &str = "openai";
pub(crate) const ELEVENLABS: &str = "elevenlabs";
pub(crate) const HUME: &str = "hume";

/// Return the credential or fail before any request is built.
pub(crate) fn require_credential<'a>(
    key: &'a Option<String>,
    provider: &'static str,
    variable: &'static str,
) -> Result<&'a str> {
    key.as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or(Error::CredentialMissing { provider, variable })
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(15))
        .build()?)
}

/// Replace every secret with a placeholder and cap the length.
pub(crate) fn redact(text: &str, secrets: &[&str]) -> String {
    let mut out = text.to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        out = out.replace(secret, "[redacted]");
    }
    if out.chars().count() > MAX_ERROR_BODY_CHARS {
        out = out.chars().take(MAX_ERROR_BODY_CHARS).collect();
        out.push('…');
    }
    out
}

/// Send a request, mapping network failures and non-2xx responses to
/// [`Error::Transport`] with the status and body captured.
pub(crate) async fn send(
    provider: &'static str,
    request: reqwest::RequestBuilder,
    secrets: &[&str],
) -> Result<reqwest::Response> {
    let response = request.send().await.map_err(|e| Error::Transport {
        provider,
        status: e.status().map(|s| s.as_u16()),
        body: String::new(),
        message: redact(&e.to_string(), secrets),
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let body = redact(&body, secrets);
    Err(Error::Transport {
        provider,
        status: Some(status.as_u16()),
        message: error_message(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        }),
        body,
    })
}

/// Pull a human-readable message out of the usual JSON error shapes:
/// `{"error":{"message":..}}`, `{"detail":{"message":..}}`, `{"detail":".."}`,
/// `{"message":".."}`.
fn error_message(body: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    let candidates = [
        json.pointer("/error/message"),
        json.pointer("/detail/message"),
        json.get("detail"),
        json.get("message"),
        json.get("error"),
    ];
    let found = candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(str::to_string));
    found
}

/// Stream a response body into a file, returning the bytes written.
pub(crate) async fn stream_to_file(
    provider: &'static str,
    response: reqwest::Response,
    dest: &Path,
) -> Result<u64> {
    save_stream(provider, response.bytes_stream(), dest).await
}

/// Write every chunk of `stream` to `dest`. On an interrupted or empty body
/// the partial file is removed.
async fn save_stream<S, C, E>(provider: &'static str, mut stream: S, dest: &Path) -> Result<u64>
where
    S: futures_util::Stream<Item = std::result::Result<C, E>> + Unpin,
    C: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut file = tokio::fs::File::create(dest).await?;
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                tokio::fs::remove_file(dest).await.ok();
                return Err(Error::Transport {
                    provider,
                    status: None,
                    body: String::new(),
                    message: format!("response body interrupted: {e}"),
                });
            }
        };
        file.write_all(chunk.as_ref()).await?;
        written += chunk.as_ref().len() as u64;
    }
    file.flush().await?;

    if written == 0 {
        tokio::fs::remove_file(dest).await.ok();
        return Err(Error::MalformedResponse {
            provider,
            detail: "response body was empty".into(),
        });
    }

    debug!(provider, path = %dest.display(), bytes = written, "response saved");
    Ok(written)
}

/// Verify a local artifact exists and fits under `limit` bytes before it is
/// handed to the next stage. Returns its size.
pub fn check_artifact(path: &Path, limit: u64) -> Result<u64> {
    let meta = std::fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::FileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            Error::Io(e)
        }
    })?;
    if !meta.is_file() {
        return Err(Error::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let size = meta.len();
    if size > limit {
        return Err(Error::TooLarge {
            path: path.to_path_buf(),
            size,
            limit,
        });
    }
    Ok(size)
}

/// Multipart file part with the file's name and a MIME type guessed from its extension.
pub(crate) async fn file_part(path: &Path) -> Result<Part> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".into());
    Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(guess_mime(path))
        .map_err(Error::Http)
}

pub(crate) fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "wav" | "wave" => "audio/wav",
        "mp3" => "audio/mpeg",
        "m4a" | "aac" => "audio/mp4",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
