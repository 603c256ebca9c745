use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::types::StageName;

/// All errors that can occur in redub.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{provider}: credential not configured — set {variable}")]
    CredentialMissing {
        provider: &'static str,
        variable: &'static str,
    },

    #[error("{provider} request failed{}: {message}", status_suffix(.status))]
    Transport {
        provider: &'static str,
        status: Option<u16>,
        body: String,
        message: String,
    },

    #[error("{provider} returned a malformed response: {detail}")]
    MalformedResponse {
        provider: &'static str,
        detail: String,
    },

    #[error("{provider} job {job_id} ended with status \"{status}\": {detail}")]
    JobFailed {
        provider: &'static str,
        job_id: String,
        status: String,
        detail: String,
    },

    #[error("job {job_id} did not finish after {attempts} polls at {interval:?} intervals")]
    JobTimeout {
        job_id: String,
        attempts: u32,
        interval: Duration,
    },

    #[error("{command} did not finish within {after:?}")]
    ProcessTimeout { command: String, after: Duration },

    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("file too large: {path} is {size} bytes, limit is {limit}")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("media tool error: {0}")]
    Media(String),

    #[error("audio analysis failed: {0}")]
    Analysis(String),

    #[cfg(feature = "download")]
    #[error("yt-dlp not found — install with: pip install yt-dlp")]
    YtDlpNotFound,

    #[cfg(feature = "download")]
    #[error("download failed: {0}")]
    Download(String),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: StageName,
        #[source]
        source: Box<Error>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Stable classification of an [`Error`], suitable for mapping to
/// user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    CredentialMissing,
    TransportFailure,
    MalformedResponse,
    JobFailed,
    Timeout,
    FileNotFound,
    TooLarge,
    UnsupportedInput,
    MediaFailure,
    AnalysisFailure,
    DownloadFailure,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CredentialMissing { .. } => ErrorKind::CredentialMissing,
            Error::Transport { .. } | Error::Http(_) => ErrorKind::TransportFailure,
            Error::MalformedResponse { .. } | Error::Json(_) => ErrorKind::MalformedResponse,
            Error::JobFailed { .. } => ErrorKind::JobFailed,
            Error::JobTimeout { .. } | Error::ProcessTimeout { .. } => ErrorKind::Timeout,
            Error::FileNotFound { .. } => ErrorKind::FileNotFound,
            Error::TooLarge { .. } => ErrorKind::TooLarge,
            Error::UnsupportedInput(_) => ErrorKind::UnsupportedInput,
            Error::Media(_) | Error::Wav(_) => ErrorKind::MediaFailure,
            #[cfg(feature = "download")]
            Error::YtDlpNotFound | Error::Download(_) => ErrorKind::DownloadFailure,
            Error::Analysis(_) => ErrorKind::AnalysisFailure,
            Error::Stage { source, .. } => source.kind(),
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether retrying the same request could plausibly succeed: network
    /// failures, 5xx and 429 responses, I/O hiccups.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport { status, .. } => status.map_or(true, |s| s >= 500 || s == 429),
            Error::Http(e) => !e.is_decode(),
            Error::Io(_) => true,
            Error::Stage { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Wrap this error with the pipeline stage it occurred in.
    pub(crate) fn in_stage(self, stage: StageName) -> Self {
        match self {
            already @ Error::Stage { .. } => already,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_credential_missing() {
        let e = Error::CredentialMissing {
            provider: "openai",
            variable: "OPENAI_API_KEY",
        };
        assert_eq!(
            e.to_string(),
            "openai: credential not configured — set OPENAI_API_KEY"
        );
    }

    #[test]
    fn test_error_display_transport_with_status() {
        let e = Error::Transport {
            provider: "elevenlabs",
            status: Some(429),
            body: "{\"detail\":\"rate limited\"}".into(),
            message: "too many requests".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("HTTP 429"));
        assert!(msg.contains("too many requests"));
    }

    #[test]
    fn test_error_display_transport_without_status() {
        let e = Error::Transport {
            provider: "hume",
            status: None,
            body: String::new(),
            message: "connection reset".into(),
        };
        assert_eq!(e.to_string(), "hume request failed: connection reset");
    }

    #[test]
    fn test_error_display_job_timeout_names_job() {
        let e = Error::JobTimeout {
            job_id: "dub_123".into(),
            attempts: 60,
            interval: Duration::from_secs(5),
        };
        let msg = e.to_string();
        assert!(msg.contains("dub_123"));
        assert!(msg.contains("60"));
        assert!(msg.contains("5s"));
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            Error::ProcessTimeout {
                command: "ffmpeg".into(),
                after: Duration::from_secs(1)
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            Error::FileNotFound {
                path: PathBuf::from("/tmp/x.mp4")
            }
            .kind(),
            ErrorKind::FileNotFound
        );
        assert_eq!(
            Error::UnsupportedInput("ftp://x".into()).kind(),
            ErrorKind::UnsupportedInput
        );
    }

    #[test]
    fn test_stage_wrapper_keeps_source_kind() {
        let e = Error::CredentialMissing {
            provider: "openai",
            variable: "OPENAI_API_KEY",
        }
        .in_stage(StageName::Synthesize);
        assert_eq!(e.kind(), ErrorKind::CredentialMissing);
        assert!(e.to_string().starts_with("synthesize stage failed"));
    }

    #[test]
    fn test_stage_wrapper_does_not_nest() {
        let e = Error::Media("boom".into())
            .in_stage(StageName::Mux)
            .in_stage(StageName::Download);
        match e {
            Error::Stage { stage, .. } => assert_eq!(stage, StageName::Mux),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_transient_classification() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(Error::from(io_err).is_transient());
        assert!(!Error::MalformedResponse {
            provider: "openai",
            detail: "no text".into()
        }
        .is_transient());
        assert!(!Error::JobFailed {
            provider: "hume",
            job_id: "j".into(),
            status: "FAILED".into(),
            detail: String::new()
        }
        .is_transient());
    }

    #[test]
    fn test_client_errors_are_not_transient() {
        let status = |code| Error::Transport {
            provider: "openai",
            status: Some(code),
            body: String::new(),
            message: String::new(),
        };
        assert!(!status(401).is_transient());
        assert!(!status(404).is_transient());
        assert!(status(429).is_transient());
        assert!(status(503).is_transient());
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<String>("invalid json").unwrap_err();
        let e: Error = json_err.into();
        assert!(matches!(e, Error::Json(_)));
        assert_eq!(e.kind(), ErrorKind::MalformedResponse);
    }
}
