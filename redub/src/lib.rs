//! Short-video dubbing library — URL in, dubbed video out.
//!
//! **redub** runs the whole pipeline: downloading (via yt-dlp), audio
//! extraction and muxing (via ffmpeg), speaker/silence segmentation,
//! transcription, translation between English and Russian, and per-segment
//! speech synthesis fitted to the original timing.
//!
//! # Quick start
//!
//! ```rust,no_run
//! # #[tokio::main]
//! # async fn main() -> redub::Result<()> {
//! // Credentials come from OPENAI_API_KEY, ELEVENLABS_API_KEY and HUME_API_KEY.
//! let outcome = redub::dub("https://youtu.be/dQw4w9WgXcQ", "dubbed.mp4").await?;
//! println!("{}", outcome.video_path.display());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod download;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod poll;
pub mod providers;
pub mod segmenter;
pub mod synthesis;
pub mod types;
pub mod workspace;

pub use config::{AnalyzerChoice, Direction, DubOptions, Engine, Language, ProviderConfig, VoiceMap};
pub use error::{Error, ErrorKind, Result};
pub use pipeline::{DubOutcome, Pipeline, RunFailure, StageObserver};
pub use types::{
    DetectedLanguage, Gender, PipelineStage, SegmentKind, SpeakerProfile, StageName, Timeline,
    TimelineSegment, TranscriptionResult, TranslationResult,
};

#[cfg(feature = "download")]
use std::path::Path;
#[cfg(feature = "download")]
use std::sync::Arc;

/// Dub a video URL with default options and write the result to `output`.
#[cfg(feature = "download")]
pub async fn dub(url: &str, output: impl AsRef<Path>) -> Result<DubOutcome> {
    dub_with_options(url, output, DubOptions::default()).await
}

/// Dub a video URL with custom options.
///
/// Provider settings are read from the environment. Intermediate files live in
/// a fresh session directory under [`DubOptions::resolve_work_root`], removed
/// when the run ends either way.
#[cfg(feature = "download")]
pub async fn dub_with_options(
    url: &str,
    output: impl AsRef<Path>,
    options: DubOptions,
) -> Result<DubOutcome> {
    let output = output.as_ref();
    let session = workspace::SessionDir::create(&options.resolve_work_root())?;
    let pipeline = Pipeline::from_config(Arc::new(ProviderConfig::from_env()), options);

    let mut outcome = pipeline
        .run(url, session.path(), None)
        .await
        .map_err(|failure| failure.error)?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(&outcome.video_path, output).await?;
    outcome.video_path = output.to_path_buf();
    Ok(outcome)
}
