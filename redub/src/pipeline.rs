//! Stage orchestration for one dubbing run.
//!
//! Stages run strictly in order. Every transition is recorded as a
//! [`PipelineStage`] and reported to an optional [`StageObserver`]; the first
//! failing stage ends the run and the records collected so far are returned
//! with the error. Nothing is retried or resumed, and the working directory
//! is left for the caller to clean up.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::config::{AnalyzerChoice, DubOptions, Engine, ProviderConfig};
use crate::download::{DownloadedVideo, VideoSource};
use crate::error::{Error, Result};
use crate::media::{Ffmpeg, MediaToolkit};
use crate::providers::{
    Dubber, ElevenLabsDubber, ElevenLabsIsolator, OpenAiSpeech, OpenAiTranscriber,
    OpenAiTranslator, SpeechSynthesizer, Transcriber, Translator, VoiceSeparator,
};
use crate::segmenter::{HumeAnalyzer, ScriptAnalyzer, TimelineAnalyzer};
use crate::synthesis::SynthesisScheduler;
use crate::types::{
    PipelineStage, StageName, Timeline, TranscriptionResult, TranslationResult,
};

pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Receives every stage record after each transition (started, completed,
/// failed). Errors are logged and otherwise ignored.
#[async_trait]
pub trait StageObserver: Send + Sync {
    async fn on_stage(&self, stage: &PipelineStage) -> std::result::Result<(), ObserverError>;
}

/// A finished run.
#[derive(Debug, Clone)]
pub struct DubOutcome {
    /// The dubbed video, inside the working directory.
    pub video_path: PathBuf,
    pub source: DownloadedVideo,
    pub stages: Vec<PipelineStage>,
    /// Absent when the provider engine ran with a fixed direction.
    pub transcription: Option<TranscriptionResult>,
    /// Absent for the provider engine.
    pub translation: Option<TranslationResult>,
}

/// A failed run: the error (wrapped with its stage) and every record up to
/// and including the failed one.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: Error,
    pub stages: Vec<PipelineStage>,
}

impl RunFailure {
    pub fn failed_stage(&self) -> Option<StageName> {
        self.stages.iter().rev().find(|s| s.is_failed()).map(|s| s.name)
    }
}

struct StageRecorder<'a> {
    stages: Vec<PipelineStage>,
    observer: Option<&'a dyn StageObserver>,
}

impl<'a> StageRecorder<'a> {
    fn new(observer: Option<&'a dyn StageObserver>) -> Self {
        Self {
            stages: Vec::new(),
            observer,
        }
    }

    async fn record<T>(&mut self, name: StageName, work: impl Future<Output = Result<T>>) -> Result<T> {
        self.stages.push(PipelineStage::start(name));
        info!(stage = %name, "stage started");
        self.notify().await;

        let result = work.await;
        if let Some(stage) = self.stages.last_mut() {
            match &result {
                Ok(_) => {
                    stage.complete();
                    let elapsed_ms = stage.elapsed().map(|d| d.num_milliseconds()).unwrap_or(0);
                    info!(stage = %name, elapsed_ms, "stage completed");
                }
                Err(e) => {
                    stage.fail(e.to_string());
                    error!(stage = %name, error = %e, "stage failed");
                }
            }
        }
        self.notify().await;

        result.map_err(|e| e.in_stage(name))
    }

    async fn notify(&self) {
        let (Some(observer), Some(stage)) = (self.observer, self.stages.last()) else {
            return;
        };
        if let Err(e) = observer.on_stage(stage).await {
            warn!(stage = %stage.name, error = %e, "stage observer failed");
        }
    }
}

/// The dubbing pipeline with its capabilities wired in.
pub struct Pipeline {
    source: Arc<dyn VideoSource>,
    media: Arc<dyn MediaToolkit>,
    analyzer: Arc<dyn TimelineAnalyzer>,
    separator: Arc<dyn VoiceSeparator>,
    transcriber: Arc<dyn Transcriber>,
    translator: Arc<dyn Translator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    dubber: Arc<dyn Dubber>,
    options: DubOptions,
}

impl Pipeline {
    /// Wire the default provider clients and ffmpeg around `source`.
    pub fn new(source: Arc<dyn VideoSource>, config: Arc<ProviderConfig>, options: DubOptions) -> Self {
        let analyzer: Arc<dyn TimelineAnalyzer> = match &options.analyzer {
            AnalyzerChoice::Script {
                program,
                args,
                timeout,
            } => Arc::new(ScriptAnalyzer::new(program.clone(), args.clone(), *timeout)),
            AnalyzerChoice::Hume => Arc::new(HumeAnalyzer::new(config.clone())),
        };
        let media = Ffmpeg::new()
            .extract_timeout(options.extract_timeout)
            .mux_timeout(options.mux_timeout);
        let transcriber =
            OpenAiTranscriber::new(config.clone()).max_upload_bytes(options.max_upload_bytes);

        Self {
            source,
            media: Arc::new(media),
            analyzer,
            separator: Arc::new(ElevenLabsIsolator::new(config.clone())),
            transcriber: Arc::new(transcriber),
            translator: Arc::new(OpenAiTranslator::new(config.clone())),
            synthesizer: Arc::new(OpenAiSpeech::new(config.clone())),
            dubber: Arc::new(ElevenLabsDubber::new(config)),
            options,
        }
    }

    /// Default wiring with yt-dlp as the video source.
    #[cfg(feature = "download")]
    pub fn from_config(config: Arc<ProviderConfig>, options: DubOptions) -> Self {
        Self::new(Arc::new(crate::download::YtDlpSource::new()), config, options)
    }

    pub fn media(mut self, media: Arc<dyn MediaToolkit>) -> Self {
        self.media = media;
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn TimelineAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn separator(mut self, separator: Arc<dyn VoiceSeparator>) -> Self {
        self.separator = separator;
        self
    }

    pub fn transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = transcriber;
        self
    }

    pub fn translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn dubber(mut self, dubber: Arc<dyn Dubber>) -> Self {
        self.dubber = dubber;
        self
    }

    pub fn options(&self) -> &DubOptions {
        &self.options
    }

    /// Dub the video at `url`, using `work_dir` (which must exist) for every
    /// intermediate file. The dubbed video is written inside `work_dir`.
    pub async fn run(
        &self,
        url: &str,
        work_dir: &Path,
        observer: Option<&dyn StageObserver>,
    ) -> std::result::Result<DubOutcome, RunFailure> {
        let mut recorder = StageRecorder::new(observer);

        if !work_dir.is_dir() {
            return Err(RunFailure {
                error: Error::FileNotFound {
                    path: work_dir.to_path_buf(),
                },
                stages: recorder.stages,
            });
        }

        info!(%url, work_dir = %work_dir.display(), engine = ?self.options.engine, "dubbing run started");
        let result = match self.options.engine {
            Engine::Segmented => self.run_segmented(url, work_dir, &mut recorder).await,
            Engine::Provider => self.run_provider(url, work_dir, &mut recorder).await,
        };

        match result {
            Ok(mut outcome) => {
                info!(path = %outcome.video_path.display(), "dubbing run finished");
                outcome.stages = recorder.stages;
                Ok(outcome)
            }
            Err(error) => Err(RunFailure {
                error,
                stages: recorder.stages,
            }),
        }
    }

    async fn run_segmented(
        &self,
        url: &str,
        work_dir: &Path,
        recorder: &mut StageRecorder<'_>,
    ) -> Result<DubOutcome> {
        let video = recorder
            .record(StageName::Download, self.source.download(url, work_dir))
            .await?;

        let (audio, timeline) = recorder
            .record(StageName::AnalyzeAudio, self.analyze_audio(&video.file_path, work_dir))
            .await?;

        let transcription = recorder
            .record(StageName::Transcribe, self.transcriber.transcribe(&audio))
            .await?;

        let translation = recorder
            .record(StageName::Translate, async {
                let (source, target) = self.options.direction.resolve(transcription.detected_language)?;
                info!(%source, %target, "translation direction resolved");
                self.translator.translate(&transcription.text, source, target).await
            })
            .await?;

        let parts_dir = work_dir.join("parts");
        let parts = recorder
            .record(
                StageName::Synthesize,
                self.synthesize_parts(&translation, &timeline, &parts_dir),
            )
            .await?;

        let dubbed_audio = work_dir.join("dubbed_audio.wav");
        let video_path = dubbed_video_path(work_dir, &video);
        recorder
            .record(StageName::Mux, async {
                self.media.concat_audio(&parts, &dubbed_audio).await?;
                self.media
                    .remux(&video.file_path, &dubbed_audio, &video_path)
                    .await
            })
            .await?;

        Ok(DubOutcome {
            video_path,
            source: video,
            stages: Vec::new(),
            transcription: Some(transcription),
            translation: Some(translation),
        })
    }

    async fn run_provider(
        &self,
        url: &str,
        work_dir: &Path,
        recorder: &mut StageRecorder<'_>,
    ) -> Result<DubOutcome> {
        let video = recorder
            .record(StageName::Download, self.source.download(url, work_dir))
            .await?;

        // An automatic direction needs the spoken language first.
        let transcription = if self.options.direction.is_auto() {
            let audio = work_dir.join("audio.wav");
            let result = recorder
                .record(StageName::Transcribe, async {
                    self.media.extract_audio(&video.file_path, &audio).await?;
                    self.transcriber.transcribe(&audio).await
                })
                .await?;
            Some(result)
        } else {
            None
        };

        let dubbed_audio = work_dir.join("dubbed_audio.mp3");
        recorder
            .record(StageName::Synthesize, async {
                let detected = transcription
                    .as_ref()
                    .map(|t| t.detected_language)
                    .unwrap_or_default();
                let (source, target) = self.options.direction.resolve(detected)?;
                self.dubber
                    .dub(&video.file_path, source, target, &dubbed_audio)
                    .await
            })
            .await?;

        let video_path = dubbed_video_path(work_dir, &video);
        recorder
            .record(
                StageName::Mux,
                self.media.remux(&video.file_path, &dubbed_audio, &video_path),
            )
            .await?;

        Ok(DubOutcome {
            video_path,
            source: video,
            stages: Vec::new(),
            transcription,
            translation: None,
        })
    }

    /// Extract 16 kHz audio, optionally strip everything but the voice, and
    /// segment it. Returns the analysed WAV alongside its timeline.
    async fn analyze_audio(&self, video: &Path, work_dir: &Path) -> Result<(PathBuf, Timeline)> {
        let audio = work_dir.join("audio.wav");
        self.media.extract_audio(video, &audio).await?;

        let audio = if self.options.isolate_voice {
            let isolated = work_dir.join("voice_isolated.mp3");
            self.separator.separate(&audio, &isolated).await?;
            let voice = work_dir.join("voice.wav");
            self.media.extract_audio(&isolated, &voice).await?;
            voice
        } else {
            audio
        };

        let timeline = self.analyzer.analyze(&audio).await?;
        info!(
            segments = timeline.segments.len(),
            speech_secs = timeline.total_speech_duration(),
            "timeline ready"
        );
        Ok((audio, timeline))
    }

    async fn synthesize_parts(
        &self,
        translation: &TranslationResult,
        timeline: &Timeline,
        dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir).await?;
        SynthesisScheduler::new(self.synthesizer.clone(), self.options.max_concurrency)
            .synthesize(
                &translation.text,
                timeline,
                translation.target,
                &self.options.voices,
                dir,
            )
            .await
    }
}

fn dubbed_video_path(work_dir: &Path, video: &DownloadedVideo) -> PathBuf {
    let stem = if video.video_id.is_empty() {
        "video"
    } else {
        video.video_id.as_str()
    };
    work_dir.join(format!("{stem}_dubbed.mp4"))
}
