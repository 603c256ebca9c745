//! Per-segment synthesis scheduling.
//!
//! The translated text is spread over the speech segments of the timeline in
//! proportion to their durations. Each speech slice is voiced with a speed
//! hint that roughly fits it into its window; silence segments (and speech
//! segments that end up with no text) become locally generated silent parts.
//! Every segment yields exactly one part, and parts are returned in timeline
//! order no matter which finishes first.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{stream, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::config::{Language, VoiceMap};
use crate::error::{Error, Result};
use crate::media::{write_silence, DUB_SAMPLE_RATE};
use crate::providers::{SpeechRequest, SpeechSynthesizer};
use crate::types::{Timeline, TimelineSegment};

/// Slowest playback-rate hint ever sent.
pub const MIN_SPEED: f64 = 0.7;
/// Fastest playback-rate hint ever sent.
pub const MAX_SPEED: f64 = 1.8;
/// Windows shorter than this get a neutral speed.
const MIN_WINDOW_SECS: f64 = 0.1;

/// Guesses how long a piece of text takes to say.
pub trait DurationEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> f64;
}

/// Fixed characters-per-second heuristic. An approximation, not a measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharRateEstimator {
    pub chars_per_second: f64,
}

impl Default for CharRateEstimator {
    fn default() -> Self {
        Self {
            chars_per_second: 15.0,
        }
    }
}

impl DurationEstimator for CharRateEstimator {
    fn estimate(&self, text: &str) -> f64 {
        text.chars().count() as f64 / self.chars_per_second
    }
}

/// What one part is made of.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskWork {
    Speech {
        text: String,
        voice: String,
        language: Language,
        speed: f64,
    },
    Silence {
        duration: f64,
    },
}

/// One unit of synthesis work, bound to one timeline segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisTask {
    pub index: usize,
    pub segment: TimelineSegment,
    pub work: TaskWork,
    pub output: PathBuf,
}

/// Split `text` across `segments`, one entry per segment.
///
/// Speech segments get `Some(slice)` sized `round(duration / total_speech * len)`
/// characters, taken in order; the running offset is clamped to the end of the
/// text so the slices never overlap or overrun. Silence segments get `None`.
pub fn allocate_text(text: &str, segments: &[TimelineSegment]) -> Vec<Option<String>> {
    let chars: Vec<char> = text.chars().collect();
    let total_speech: f64 = segments
        .iter()
        .filter(|s| s.is_speech())
        .map(TimelineSegment::duration)
        .sum();

    let mut offset = 0usize;
    segments
        .iter()
        .map(|segment| {
            if !segment.is_speech() {
                return None;
            }
            let proportion = if total_speech > 0.0 {
                segment.duration() / total_speech
            } else {
                0.0
            };
            let len = (proportion * chars.len() as f64).round() as usize;
            let end = (offset + len).min(chars.len());
            let slice: String = chars[offset..end].iter().collect();
            offset = end;
            Some(slice)
        })
        .collect()
}

/// Playback-rate hint that stretches `estimated` seconds of speech into a
/// `window`-second slot, kept within [`MIN_SPEED`, `MAX_SPEED`].
pub fn playback_speed(estimated: f64, window: f64) -> f64 {
    let raw = if window > MIN_WINDOW_SECS {
        estimated / window
    } else {
        1.0
    };
    if raw.is_nan() {
        return 1.0;
    }
    raw.clamp(MIN_SPEED, MAX_SPEED)
}

/// Plans and runs the synthesis stage.
pub struct SynthesisScheduler {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    estimator: Arc<dyn DurationEstimator>,
    max_concurrency: usize,
    sample_rate: u32,
}

impl SynthesisScheduler {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, max_concurrency: usize) -> Self {
        Self {
            synthesizer,
            estimator: Arc::new(CharRateEstimator::default()),
            max_concurrency: max_concurrency.max(1),
            sample_rate: DUB_SAMPLE_RATE,
        }
    }

    pub fn estimator(mut self, estimator: Arc<dyn DurationEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Build one task per timeline segment. Pure apart from path construction.
    pub fn plan(
        &self,
        text: &str,
        timeline: &Timeline,
        target: Language,
        voices: &VoiceMap,
        dir: &Path,
    ) -> Vec<SynthesisTask> {
        let slices = allocate_text(text, &timeline.segments);
        let speech_ext = self.synthesizer.file_extension();

        timeline
            .segments
            .iter()
            .zip(slices)
            .enumerate()
            .map(|(index, (segment, slice))| {
                let work = match slice.filter(|s| !s.trim().is_empty()) {
                    Some(text) => {
                        let gender = timeline.speakers.gender_of(&segment.speaker);
                        let speed =
                            playback_speed(self.estimator.estimate(&text), segment.duration());
                        TaskWork::Speech {
                            voice: voices.voice_for(target, gender).to_string(),
                            language: target,
                            speed,
                            text,
                        }
                    }
                    None => TaskWork::Silence {
                        duration: segment.duration(),
                    },
                };
                let ext = match work {
                    TaskWork::Speech { .. } => speech_ext,
                    TaskWork::Silence { .. } => "wav",
                };
                SynthesisTask {
                    index,
                    segment: segment.clone(),
                    work,
                    output: dir.join(format!("part_{index:04}.{ext}")),
                }
            })
            .collect()
    }

    /// Run every task, at most `max_concurrency` at a time. The first failure
    /// fails the whole batch. Returns part paths in timeline order.
    pub async fn execute(&self, tasks: &[SynthesisTask]) -> Result<Vec<PathBuf>> {
        let speech = tasks
            .iter()
            .filter(|t| matches!(t.work, TaskWork::Speech { .. }))
            .count();
        info!(
            parts = tasks.len(),
            speech,
            silence = tasks.len() - speech,
            concurrency = self.max_concurrency,
            "synthesizing segments"
        );

        let mut done: Vec<(usize, PathBuf)> = stream::iter(tasks.iter().map(|t| self.run_task(t)))
            .buffer_unordered(self.max_concurrency)
            .try_collect()
            .await?;

        done.sort_by_key(|(index, _)| *index);
        Ok(done.into_iter().map(|(_, path)| path).collect())
    }

    /// Plan and execute in one go.
    pub async fn synthesize(
        &self,
        text: &str,
        timeline: &Timeline,
        target: Language,
        voices: &VoiceMap,
        dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let tasks = self.plan(text, timeline, target, voices, dir);
        self.execute(&tasks).await
    }

    async fn run_task(&self, task: &SynthesisTask) -> Result<(usize, PathBuf)> {
        match &task.work {
            TaskWork::Speech {
                text,
                voice,
                language,
                speed,
            } => {
                let request = SpeechRequest {
                    text: text.clone(),
                    voice: voice.clone(),
                    language: *language,
                    speed: *speed,
                };
                if let Err(e) = self.synthesizer.synthesize(&request, &task.output).await {
                    warn!(index = task.index, error = %e, "segment synthesis failed");
                    return Err(e);
                }
            }
            TaskWork::Silence { duration } => {
                let path = task.output.clone();
                let seconds = *duration;
                let rate = self.sample_rate;
                tokio::task::spawn_blocking(move || write_silence(&path, seconds, rate))
                    .await
                    .map_err(|e| Error::Io(std::io::Error::other(e)))??;
            }
        }
        debug!(index = task.index, path = %task.output.display(), "part ready");
        Ok((task.index, task.output.clone()))
    }
}
