use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Language;

/// Whether a stretch of the source audio carries speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Speech,
    Silence,
}

/// A speaker-labelled interval of the source audio, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineSegment {
    pub speaker: String,
    pub start: f64,
    pub end: f64,
    #[serde(rename = "type")]
    pub kind: SegmentKind,
}

impl TimelineSegment {
    pub fn speech(speaker: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            speaker: speaker.into(),
            start,
            end,
            kind: SegmentKind::Speech,
        }
    }

    pub fn silence(start: f64, end: f64) -> Self {
        Self {
            speaker: String::from("silence"),
            start,
            end,
            kind: SegmentKind::Silence,
        }
    }

    /// Length of the interval; never negative.
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn is_speech(&self) -> bool {
        self.kind == SegmentKind::Speech
    }
}

/// Inferred gender of a speaker, used only for voice selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    #[default]
    Unknown,
}

impl Gender {
    /// Lenient parse of whatever an analysis backend reports.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "male" | "m" | "man" => Gender::Male,
            "female" | "f" | "woman" => Gender::Female,
            _ => Gender::Unknown,
        }
    }
}

/// Speaker label → inferred gender.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeakerProfile(pub HashMap<String, Gender>);

impl SpeakerProfile {
    /// Gender for a speaker label; labels missing from the map are `Unknown`.
    pub fn gender_of(&self, speaker: &str) -> Gender {
        self.0.get(speaker).copied().unwrap_or_default()
    }

    pub fn insert(&mut self, speaker: impl Into<String>, gender: Gender) {
        self.0.insert(speaker.into(), gender);
    }
}

/// Output of the timeline segmenter: ordered segments plus speaker genders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub segments: Vec<TimelineSegment>,
    pub speakers: SpeakerProfile,
}

impl Timeline {
    pub fn total_speech_duration(&self) -> f64 {
        self.segments
            .iter()
            .filter(|s| s.is_speech())
            .map(TimelineSegment::duration)
            .sum()
    }

    pub fn duration(&self) -> f64 {
        self.segments.last().map(|s| s.end).unwrap_or(0.0)
    }
}

/// Language reported by the transcription provider, reduced to the pair we dub between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectedLanguage {
    En,
    Ru,
    #[default]
    Unknown,
}

impl DetectedLanguage {
    /// Map a provider language string ("en", "en-US", "english", "rus", ...).
    pub fn from_provider(code: &str) -> Self {
        let lower = code.trim().to_lowercase();
        let primary = lower.split(['-', '_']).next().unwrap_or_default();
        match primary {
            "en" | "eng" | "english" => DetectedLanguage::En,
            "ru" | "rus" | "russian" => DetectedLanguage::Ru,
            _ => DetectedLanguage::Unknown,
        }
    }

    pub fn language(self) -> Option<Language> {
        match self {
            DetectedLanguage::En => Some(Language::En),
            DetectedLanguage::Ru => Some(Language::Ru),
            DetectedLanguage::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub detected_language: DetectedLanguage,
    pub confidence: Option<f32>,
}

/// Translated text at transcript granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationResult {
    pub text: String,
    pub source: Language,
    pub target: Language,
}

/// Named steps of a dubbing run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageName {
    Download,
    AnalyzeAudio,
    Transcribe,
    Translate,
    Synthesize,
    Mux,
}

impl StageName {
    pub fn label(self) -> &'static str {
        match self {
            StageName::Download => "download",
            StageName::AnalyzeAudio => "analyze-audio",
            StageName::Transcribe => "transcribe",
            StageName::Translate => "translate",
            StageName::Synthesize => "synthesize",
            StageName::Mux => "mux",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One attempt at one stage. A record with `error` set and no `completed_at`
/// is terminal-failed; `failed_at` records when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub name: StageName,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl PipelineStage {
    pub fn start(name: StageName) -> Self {
        Self {
            name,
            started_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            error: None,
        }
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.failed_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    pub fn is_running(&self) -> bool {
        self.completed_at.is_none() && self.error.is_none()
    }

    pub fn is_failed(&self) -> bool {
        self.completed_at.is_none() && self.error.is_some()
    }

    /// Wall time spent, if the stage finished successfully.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}
