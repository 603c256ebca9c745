use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{DetectedLanguage, Gender};

/// A language the pipeline can dub from or into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Ru,
}

impl Language {
    /// Short code as providers expect it.
    pub fn code(self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Ru => "ru",
        }
    }

    /// Full English name, used in translation prompts.
    pub fn name(self) -> &'static str {
        match self {
            Language::En => "English",
            Language::Ru => "Russian",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Language::En => Language::Ru,
            Language::Ru => Language::En,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "en" | "english" => Ok(Language::En),
            "ru" | "russian" => Ok(Language::Ru),
            other => Err(Error::UnsupportedInput(format!(
                "language \"{other}\" (supported: en, ru)"
            ))),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Which way to translate.
///
/// `Auto` picks the opposite of whatever the transcription provider detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Auto,
    Fixed { source: Language, target: Language },
}

impl Direction {
    pub fn is_auto(self) -> bool {
        matches!(self, Direction::Auto)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        if lower == "auto" {
            return Ok(Direction::Auto);
        }
        let Some((source, target)) = lower.split_once(['-', ':']) else {
            return Err(Error::UnsupportedInput(format!(
                "direction \"{s}\" (expected auto, en-ru or ru-en)"
            )));
        };
        let source = Language::parse(source)?;
        let target = Language::parse(target)?;
        if source == target {
            return Err(Error::UnsupportedInput(format!(
                "direction \"{s}\" translates a language into itself"
            )));
        }
        Ok(Direction::Fixed { source, target })
    }

    /// Resolve to a concrete `(source, target)` pair.
    pub fn resolve(self, detected: DetectedLanguage) -> Result<(Language, Language)> {
        match self {
            Direction::Fixed { source, target } => Ok((source, target)),
            Direction::Auto => match detected.language() {
                Some(source) => Ok((source, source.other())),
                None => Err(Error::UnsupportedInput(
                    "could not detect a supported source language (en or ru)".into(),
                )),
            },
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Auto => f.write_str("auto"),
            Direction::Fixed { source, target } => write!(f, "{source}-{target}"),
        }
    }
}

/// Voice identity per target language and speaker gender.
///
/// Unknown gender always falls back to the female voice of the target language.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceMap {
    voices: HashMap<(Language, Gender), String>,
}

impl Default for VoiceMap {
    fn default() -> Self {
        let mut voices = HashMap::new();
        voices.insert((Language::En, Gender::Male), "onyx".to_string());
        voices.insert((Language::En, Gender::Female), "nova".to_string());
        voices.insert((Language::Ru, Gender::Male), "echo".to_string());
        voices.insert((Language::Ru, Gender::Female), "shimmer".to_string());
        Self { voices }
    }
}

impl VoiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the voice for a language/gender pair. `Gender::Unknown` is
    /// ignored because it always resolves through the female voice.
    pub fn with_voice(mut self, language: Language, gender: Gender, voice: impl Into<String>) -> Self {
        if gender != Gender::Unknown {
            self.voices.insert((language, gender), voice.into());
        }
        self
    }

    pub fn voice_for(&self, language: Language, gender: Gender) -> &str {
        let gender = match gender {
            Gender::Unknown => Gender::Female,
            known => known,
        };
        self.voices
            .get(&(language, gender))
            .map(String::as_str)
            .unwrap_or("alloy")
    }
}

/// How the speech track gets produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Engine {
    /// Segment, transcribe, translate and synthesize per segment.
    #[default]
    Segmented,
    /// Hand the whole clip to the provider's dubbing job.
    Provider,
}

/// Which timeline segmenter backs the analyze-audio stage.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzerChoice {
    /// External analysis command that prints the timeline as JSON.
    Script {
        program: String,
        args: Vec<String>,
        timeout: Duration,
    },
    /// Native client of the Hume batch API.
    Hume,
}

impl Default for AnalyzerChoice {
    fn default() -> Self {
        AnalyzerChoice::Script {
            program: "python3".into(),
            args: vec!["scripts/analyze_audio.py".into()],
            timeout: Duration::from_secs(180),
        }
    }
}

/// Endpoints, credentials and timeouts for the external providers.
///
/// Read-only once built; shared by every run in the process.
#[derive(Clone)]
pub struct ProviderConfig {
    pub openai_api_key: Option<String>,
    pub elevenlabs_api_key: Option<String>,
    pub hume_api_key: Option<String>,
    pub openai_base_url: String,
    pub elevenlabs_base_url: String,
    pub hume_base_url: String,
    pub transcription_model: String,
    pub translation_model: String,
    pub speech_model: String,
    pub transcription_timeout: Duration,
    pub translation_timeout: Duration,
    pub speech_timeout: Duration,
    pub isolation_timeout: Duration,
    pub dubbing_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            elevenlabs_api_key: None,
            hume_api_key: None,
            openai_base_url: "https://api.openai.com/v1".into(),
            elevenlabs_base_url: "https://api.elevenlabs.io".into(),
            hume_base_url: "https://api.hume.ai".into(),
            transcription_model: "whisper-1".into(),
            translation_model: "gpt-4o-mini".into(),
            speech_model: "tts-1".into(),
            transcription_timeout: Duration::from_secs(300),
            translation_timeout: Duration::from_secs(120),
            speech_timeout: Duration::from_secs(120),
            isolation_timeout: Duration::from_secs(300),
            dubbing_timeout: Duration::from_secs(300),
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |k: &Option<String>| if k.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("ProviderConfig")
            .field("openai_api_key", &mask(&self.openai_api_key))
            .field("elevenlabs_api_key", &mask(&self.elevenlabs_api_key))
            .field("hume_api_key", &mask(&self.hume_api_key))
            .field("openai_base_url", &self.openai_base_url)
            .field("elevenlabs_base_url", &self.elevenlabs_base_url)
            .field("hume_base_url", &self.hume_base_url)
            .field("transcription_model", &self.transcription_model)
            .field("translation_model", &self.translation_model)
            .field("speech_model", &self.speech_model)
            .finish_non_exhaustive()
    }
}

impl ProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the process environment.
    ///
    /// Credentials: `OPENAI_API_KEY`, `ELEVENLABS_API_KEY`, `HUME_API_KEY`.
    /// Overrides: `REDUB_OPENAI_BASE_URL`, `REDUB_ELEVENLABS_BASE_URL`,
    /// `REDUB_HUME_BASE_URL`, `REDUB_TRANSCRIPTION_MODEL`,
    /// `REDUB_TRANSLATION_MODEL`, `REDUB_SPEECH_MODEL`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            openai_api_key: get("OPENAI_API_KEY"),
            elevenlabs_api_key: get("ELEVENLABS_API_KEY"),
            hume_api_key: get("HUME_API_KEY"),
            openai_base_url: get("REDUB_OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            elevenlabs_base_url: get("REDUB_ELEVENLABS_BASE_URL")
                .unwrap_or(defaults.elevenlabs_base_url),
            hume_base_url: get("REDUB_HUME_BASE_URL").unwrap_or(defaults.hume_base_url),
            transcription_model: get("REDUB_TRANSCRIPTION_MODEL")
                .unwrap_or(defaults.transcription_model),
            translation_model: get("REDUB_TRANSLATION_MODEL")
                .unwrap_or(defaults.translation_model),
            speech_model: get("REDUB_SPEECH_MODEL").unwrap_or(defaults.speech_model),
            ..defaults
        }
    }

    pub fn openai_api_key(mut self, key: impl Into<String>) -> Self {
        self.openai_api_key = Some(key.into());
        self
    }

    pub fn elevenlabs_api_key(mut self, key: impl Into<String>) -> Self {
        self.elevenlabs_api_key = Some(key.into());
        self
    }

    pub fn hume_api_key(mut self, key: impl Into<String>) -> Self {
        self.hume_api_key = Some(key.into());
        self
    }

    pub fn openai_base_url(mut self, url: impl Into<String>) -> Self {
        self.openai_base_url = url.into();
        self
    }

    pub fn elevenlabs_base_url(mut self, url: impl Into<String>) -> Self {
        self.elevenlabs_base_url = url.into();
        self
    }

    pub fn hume_base_url(mut self, url: impl Into<String>) -> Self {
        self.hume_base_url = url.into();
        self
    }

    /// Every configured secret, for scrubbing diagnostics.
    pub(crate) fn secrets(&self) -> Vec<&str> {
        [
            &self.openai_api_key,
            &self.elevenlabs_api_key,
            &self.hume_api_key,
        ]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .collect()
    }
}

/// Per-run options.
#[derive(Debug, Clone)]
pub struct DubOptions {
    pub direction: Direction,
    pub voices: VoiceMap,
    pub engine: Engine,
    pub analyzer: AnalyzerChoice,
    /// Ceiling on simultaneous synthesis calls.
    pub max_concurrency: usize,
    /// Run the extracted audio through voice isolation before analysis.
    pub isolate_voice: bool,
    /// Largest local file handed to an upload endpoint.
    pub max_upload_bytes: u64,
    pub extract_timeout: Duration,
    pub mux_timeout: Duration,
    pub work_root: Option<PathBuf>,
}

/// OpenAI's transcription upload ceiling.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

impl Default for DubOptions {
    fn default() -> Self {
        Self {
            direction: Direction::Auto,
            voices: VoiceMap::default(),
            engine: Engine::Segmented,
            analyzer: AnalyzerChoice::default(),
            max_concurrency: 4,
            isolate_voice: false,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            extract_timeout: Duration::from_secs(120),
            mux_timeout: Duration::from_secs(300),
            work_root: None,
        }
    }
}

impl DubOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn voices(mut self, voices: VoiceMap) -> Self {
        self.voices = voices;
        self
    }

    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    pub fn analyzer(mut self, analyzer: AnalyzerChoice) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Set the synthesis concurrency ceiling. Must be at least 1.
    pub fn max_concurrency(mut self, n: usize) -> Result<Self> {
        if n == 0 {
            return Err(Error::UnsupportedInput(
                "max_concurrency must be at least 1".into(),
            ));
        }
        self.max_concurrency = n;
        Ok(self)
    }

    pub fn isolate_voice(mut self, enabled: bool) -> Self {
        self.isolate_voice = enabled;
        self
    }

    pub fn max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub fn extract_timeout(mut self, timeout: Duration) -> Self {
        self.extract_timeout = timeout;
        self
    }

    pub fn work_root(mut self, dir: PathBuf) -> Self {
        self.work_root = Some(dir);
        self
    }

    /// Resolve where session directories are created, defaulting to
    /// ~/.cache/redub/sessions.
    pub fn resolve_work_root(&self) -> PathBuf {
        self.work_root.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("redub")
                .join("sessions")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_direction_from_english() {
        let detected = DetectedLanguage::from_provider("en-US");
        let (source, target) = Direction::Auto.resolve(detected).unwrap();
        assert_eq!(source, Language::En);
        assert_eq!(target, Language::Ru);
    }

    #[test]
    fn test_auto_direction_from_russian() {
        let (source, target) = Direction::Auto.resolve(DetectedLanguage::Ru).unwrap();
        assert_eq!((source, target), (Language::Ru, Language::En));
    }

    #[test]
    fn test_auto_direction_unknown_is_unsupported() {
        let err = Direction::Auto.resolve(DetectedLanguage::Unknown).unwrap_err();
        assert!(matches!(err, Error::UnsupportedInput(_)));
    }

    #[test]
    fn test_fixed_direction_ignores_detection() {
        let direction = Direction::parse("ru-en").unwrap();
        let resolved = direction.resolve(DetectedLanguage::En).unwrap();
        assert_eq!(resolved, (Language::Ru, Language::En));
    }

    #[test]
    fn test_direction_parse_rejects_same_language() {
        assert!(Direction::parse("en-en").is_err());
        assert!(Direction::parse("de-en").is_err());
        assert!(Direction::parse("english").is_err());
    }

    #[test]
    fn test_direction_display_round_trip() {
        let d = Direction::parse("EN:RU").unwrap();
        assert_eq!(d.to_string(), "en-ru");
        assert_eq!(Direction::Auto.to_string(), "auto");
    }

    #[test]
    fn test_voice_unknown_gender_defaults_to_female() {
        let voices = VoiceMap::default();
        assert_eq!(
            voices.voice_for(Language::Ru, Gender::Unknown),
            voices.voice_for(Language::Ru, Gender::Female)
        );
        assert_eq!(voices.voice_for(Language::En, Gender::Unknown), "nova");
        assert_eq!(voices.voice_for(Language::En, Gender::Male), "onyx");
    }

    #[test]
    fn test_voice_override() {
        let voices = VoiceMap::new()
            .with_voice(Language::Ru, Gender::Male, "custom-ru-male")
            .with_voice(Language::Ru, Gender::Unknown, "ignored");
        assert_eq!(voices.voice_for(Language::Ru, Gender::Male), "custom-ru-male");
        assert_eq!(voices.voice_for(Language::Ru, Gender::Unknown), "shimmer");
    }

    #[test]
    fn test_provider_config_from_lookup() {
        let config = ProviderConfig::from_lookup(|name| match name {
            "OPENAI_API_KEY" => Some("sk-test".into()),
            "HUME_API_KEY" => Some("   ".into()),
            "REDUB_OPENAI_BASE_URL" => Some("http://localhost:8000/v1".into()),
            _ => None,
        });
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-test"));
        assert!(config.hume_api_key.is_none());
        assert!(config.elevenlabs_api_key.is_none());
        assert_eq!(config.openai_base_url, "http://localhost:8000/v1");
        assert_eq!(config.speech_model, "tts-1");
    }

    #[test]
    fn test_provider_config_debug_hides_keys() {
        let config = ProviderConfig::new().openai_api_key("sk-very-secret");
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-very-secret"));
        assert!(debug.contains("<set>"));
    }

    #[test]
    fn test_max_concurrency_rejects_zero() {
        assert!(DubOptions::new().max_concurrency(0).is_err());
        assert_eq!(DubOptions::new().max_concurrency(8).unwrap().max_concurrency, 8);
    }

    #[test]
    fn test_resolve_work_root_override() {
        let opts = DubOptions::new().work_root(PathBuf::from("/srv/redub"));
        assert_eq!(opts.resolve_work_root(), PathBuf::from("/srv/redub"));
    }
}
