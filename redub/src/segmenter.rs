//! Speaker/activity timeline of the source audio, from an external analyzer.
//!
//! The analysis itself is opaque; this module only runs it and turns its
//! output into a [`Timeline`]. There is no fallback segmentation: any
//! analyzer error fails the run.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::Form;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::media::wav_duration;
use crate::poll::{poll_until_terminal, JobState, PollPolicy};
use crate::providers::{file_part, http_client, join_url, require_credential, send, HUME};
use crate::types::{Gender, SegmentKind, SpeakerProfile, Timeline, TimelineSegment};

/// Gaps shorter than this between speech segments are absorbed rather than
/// turned into their own silence segment.
const MIN_GAP_SECS: f64 = 0.05;

/// Produces a [`Timeline`] for a 16 kHz mono WAV file.
#[async_trait]
pub trait TimelineAnalyzer: Send + Sync {
    async fn analyze(&self, audio: &Path) -> Result<Timeline>;
}

#[derive(Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    speakers: HashMap<String, RawSpeaker>,
    #[serde(default)]
    segments: Vec<RawSegment>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct RawSpeaker {
    gender: Option<String>,
}

#[derive(Deserialize)]
struct RawSegment {
    speaker: Option<String>,
    start: f64,
    end: f64,
    #[serde(rename = "type", default = "default_kind")]
    kind: SegmentKind,
}

fn default_kind() -> SegmentKind {
    SegmentKind::Speech
}

/// Parse the analyzer's JSON document.
///
/// Shape: `{"speakers": {label: {"gender": ..}}, "segments": [{speaker, start, end, type}], "error"?}`.
/// A non-empty `error` is a hard failure, as is an empty segment list.
pub fn parse_analysis(stdout: &[u8]) -> Result<Timeline> {
    let raw: RawAnalysis = serde_json::from_slice(stdout)
        .map_err(|e| Error::Analysis(format!("unreadable analysis output: {e}")))?;

    if let Some(error) = raw.error.filter(|e| !e.trim().is_empty()) {
        return Err(Error::Analysis(error));
    }
    if raw.segments.is_empty() {
        return Err(Error::Analysis("analysis returned no segments".into()));
    }

    let mut speakers = SpeakerProfile::default();
    for (label, info) in raw.speakers {
        let gender = info.gender.as_deref().map(Gender::parse).unwrap_or_default();
        speakers.insert(label, gender);
    }

    let segments = raw
        .segments
        .into_iter()
        .map(|s| TimelineSegment {
            speaker: s.speaker.unwrap_or_else(|| "unknown".into()),
            start: s.start,
            end: s.end,
            kind: s.kind,
        })
        .collect();

    Ok(Timeline { segments, speakers })
}

/// Runs an external analysis command (`program args... <wav>`) and parses
/// the JSON it prints on stdout.
#[derive(Debug, Clone)]
pub struct ScriptAnalyzer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ScriptAnalyzer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl TimelineAnalyzer for ScriptAnalyzer {
    async fn analyze(&self, audio: &Path) -> Result<Timeline> {
        info!(program = %self.program, audio = %audio.display(), "running audio analysis");

        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(audio)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::Analysis(format!("analysis program not found: {}", self.program))
                } else {
                    Error::Analysis(format!("failed to start {}: {e}", self.program))
                }
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::ProcessTimeout {
                command: self.program.clone(),
                after: self.timeout,
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(1000).collect();
            return Err(Error::Analysis(format!(
                "{} exited with {}: {stderr}",
                self.program, output.status
            )));
        }

        let mut timeline = parse_analysis(&output.stdout)?;
        timeline.segments = normalize_segments(timeline.segments, wav_duration(audio).ok());
        info!(
            segments = timeline.segments.len(),
            speakers = timeline.speakers.0.len(),
            "audio analysis complete"
        );
        Ok(timeline)
    }
}

/// Native client for the Hume batch API with speaker identification.
pub struct HumeAnalyzer {
    config: Arc<ProviderConfig>,
    policy: PollPolicy,
}

impl HumeAnalyzer {
    pub fn new(config: Arc<ProviderConfig>) -> Self {
        Self {
            config,
            policy: PollPolicy::wall_clock(Duration::from_secs(5), Duration::from_secs(10 * 60)),
        }
    }

    pub fn poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }
}

fn classify_hume(job: Value) -> Result<JobState<Value>> {
    let status = job
        .pointer("/state/status")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedResponse {
            provider: HUME,
            detail: "job has no state.status".into(),
        })?
        .to_string();

    match status.as_str() {
        "COMPLETED" => Ok(JobState::Succeeded(job)),
        "FAILED" | "CANCELED" | "CANCELLED" => Ok(JobState::Failed {
            detail: job
                .pointer("/state/message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status,
        }),
        _ => Ok(JobState::Running(status)),
    }
}

/// Collect every `grouped_predictions` entry in a Hume document, wherever it
/// is nested (job state results or the predictions endpoint).
fn grouped_predictions(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                if key == "grouped_predictions" {
                    if let Value::Array(groups) = val {
                        out.extend(groups.iter().cloned());
                        continue;
                    }
                }
                grouped_predictions(val, out);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| grouped_predictions(v, out)),
        _ => {}
    }
}

/// Speech segments and speaker genders from Hume prosody predictions, sorted by start.
fn extract_hume(document: &Value) -> (Vec<TimelineSegment>, SpeakerProfile) {
    let mut groups = Vec::new();
    grouped_predictions(document, &mut groups);

    let mut speakers = SpeakerProfile::default();
    let mut segments = Vec::new();

    for group in &groups {
        let speaker = group
            .get("speaker")
            .or_else(|| group.get("id"))
            .or_else(|| group.pointer("/track/id"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown")
            .to_string();

        let gender = group
            .pointer("/speaker_info/gender")
            .or_else(|| group.pointer("/speaker_info/sex"))
            .and_then(Value::as_str)
            .map(Gender::parse)
            .unwrap_or_default();
        if !speakers.0.contains_key(&speaker) || gender != Gender::Unknown {
            speakers.insert(speaker.clone(), gender);
        }

        let chunks = group
            .get("predictions")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for chunk in chunks {
            let start = chunk
                .pointer("/time/start")
                .or_else(|| chunk.pointer("/time/begin"))
                .and_then(Value::as_f64);
            let end = chunk.pointer("/time/end").and_then(Value::as_f64);
            if let (Some(start), Some(end)) = (start, end) {
                segments.push(TimelineSegment::speech(speaker.clone(), round_ms(start), round_ms(end)));
            }
        }
    }

    segments.sort_by(|a, b| a.start.total_cmp(&b.start));
    (segments, speakers)
}

fn round_ms(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

/// Make a speech-only segment list contiguous: overlaps are clipped, gaps
/// become silence, and when the audio length is known the timeline is
/// extended to cover it.
fn fill_gaps(speech: Vec<TimelineSegment>, total: Option<f64>) -> Vec<TimelineSegment> {
    let mut out = Vec::with_capacity(speech.len() * 2 + 1);
    let mut cursor = 0.0_f64;

    for mut seg in speech {
        if seg.start < cursor {
            seg.start = cursor;
        }
        if seg.end <= seg.start {
            continue;
        }
        if seg.start - cursor >= MIN_GAP_SECS {
            out.push(TimelineSegment::silence(cursor, seg.start));
        } else {
            seg.start = cursor;
        }
        cursor = seg.end;
        out.push(seg);
    }

    if let Some(total) = total {
        if total - cursor >= MIN_GAP_SECS {
            out.push(TimelineSegment::silence(cursor, total));
        }
    }
    out
}

/// Rebuild a contiguous timeline from the speech segments of an analyzer's
/// output, ordered by start. Analyzers may report speech only, out of order
/// or overlapping; silence is regenerated from the gaps.
fn normalize_segments(segments: Vec<TimelineSegment>, total: Option<f64>) -> Vec<TimelineSegment> {
    let mut speech: Vec<TimelineSegment> = segments
        .into_iter()
        .filter(|s| s.kind == SegmentKind::Speech)
        .collect();
    speech.sort_by(|a, b| a.start.total_cmp(&b.start));
    fill_gaps(speech, total)
}

/// Decode a Hume response body. A body that is not JSON is a hard failure.
fn hume_json(body: &[u8]) -> Result<Value> {
    serde_json::from_slice(body).map_err(|e| Error::MalformedResponse {
        provider: HUME,
        detail: format!("response is not JSON: {e}"),
    })
}

#[async_trait]
impl TimelineAnalyzer for HumeAnalyzer {
    async fn analyze(&self, audio: &Path) -> Result<Timeline> {
        let key = require_credential(&self.config.hume_api_key, HUME, "HUME_API_KEY")?;
        if !audio.exists() {
            return Err(Error::FileNotFound {
                path: audio.to_path_buf(),
            });
        }

        let secrets = self.config.secrets();
        let secrets = secrets.as_slice();
        let client = &http_client(Duration::from_secs(60))?;
        let jobs_url = &join_url(&self.config.hume_base_url, "v0/batch/jobs");

        let submit = move || async move {
            let payload = json!({ "models": { "prosody": { "identify_speakers": true } } });
            let form = Form::new()
                .text("json", payload.to_string())
                .part("file", file_part(audio).await?);
            let request = client
                .post(jobs_url)
                .header("X-Hume-Api-Key", key)
                .multipart(form);
            let response = send(HUME, request, secrets).await?;
            let body = hume_json(&response.bytes().await?)?;
            body.get("job_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::MalformedResponse {
                    provider: HUME,
                    detail: "job submission has no job_id".into(),
                })
        };

        let mut job_id = String::new();
        let check = |id: String| {
            let request = client
                .get(format!("{jobs_url}/{id}"))
                .header("X-Hume-Api-Key", key);
            job_id = id;
            async move {
                let response = send(HUME, request, secrets).await?;
                classify_hume(hume_json(&response.bytes().await?)?)
            }
        };

        let job = poll_until_terminal(HUME, submit, check, &self.policy).await?;

        let (mut speech, mut speakers) = extract_hume(&job);
        if speech.is_empty() {
            debug!(%job_id, "job state carries no predictions, fetching them");
            let request = client
                .get(format!("{jobs_url}/{job_id}/predictions"))
                .header("X-Hume-Api-Key", key);
            let predictions = hume_json(&send(HUME, request, secrets).await?.bytes().await?)?;
            (speech, speakers) = extract_hume(&predictions);
        }
        if speech.is_empty() {
            return Err(Error::MalformedResponse {
                provider: HUME,
                detail: format!("job {job_id} produced no speech segments"),
            });
        }

        let total = wav_duration(audio).ok();
        let segments = fill_gaps(speech, total);
        info!(segments = segments.len(), speakers = speakers.0.len(), "audio analysis complete");
        Ok(Timeline { segments, speakers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_analysis_script_output() {
        let stdout = br#"{
            "speakers": {"SPEAKER_00": {"gender": "male"}, "SPEAKER_01": {"gender": "female"}},
            "segments": [
                {"speaker": "SPEAKER_00", "start": 0.0, "end": 2.1, "type": "speech", "emotions": null},
                {"speaker": "SPEAKER_00", "start": 2.1, "end": 3.0, "type": "silence"},
                {"speaker": "SPEAKER_01", "start": 3.0, "end": 5.5}
            ],
            "debug": {"jobId": "abc"}
        }"#;
        let timeline = parse_analysis(stdout).unwrap();
        assert_eq!(timeline.segments.len(), 3);
        assert_eq!(timeline.segments[1].kind, SegmentKind::Silence);
        assert_eq!(timeline.segments[2].kind, SegmentKind::Speech);
        assert_eq!(timeline.speakers.gender_of("SPEAKER_00"), Gender::Male);
        assert_eq!(timeline.speakers.gender_of("SPEAKER_01"), Gender::Female);
    }

    #[test]
    fn test_parse_analysis_error_field_is_fatal() {
        let stdout = br#"{"speakers": {}, "segments": [], "error": "Missing required environment variable: HUME_API_KEY"}"#;
        match parse_analysis(stdout).unwrap_err() {
            Error::Analysis(msg) => assert!(msg.contains("HUME_API_KEY")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_analysis_empty_segments_is_fatal() {
        assert!(matches!(
            parse_analysis(br#"{"speakers": {}, "segments": []}"#),
            Err(Error::Analysis(_))
        ));
    }

    #[test]
    fn test_parse_analysis_garbage_is_fatal() {
        assert!(matches!(
            parse_analysis(b"Traceback (most recent call last):"),
            Err(Error::Analysis(_))
        ));
    }

    #[test]
    fn test_classify_hume_states() {
        let running = classify_hume(json!({"state": {"status": "IN_PROGRESS"}})).unwrap();
        assert!(matches!(running, JobState::Running(s) if s == "IN_PROGRESS"));

        let done = classify_hume(json!({"state": {"status": "COMPLETED"}})).unwrap();
        assert!(matches!(done, JobState::Succeeded(_)));

        let failed = classify_hume(json!({"state": {"status": "FAILED", "message": "bad file"}}))
            .unwrap();
        assert!(matches!(failed, JobState::Failed { detail, .. } if detail == "bad file"));

        assert!(classify_hume(json!({"job_id": "x"})).is_err());
    }

    #[test]
    fn test_extract_hume_from_job_state() {
        let job = json!({
            "state": {
                "status": "COMPLETED",
                "results": [{
                    "models": {"prosody": {"grouped_predictions": [
                        {
                            "speaker": "spk_1",
                            "speaker_info": {"gender": "female"},
                            "predictions": [
                                {"time": {"start": 3.0, "end": 4.5}},
                                {"time": {"start": 0.25, "end": 1.0}},
                                {"time": {"start": 5.0}}
                            ]
                        },
                        {
                            "track": {"id": "spk_2"},
                            "speaker_info": {"sex": "male"},
                            "predictions": [{"time": {"start": 1.2, "end": 2.8}}]
                        }
                    ]}}
                }]
            }
        });
        let (segments, speakers) = extract_hume(&job);
        let starts: Vec<f64> = segments.iter().map(|s| s.start).collect();
        assert_eq!(starts, [0.25, 1.2, 3.0]);
        assert_eq!(speakers.gender_of("spk_1"), Gender::Female);
        assert_eq!(speakers.gender_of("spk_2"), Gender::Male);
    }

    #[test]
    fn test_extract_hume_predictions_endpoint_shape() {
        let predictions = json!([{
            "results": {"predictions": [{
                "models": {"prosody": {"grouped_predictions": [
                    {"id": "speaker_0", "predictions": [{"time": {"begin": 0.0, "end": 1.5}}]}
                ]}}
            }]}
        }]);
        let (segments, speakers) = extract_hume(&predictions);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].speaker, "speaker_0");
        assert_eq!(speakers.gender_of("speaker_0"), Gender::Unknown);
    }

    #[test]
    fn test_fill_gaps_covers_whole_clip() {
        let speech = vec![
            TimelineSegment::speech("A", 0.5, 2.0),
            TimelineSegment::speech("A", 2.02, 3.0),
            TimelineSegment::speech("B", 4.0, 6.0),
        ];
        let filled = fill_gaps(speech, Some(7.0));
        let shape: Vec<(SegmentKind, f64, f64)> =
            filled.iter().map(|s| (s.kind, s.start, s.end)).collect();
        assert_eq!(
            shape,
            [
                (SegmentKind::Silence, 0.0, 0.5),
                (SegmentKind::Speech, 0.5, 2.0),
                (SegmentKind::Speech, 2.0, 3.0),
                (SegmentKind::Silence, 3.0, 4.0),
                (SegmentKind::Speech, 4.0, 6.0),
                (SegmentKind::Silence, 6.0, 7.0),
            ]
        );
    }

    #[test]
    fn test_fill_gaps_clips_overlaps() {
        let speech = vec![
            TimelineSegment::speech("A", 0.0, 3.0),
            TimelineSegment::speech("B", 2.0, 4.0),
            TimelineSegment::speech("C", 2.5, 2.9),
        ];
        let filled = fill_gaps(speech, None);
        assert_eq!(filled.len(), 2);
        assert_eq!((filled[1].start, filled[1].end), (3.0, 4.0));
    }

    #[test]
    fn test_hume_non_json_body_is_malformed() {
        let err = hume_json(b"<html>oops</html>").unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { provider: "hume", .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hume_non_json_status_fails_without_retry() {
        let policy = PollPolicy::wall_clock(Duration::from_secs(5), Duration::from_secs(600));
        let mut checks = 0;
        let err = poll_until_terminal(
            HUME,
            || async { Ok("job-1".to_string()) },
            |_id: String| {
                checks += 1;
                async { classify_hume(hume_json(b"<html>oops</html>")?) }
            },
            &policy,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { .. }));
        assert_eq!(checks, 1);
    }

    #[test]
    fn test_normalize_speech_only_output() {
        let segments = vec![
            TimelineSegment::speech("B", 6.0, 8.0),
            TimelineSegment::speech("A", 1.0, 3.0),
        ];
        let normalized = normalize_segments(segments, Some(10.0));
        let shape: Vec<(SegmentKind, f64, f64)> =
            normalized.iter().map(|s| (s.kind, s.start, s.end)).collect();
        assert_eq!(
            shape,
            [
                (SegmentKind::Silence, 0.0, 1.0),
                (SegmentKind::Speech, 1.0, 3.0),
                (SegmentKind::Silence, 3.0, 6.0),
                (SegmentKind::Speech, 6.0, 8.0),
                (SegmentKind::Silence, 8.0, 10.0),
            ]
        );
    }

    #[test]
    fn test_normalize_regenerates_reported_silence() {
        let segments = vec![
            TimelineSegment::speech("A", 0.0, 2.0),
            TimelineSegment::silence(2.0, 3.0),
            TimelineSegment::speech("B", 2.5, 4.0),
        ];
        let normalized = normalize_segments(segments, None);
        let shape: Vec<(SegmentKind, f64, f64)> =
            normalized.iter().map(|s| (s.kind, s.start, s.end)).collect();
        assert_eq!(
            shape,
            [
                (SegmentKind::Speech, 0.0, 2.0),
                (SegmentKind::Silence, 2.0, 2.5),
                (SegmentKind::Speech, 2.5, 4.0),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_analyzer_covers_whole_clip() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("audio.wav");
        crate::media::write_silence(&audio, 10.0, 16_000).unwrap();

        let analyzer = ScriptAnalyzer::new(
            "sh",
            vec![
                "-c".into(),
                r#"echo '{"speakers":{},"segments":[{"speaker":"A","start":1,"end":3},{"speaker":"A","start":6,"end":8}]}'"#.into(),
                "analyzer".into(),
            ],
            Duration::from_secs(10),
        );
        let timeline = analyzer.analyze(&audio).await.unwrap();
        assert_eq!(timeline.segments.len(), 5);
        assert_eq!(timeline.segments[0].start, 0.0);
        for pair in timeline.segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert!((timeline.segments[4].end - 10.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_script_analyzer_missing_program() {
        let analyzer = ScriptAnalyzer::new(
            "/nonexistent/analyzer",
            vec![],
            Duration::from_secs(5),
        );
        let err = analyzer.analyze(Path::new("/tmp/a.wav")).await.unwrap_err();
        assert!(matches!(err, Error::Analysis(msg) if msg.contains("not found")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_analyzer_reads_stdout() {
        let analyzer = ScriptAnalyzer::new(
            "sh",
            vec![
                "-c".into(),
                r#"echo '{"speakers":{"A":{"gender":"female"}},"segments":[{"speaker":"A","start":0,"end":1,"type":"speech"}]}'"#.into(),
                "analyzer".into(),
            ],
            Duration::from_secs(10),
        );
        let timeline = analyzer.analyze(Path::new("/tmp/a.wav")).await.unwrap();
        assert_eq!(timeline.segments.len(), 1);
        assert_eq!(timeline.speakers.gender_of("A"), Gender::Female);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_analyzer_nonzero_exit() {
        let analyzer = ScriptAnalyzer::new(
            "sh",
            vec!["-c".into(), "echo boom >&2; exit 3".into(), "analyzer".into()],
            Duration::from_secs(10),
        );
        let err = analyzer.analyze(Path::new("/tmp/a.wav")).await.unwrap_err();
        assert!(matches!(err, Error::Analysis(msg) if msg.contains("boom")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_analyzer_timeout() {
        let analyzer = ScriptAnalyzer::new(
            "sh",
            vec!["-c".into(), "sleep 5".into(), "analyzer".into()],
            Duration::from_millis(100),
        );
        let err = analyzer.analyze(Path::new("/tmp/a.wav")).await.unwrap_err();
        assert!(matches!(err, Error::ProcessTimeout { .. }));
    }

    #[tokio::test]
    async fn test_hume_missing_key() {
        let analyzer = HumeAnalyzer::new(Arc::new(ProviderConfig::new()));
        let err = analyzer.analyze(Path::new("/tmp/a.wav")).await.unwrap_err();
        assert!(matches!(err, Error::CredentialMissing { provider: "hume", .. }));
    }
}
