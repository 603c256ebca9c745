use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Sample rate the segmenter and transcription expect.
pub const ANALYSIS_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of generated silence and of the concatenated dub track.
pub const DUB_SAMPLE_RATE: u32 = 24_000;

/// Longest ffmpeg stderr kept in an error.
const MAX_STDERR_CHARS: usize = 1000;

/// The ffmpeg-backed operations the pipeline needs.
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Extract mono 16 kHz PCM WAV audio from a video.
    async fn extract_audio(&self, video: &Path, wav: &Path) -> Result<()>;

    /// Join the given parts, in order, into one track. Parts that do not
    /// exist are skipped.
    async fn concat_audio(&self, parts: &[PathBuf], output: &Path) -> Result<()>;

    /// Copy the picture stream of `video` and replace its audio with `audio`.
    async fn remux(&self, video: &Path, audio: &Path, output: &Path) -> Result<()>;
}

/// [`MediaToolkit`] backed by the `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: PathBuf,
    extract_timeout: Duration,
    mux_timeout: Duration,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            extract_timeout: Duration::from_secs(120),
            mux_timeout: Duration::from_secs(300),
        }
    }
}

impl Ffmpeg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn extract_timeout(mut self, timeout: Duration) -> Self {
        self.extract_timeout = timeout;
        self
    }

    pub fn mux_timeout(mut self, timeout: Duration) -> Self {
        self.mux_timeout = timeout;
        self
    }

    async fn run(&self, args: Vec<OsString>, timeout: Duration) -> Result<()> {
        debug!(program = %self.program.display(), ?args, "running ffmpeg");

        let child = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::Media("ffmpeg not found — install with: apt install ffmpeg".into())
                } else {
                    Error::Media(format!("failed to run ffmpeg: {e}"))
                }
            })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::ProcessTimeout {
                    command: "ffmpeg".into(),
                    after: timeout,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = tail_chars(stderr.trim(), MAX_STDERR_CHARS);
            return Err(Error::Media(format!("ffmpeg failed ({}): {tail}", output.status)));
        }
        Ok(())
    }
}

/// Last `max` characters of `s`; ffmpeg puts the useful part of an error at the end.
fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(max)).collect()
}

fn base_args() -> Vec<OsString> {
    ["-nostdin", "-hide_banner", "-loglevel", "error", "-y"]
        .into_iter()
        .map(OsString::from)
        .collect()
}

fn extract_args(video: &Path, wav: &Path) -> Vec<OsString> {
    let mut args = base_args();
    args.push("-i".into());
    args.push(video.into());
    for a in ["-vn", "-ac", "1", "-ar"] {
        args.push(a.into());
    }
    args.push(ANALYSIS_SAMPLE_RATE.to_string().into());
    args.push("-acodec".into());
    args.push("pcm_s16le".into());
    args.push(wav.into());
    args
}

/// Concat-filter invocation. Every input is resampled to a common mono
/// layout first because parts mix provider MP3 and locally written WAV.
fn concat_args(parts: &[&Path], output: &Path) -> Vec<OsString> {
    let mut args = base_args();
    for part in parts {
        args.push("-i".into());
        args.push((*part).into());
    }

    let mut filter = String::new();
    for i in 0..parts.len() {
        filter.push_str(&format!(
            "[{i}:a]aresample={DUB_SAMPLE_RATE},aformat=sample_fmts=s16:channel_layouts=mono[a{i}];"
        ));
    }
    for i in 0..parts.len() {
        filter.push_str(&format!("[a{i}]"));
    }
    filter.push_str(&format!("concat=n={}:v=0:a=1[out]", parts.len()));

    args.push("-filter_complex".into());
    args.push(filter.into());
    for a in ["-map", "[out]", "-acodec", "pcm_s16le"] {
        args.push(a.into());
    }
    args.push(output.into());
    args
}

fn remux_args(video: &Path, audio: &Path, output: &Path) -> Vec<OsString> {
    let mut args = base_args();
    args.push("-i".into());
    args.push(video.into());
    args.push("-i".into());
    args.push(audio.into());
    for a in [
        "-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy", "-c:a", "aac", "-b:a", "192k",
        "-movflags", "+faststart",
    ] {
        args.push(a.into());
    }
    args.push(output.into());
    args
}

#[async_trait]
impl MediaToolkit for Ffmpeg {
    async fn extract_audio(&self, video: &Path, wav: &Path) -> Result<()> {
        if !video.exists() {
            return Err(Error::FileNotFound {
                path: video.to_path_buf(),
            });
        }
        info!(video = %video.display(), "extracting audio");
        self.run(extract_args(video, wav), self.extract_timeout).await?;
        if !wav.exists() {
            return Err(Error::Media("ffmpeg produced no audio output".into()));
        }
        Ok(())
    }

    async fn concat_audio(&self, parts: &[PathBuf], output: &Path) -> Result<()> {
        let existing: Vec<&Path> = parts
            .iter()
            .map(PathBuf::as_path)
            .filter(|p| p.exists())
            .collect();
        if existing.len() < parts.len() {
            warn!(
                expected = parts.len(),
                found = existing.len(),
                "some audio parts are missing, concatenating the rest"
            );
        }
        if existing.is_empty() {
            return Err(Error::Media("no audio parts to concatenate".into()));
        }

        info!(parts = existing.len(), output = %output.display(), "concatenating audio parts");
        self.run(concat_args(&existing, output), self.mux_timeout).await
    }

    async fn remux(&self, video: &Path, audio: &Path, output: &Path) -> Result<()> {
        for input in [video, audio] {
            if !input.exists() {
                return Err(Error::FileNotFound {
                    path: input.to_path_buf(),
                });
            }
        }
        info!(video = %video.display(), audio = %audio.display(), "remuxing");
        self.run(remux_args(video, audio, output), self.mux_timeout).await?;
        if !output.exists() {
            return Err(Error::Media("ffmpeg produced no video output".into()));
        }
        Ok(())
    }
}

/// Write `seconds` of digital silence as mono 16-bit WAV.
pub fn write_silence(path: &Path, seconds: f64, sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let samples = (seconds.max(0.0) * sample_rate as f64).round() as u64;

    let mut writer = WavWriter::create(path, spec)?;
    for _ in 0..samples {
        writer.write_sample(0i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Duration of a WAV file in seconds.
pub fn wav_duration(path: &Path) -> Result<f64> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_extract_args_mono_16k_pcm() {
        let args = strings(&extract_args(Path::new("in.mp4"), Path::new("out.wav")));
        let joined = args.join(" ");
        assert!(joined.contains("-i in.mp4"));
        assert!(joined.contains("-ac 1 -ar 16000"));
        assert!(joined.contains("-acodec pcm_s16le"));
        assert_eq!(args.last().unwrap(), "out.wav");
    }

    #[test]
    fn test_concat_args_preserve_order() {
        let parts = [Path::new("p0.mp3"), Path::new("p1.wav"), Path::new("p2.mp3")];
        let args = strings(&concat_args(&parts, Path::new("dub.wav")));

        let inputs: Vec<&String> = args
            .iter()
            .enumerate()
            .filter(|(i, _)| *i > 0 && args[i - 1] == "-i")
            .map(|(_, a)| a)
            .collect();
        assert_eq!(inputs, ["p0.mp3", "p1.wav", "p2.mp3"]);

        let filter = &args[args.iter().position(|a| a == "-filter_complex").unwrap() + 1];
        assert!(filter.ends_with("[a0][a1][a2]concat=n=3:v=0:a=1[out]"));
        assert!(filter.contains("[1:a]aresample=24000"));
    }

    #[test]
    fn test_remux_copies_video_and_encodes_audio() {
        let args = strings(&remux_args(
            Path::new("src.mp4"),
            Path::new("dub.wav"),
            Path::new("final.mp4"),
        ));
        let joined = args.join(" ");
        assert!(joined.contains("-map 0:v:0 -map 1:a:0"));
        assert!(joined.contains("-c:v copy"));
        assert!(joined.contains("-c:a aac"));
    }

    #[test]
    fn test_tail_chars_keeps_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }

    #[test]
    fn test_write_silence_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gap.wav");
        write_silence(&path, 1.0, DUB_SAMPLE_RATE).unwrap();
        let duration = wav_duration(&path).unwrap();
        assert!((duration - 1.0).abs() < 1.0 / DUB_SAMPLE_RATE as f64);

        let reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert!(reader.into_samples::<i16>().all(|s| s.unwrap() == 0));
    }

    #[test]
    fn test_write_silence_fractional_and_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        write_silence(&path, 0.3337, DUB_SAMPLE_RATE).unwrap();
        assert!((wav_duration(&path).unwrap() - 0.3337).abs() < 1.0 / DUB_SAMPLE_RATE as f64);

        let empty = dir.path().join("empty.wav");
        write_silence(&empty, -2.0, DUB_SAMPLE_RATE).unwrap();
        assert_eq!(wav_duration(&empty).unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_concat_with_no_existing_parts_fails() {
        let ffmpeg = Ffmpeg::new().program("/nonexistent/ffmpeg");
        let err = ffmpeg
            .concat_audio(
                &[PathBuf::from("/nonexistent/p0.mp3")],
                Path::new("/tmp/out.wav"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Media(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("p0.wav");
        write_silence(&part, 0.1, DUB_SAMPLE_RATE).unwrap();

        let ffmpeg = Ffmpeg::new().program("/nonexistent/ffmpeg");
        let err = ffmpeg
            .concat_audio(&[part], &dir.path().join("out.wav"))
            .await
            .unwrap_err();
        match err {
            Error::Media(msg) => assert!(msg.contains("ffmpeg not found")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_extract_missing_video() {
        let err = Ffmpeg::new()
            .extract_audio(Path::new("/nonexistent/v.mp4"), Path::new("/tmp/a.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound { .. }));
    }
}
