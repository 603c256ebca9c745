use std::path::{Path, PathBuf};
#[cfg(feature = "download")]
use std::time::Duration;

use async_trait::async_trait;
#[cfg(feature = "download")]
use serde::Deserialize;
#[cfg(feature = "download")]
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A video fetched into the session directory.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedVideo {
    pub file_path: PathBuf,
    pub video_id: String,
    pub title: Option<String>,
}

/// Fetches a video from a public URL into a directory.
#[async_trait]
pub trait VideoSource: Send + Sync {
    async fn download(&self, url: &str, dir: &Path) -> Result<DownloadedVideo>;
}

/// Short-video platforms the downloader accepts links from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    YouTube,
    TikTok,
    Instagram,
    X,
    Vimeo,
}

impl Platform {
    pub fn name(self) -> &'static str {
        match self {
            Platform::YouTube => "youtube",
            Platform::TikTok => "tiktok",
            Platform::Instagram => "instagram",
            Platform::X => "x",
            Platform::Vimeo => "vimeo",
        }
    }
}

const KNOWN_HOSTS: &[(&str, Platform)] = &[
    ("youtube.com", Platform::YouTube),
    ("youtu.be", Platform::YouTube),
    ("tiktok.com", Platform::TikTok),
    ("instagram.com", Platform::Instagram),
    ("x.com", Platform::X),
    ("twitter.com", Platform::X),
    ("vimeo.com", Platform::Vimeo),
];

/// Host part of an http(s) URL, lowercased, without userinfo or port.
/// Rejects anything that isn't http:// or https://.
fn url_host(url: &str) -> Result<String> {
    let trimmed = url.trim();
    let lower = trimmed.to_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .ok_or_else(|| {
            Error::UnsupportedInput(format!(
                "invalid URL (must start with http:// or https://): {trimmed}"
            ))
        })?;

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();
    let host = host_port.split(':').next().unwrap_or_default();
    if host.is_empty() {
        return Err(Error::UnsupportedInput(format!("URL has no host: {trimmed}")));
    }
    Ok(host.to_string())
}

/// Work out which platform a link belongs to.
pub fn select_source(url: &str) -> Result<Platform> {
    let host = url_host(url)?;
    KNOWN_HOSTS
        .iter()
        .find(|(domain, _)| host == *domain || host.ends_with(&format!(".{domain}")))
        .map(|(_, platform)| *platform)
        .ok_or_else(|| {
            Error::UnsupportedInput(format!(
                "unsupported host \"{host}\" (supported: YouTube, TikTok, Instagram, X, Vimeo)"
            ))
        })
}

#[cfg(feature = "download")]
#[derive(Deserialize)]
struct YtDlpInfo {
    id: Option<String>,
    title: Option<String>,
}

/// Downloads with the `yt-dlp` command.
///
/// # Security
/// - URL is validated to be http(s) on a known host
/// - Arguments are passed to yt-dlp via `.arg()` (no shell expansion)
/// - `--no-exec` prevents yt-dlp from running post-processing commands
/// - Downloaded file path is validated to be inside the target directory
#[cfg(feature = "download")]
#[derive(Debug, Clone)]
pub struct YtDlpSource {
    program: String,
    timeout: Duration,
}

#[cfg(feature = "download")]
impl Default for YtDlpSource {
    fn default() -> Self {
        Self {
            program: "yt-dlp".into(),
            timeout: Duration::from_secs(600),
        }
    }
}

#[cfg(feature = "download")]
impl YtDlpSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[&str], url: &str) -> Result<std::process::Output> {
        let child = tokio::process::Command::new(&self.program)
            .args(args)
            .arg(url)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();
        Ok(tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| Error::ProcessTimeout {
                command: self.program.clone(),
                after: self.timeout,
            })??)
    }
}

#[cfg(feature = "download")]
#[async_trait]
impl VideoSource for YtDlpSource {
    async fn download(&self, url: &str, dir: &Path) -> Result<DownloadedVideo> {
        let platform = select_source(url)?;
        let url = url.trim();
        info!(%url, platform = platform.name(), "downloading video");

        let check = tokio::process::Command::new(&self.program)
            .arg("--version")
            .output()
            .await;
        if check.is_err() {
            return Err(Error::YtDlpNotFound);
        }

        tokio::fs::create_dir_all(dir).await?;

        let output_template = dir
            .join("%(id)s.%(ext)s")
            .to_str()
            .ok_or_else(|| Error::Download("output directory path contains invalid UTF-8".into()))?
            .to_string();

        let info_output = self
            .run(&["--dump-json", "--no-download", "--no-playlist", "--no-exec"], url)
            .await?;
        let info: Option<YtDlpInfo> = if info_output.status.success() {
            serde_json::from_slice(&info_output.stdout).ok()
        } else {
            None
        };

        let output = self
            .run(
                &[
                    "--format",
                    "bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/bv*+ba/b",
                    "--merge-output-format",
                    "mp4",
                    "--no-playlist",
                    "--no-exec",
                    "--output",
                    &output_template,
                    "--print",
                    "after_move:filepath",
                ],
                url,
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr_truncated: String = stderr.chars().take(1000).collect();
            return Err(Error::Download(format!("yt-dlp failed: {stderr_truncated}")));
        }

        let printed = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let file_path = match printed.lines().last() {
            Some(line) if !line.trim().is_empty() => {
                let candidate = PathBuf::from(line.trim());
                validate_path_in_dir(&candidate, dir)?;
                candidate
            }
            _ => find_video_file(dir)?,
        };

        if !file_path.exists() {
            return Err(Error::Download(format!(
                "downloaded file not found at {}",
                file_path.display()
            )));
        }

        let video_id = info
            .as_ref()
            .and_then(|i| i.id.clone())
            .or_else(|| {
                file_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .unwrap_or_default();

        debug!(path = %file_path.display(), %video_id, "video downloaded");

        Ok(DownloadedVideo {
            file_path,
            video_id,
            title: info.and_then(|i| i.title),
        })
    }
}

/// Normalize a path by resolving `.` and `..` components without touching the filesystem.
#[cfg(feature = "download")]
fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir => {}
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

/// Validate that a path is inside the expected directory (prevents path traversal).
#[cfg(feature = "download")]
fn validate_path_in_dir(path: &Path, expected_dir: &Path) -> Result<()> {
    let canonical_dir = expected_dir
        .canonicalize()
        .unwrap_or_else(|_| normalize_path(expected_dir));
    let canonical_path = path.canonicalize().unwrap_or_else(|_| normalize_path(path));

    if canonical_path.starts_with(&canonical_dir) {
        Ok(())
    } else {
        warn!(
            path = %path.display(),
            expected_dir = %expected_dir.display(),
            "downloaded file path outside expected directory"
        );
        Err(Error::Download(
            "downloaded file path is outside the session directory".into(),
        ))
    }
}

/// Most recently modified video file in a directory.
#[cfg(feature = "download")]
fn find_video_file(dir: &Path) -> Result<PathBuf> {
    let mut best: Option<(PathBuf, std::time::SystemTime)> = None;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !matches!(ext, "mp4" | "webm" | "mkv" | "mov") {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            if best.as_ref().is_none_or(|(_, t)| modified > *t) {
                best = Some((path, modified));
            }
        }
    }

    best.map(|(p, _)| p)
        .ok_or_else(|| Error::Download("no video file found after download".into()))
}
