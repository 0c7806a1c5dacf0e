//! Download Engine (§4.A): resumable, cancellable, progress-reporting file
//! transfers, plus manifest-driven multi-file download.

use crate::catalogue::resolver::DownloadManifest;
use crate::error::GatewayError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Returns `true` to continue, `false` to cancel. Throttled by the engine to
/// at most once per second (§4.A).
pub type ProgressCb = Arc<dyn Fn(u64, Option<u64>) -> bool + Send + Sync>;

pub fn no_op_progress() -> ProgressCb {
    Arc::new(|_, _| true)
}

#[derive(Debug, Clone)]
pub struct DownloadOpts {
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub low_speed_limit_bytes_per_sec: u64,
    pub low_speed_time_secs: u64,
    pub headers: Vec<(String, String)>,
}

impl Default for DownloadOpts {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_retry_delay_ms: 500,
            max_retry_delay_ms: 30_000,
            low_speed_limit_bytes_per_sec: 1024,
            low_speed_time_secs: 30,
            headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Success,
    Cancelled,
}

pub struct DownloadEngine {
    client: reqwest::Client,
}

impl Default for DownloadEngine {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl DownloadEngine {
    /// Downloads `url` into `dest`, resuming from `dest.partial` if present.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress_cb: &ProgressCb,
        opts: &DownloadOpts,
    ) -> Result<DownloadOutcome, GatewayError> {
        let partial = partial_path(dest);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(dest, e))?;
        }

        let mut attempt = 0u32;
        let mut delay = opts.initial_retry_delay_ms;

        loop {
            match self.download_once(url, dest, &partial, progress_cb, opts).await {
                Ok(outcome) => return Ok(outcome),
                Err(DownloadAttemptError::Cancelled) => return Ok(DownloadOutcome::Cancelled),
                Err(DownloadAttemptError::Transient(msg)) => {
                    attempt += 1;
                    if attempt > opts.max_retries {
                        let bytes = tokio::fs::metadata(&partial).await.ok().map(|m| m.len());
                        return Err(GatewayError::DownloadFailed {
                            file: dest.display().to_string(),
                            message: msg,
                            partial_path: bytes.map(|_| partial.display().to_string()),
                            partial_bytes: bytes,
                        });
                    }
                    warn!(url, attempt, delay_ms = delay, "retrying download after transient error: {msg}");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    delay = (delay * 2).min(opts.max_retry_delay_ms);
                }
                Err(DownloadAttemptError::Fatal(msg)) => {
                    return Err(GatewayError::DownloadFailed {
                        file: dest.display().to_string(),
                        message: msg,
                        partial_path: None,
                        partial_bytes: None,
                    })
                }
            }
        }
    }

    async fn download_once(
        &self,
        url: &str,
        dest: &Path,
        partial: &Path,
        progress_cb: &ProgressCb,
        opts: &DownloadOpts,
    ) -> Result<DownloadOutcome, DownloadAttemptError> {
        let mut resume_from = tokio::fs::metadata(partial).await.map(|m| m.len()).unwrap_or(0);

        let mut req = self.client.get(url);
        for (k, v) in &opts.headers {
            req = req.header(k, v);
        }
        if resume_from > 0 {
            req = req.header("Range", format!("bytes={resume_from}-"));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| DownloadAttemptError::Transient(format!("request failed: {e}")))?;

        let range_honoured = resp.status() == reqwest::StatusCode::PARTIAL_CONTENT;
        if resume_from > 0 && !range_honoured {
            // Server can't resume; restart from scratch.
            resume_from = 0;
            tokio::fs::remove_file(partial).await.ok();
        }
        if !resp.status().is_success() {
            return Err(DownloadAttemptError::Fatal(format!(
                "server returned {}",
                resp.status()
            )));
        }

        let content_length = resp.content_length();
        let total = match (range_honoured, content_length) {
            (true, Some(len)) => Some(resume_from + len),
            (false, Some(len)) => Some(len),
            _ => None,
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!range_honoured && resume_from == 0)
            .append(range_honoured)
            .open(partial)
            .await
            .map_err(|e| DownloadAttemptError::Fatal(format!("cannot open partial file: {e}")))?;

        let mut downloaded = resume_from;
        let mut stream = resp.bytes_stream();
        let mut last_report = Instant::now();
        let mut last_progress_bytes = downloaded;
        let mut last_progress_at = Instant::now();

        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadAttemptError::Transient(format!("stream error: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadAttemptError::Fatal(format!("write failed: {e}")))?;
            downloaded += chunk.len() as u64;

            if downloaded > last_progress_bytes {
                last_progress_bytes = downloaded;
                last_progress_at = Instant::now();
            } else if last_progress_at.elapsed().as_secs() >= opts.low_speed_time_secs
                && opts.low_speed_limit_bytes_per_sec > 0
            {
                return Err(DownloadAttemptError::Transient(
                    "transfer stalled below low_speed_limit".to_string(),
                ));
            }

            if last_report.elapsed() >= Duration::from_secs(1) {
                last_report = Instant::now();
                if !progress_cb(downloaded, total) {
                    file.flush().await.ok();
                    return Err(DownloadAttemptError::Cancelled);
                }
            }
        }
        file.flush().await.ok();
        if !progress_cb(downloaded, total) {
            return Err(DownloadAttemptError::Cancelled);
        }

        if let Some(expected) = total {
            if downloaded != expected {
                return Err(DownloadAttemptError::Transient(format!(
                    "incomplete transfer: got {downloaded} of {expected} bytes"
                )));
            }
        }

        tokio::fs::rename(partial, dest)
            .await
            .map_err(|e| DownloadAttemptError::Fatal(format!("rename failed: {e}")))?;
        Ok(DownloadOutcome::Success)
    }

    /// Iterates a manifest's files, downloading each, propagating
    /// cancellation, and finally validating size/`.partial` state.
    pub async fn download_manifest(
        &self,
        manifest: &DownloadManifest,
        progress_cb: ProgressCb,
    ) -> Result<(), GatewayError> {
        let base = PathBuf::from(&manifest.download_path);
        let total_files = manifest.files.len();

        for (idx, file) in manifest.files.iter().enumerate() {
            let dest = base.join(&file.name);
            let per_file_cb: ProgressCb = {
                let cb = progress_cb.clone();
                Arc::new(move |downloaded, total| cb(downloaded, total))
            };
            debug!(file = %file.name, index = idx, total = total_files, "downloading manifest file");
            let outcome = self
                .download(&file.url, &dest, &per_file_cb, &DownloadOpts::default())
                .await?;
            if outcome == DownloadOutcome::Cancelled {
                return Err(GatewayError::DownloadCancelled { file: file.name.clone() });
            }
        }

        for file in &manifest.files {
            let dest = base.join(&file.name);
            if !dest.exists() {
                return Err(GatewayError::DownloadFailed {
                    file: file.name.clone(),
                    message: "rerun to resume: file missing after download".to_string(),
                    partial_path: Some(partial_path(&dest).display().to_string()),
                    partial_bytes: None,
                });
            }
            if partial_path(&dest).exists() {
                return Err(GatewayError::DownloadFailed {
                    file: file.name.clone(),
                    message: "rerun to resume: stale .partial file remains".to_string(),
                    partial_path: Some(partial_path(&dest).display().to_string()),
                    partial_bytes: None,
                });
            }
            if file.size > 0 {
                let actual = tokio::fs::metadata(&dest).await.map(|m| m.len()).unwrap_or(0);
                if actual != file.size {
                    return Err(GatewayError::DownloadFailed {
                        file: file.name.clone(),
                        message: format!(
                            "rerun to resume: expected {} bytes, found {actual}",
                            file.size
                        ),
                        partial_path: None,
                        partial_bytes: Some(actual),
                    });
                }
            }
        }
        info!(files = total_files, path = %manifest.download_path, "manifest download complete");
        Ok(())
    }
}

enum DownloadAttemptError {
    Transient(String),
    Fatal(String),
    Cancelled,
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut s = dest.as_os_str().to_os_string();
    s.push(".partial");
    PathBuf::from(s)
}

fn io_err(dest: &Path, e: std::io::Error) -> GatewayError {
    GatewayError::DownloadFailed {
        file: dest.display().to_string(),
        message: e.to_string(),
        partial_path: None,
        partial_bytes: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/a/b/model.gguf")),
            PathBuf::from("/a/b/model.gguf.partial")
        );
    }

    #[tokio::test]
    async fn download_writes_file_and_removes_partial_on_success() {
        let server = wiremock_helpers::text_server("hello world").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.txt");
        let engine = DownloadEngine::default();
        let outcome = engine
            .download(&server, &dest, &no_op_progress(), &DownloadOpts::default())
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Success);
        assert_eq!(tokio::fs::read_to_string(&dest).await.unwrap(), "hello world");
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn cancelling_progress_cb_preserves_partial_file() {
        let server = wiremock_helpers::text_server("0123456789").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let cb: ProgressCb = Arc::new(|_, _| false);
        let engine = DownloadEngine::default();
        let outcome = engine
            .download(&server, &dest, &cb, &DownloadOpts::default())
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Cancelled);
        assert!(!dest.exists());
        assert!(partial_path(&dest).exists());
    }

    mod wiremock_helpers {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        pub async fn text_server(body: &str) -> String {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/file"))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&server)
                .await;
            format!("{}/file", server.uri())
        }
    }
}
