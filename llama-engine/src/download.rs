// llama-engine/src/download.rs
//
// Model acquisition: resumable download into the models directory with
// monotonic percentage progress.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::timeout;

use crate::error::DownloadError;

/// Per-chunk stall timeout.
const STALL_TIMEOUT_SECS: u64 = 30;

const PART_SUFFIX: &str = ".part";

/// Make sure `dest_dir/file_name` exists locally and is at least
/// `expected_min_bytes` long, downloading it from `source_uri` if needed.
///
/// Already-present files are returned untouched. An interrupted download
/// leaves a `.part` file behind that the next call resumes from.
/// `on_progress` receives percentages in increasing order, ending with 100.
pub async fn ensure_local_copy<F>(
    source_uri: &str,
    dest_dir: &Path,
    file_name: &str,
    expected_min_bytes: u64,
    mut on_progress: F,
) -> Result<PathBuf, DownloadError>
where
    F: FnMut(u8),
{
    let target = dest_dir.join(file_name);

    if let Ok(metadata) = fs::metadata(&target).await {
        if metadata.is_file() && metadata.len() >= expected_min_bytes {
            log::debug!("Model already exists: {}", target.display());
            return Ok(target);
        }
        log::info!(
            "Existing {} is incomplete ({} bytes, expected at least {}), downloading again",
            target.display(),
            metadata.len(),
            expected_min_bytes
        );
    }

    fs::create_dir_all(dest_dir).await?;
    let part = dest_dir.join(format!("{}{}", file_name, PART_SUFFIX));

    log::info!("Downloading {} -> {}", source_uri, target.display());
    let mut progress = ProgressReporter::new(&mut on_progress);
    let downloaded = fetch_into(source_uri, &part, expected_min_bytes, &mut progress).await?;

    if downloaded < expected_min_bytes {
        log::error!(
            "Downloaded file too small: {} bytes (expected at least {})",
            downloaded,
            expected_min_bytes
        );
        let _ = fs::remove_file(&part).await;
        return Err(DownloadError::TooSmall {
            actual: downloaded,
            expected: expected_min_bytes,
        });
    }

    if fs::metadata(&target).await.is_ok() {
        fs::remove_file(&target).await?;
    }
    fs::rename(&part, &target).await?;
    progress.finish();

    log::info!("Download complete: {} ({} bytes)", target.display(), downloaded);
    Ok(target)
}

/// Download into `part`, resuming from its current length. Returns the final length.
async fn fetch_into<F: FnMut(u8)>(
    source_uri: &str,
    part: &Path,
    expected_min_bytes: u64,
    progress: &mut ProgressReporter<'_, F>,
) -> Result<u64, DownloadError> {
    let client = Client::builder()
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(20))
        .build()?;

    let existing = fs::metadata(part).await.map(|m| m.len()).unwrap_or(0);

    let mut request = client.get(source_uri);
    if existing > 0 {
        log::info!("Resuming download from byte {}", existing);
        request = request.header(RANGE, format!("bytes={}-", existing));
    }
    let mut response = request.send().await?;

    let resuming = match response.status() {
        StatusCode::PARTIAL_CONTENT => true,
        StatusCode::RANGE_NOT_SATISFIABLE if existing >= expected_min_bytes => {
            log::info!("Partial file already complete ({} bytes)", existing);
            return Ok(existing);
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            log::warn!("Server rejected resume range, restarting download");
            fs::remove_file(part).await?;
            response = client.get(source_uri).send().await?;
            if !response.status().is_success() {
                return Err(DownloadError::Status(response.status().as_u16()));
            }
            false
        }
        status if status.is_success() => {
            if existing > 0 {
                log::warn!("Server doesn't support resume, starting fresh download");
            }
            false
        }
        status => return Err(DownloadError::Status(status.as_u16())),
    };

    let mut downloaded = if resuming { existing } else { 0 };
    let total = response.content_length().map(|len| len + downloaded);

    let file = if resuming {
        fs::OpenOptions::new().append(true).open(part).await?
    } else {
        fs::File::create(part).await?
    };
    let mut writer = BufWriter::with_capacity(1024 * 1024, file);

    if let Some(total) = total {
        progress.report(downloaded, total);
    }

    let mut stream = response.bytes_stream();
    loop {
        let chunk = match timeout(Duration::from_secs(STALL_TIMEOUT_SECS), stream.next()).await {
            Err(_) => {
                let _ = writer.flush().await;
                return Err(DownloadError::Stalled(STALL_TIMEOUT_SECS));
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                // Keep what we have so the next attempt can resume
                let _ = writer.flush().await;
                return Err(DownloadError::Http(e));
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        writer.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        if let Some(total) = total {
            progress.report(downloaded, total);
        }
    }

    writer.flush().await?;
    Ok(downloaded)
}

/// Forwards integer percentages to the caller, only when they increase.
struct ProgressReporter<'a, F: FnMut(u8)> {
    callback: &'a mut F,
    last: Option<u8>,
}

impl<'a, F: FnMut(u8)> ProgressReporter<'a, F> {
    fn new(callback: &'a mut F) -> Self {
        Self {
            callback,
            last: None,
        }
    }

    fn report(&mut self, downloaded: u64, total: u64) {
        self.emit(percent(downloaded, total));
    }

    fn finish(&mut self) {
        self.emit(100);
    }

    fn emit(&mut self, value: u8) {
        if self.last.map_or(true, |last| value > last) {
            self.last = Some(value);
            (self.callback)(value);
        }
    }
}

fn percent(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((downloaded as f64 / total as f64) * 100.0).min(100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    /// Serve `body` over plain HTTP, honouring `Range: bytes=N-`.
    /// Returns the URL and a log of the requested range offsets.
    async fn serve(body: Vec<u8>) -> (String, Arc<Mutex<Vec<Option<u64>>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let seen = ranges.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                let head = String::from_utf8_lossy(&request).to_lowercase();
                let offset = head
                    .lines()
                    .find_map(|l| l.strip_prefix("range: bytes="))
                    .and_then(|r| r.trim().trim_end_matches('-').parse::<u64>().ok());
                seen.lock().unwrap().push(offset);

                let (status, slice) = match offset {
                    Some(start) => ("206 Partial Content", &body[start as usize..]),
                    None => ("200 OK", &body[..]),
                };
                let header = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    slice.len()
                );
                socket.write_all(header.as_bytes()).await.unwrap();
                socket.write_all(slice).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}/model.gguf", addr), ranges)
    }

    #[tokio::test]
    async fn test_downloads_with_monotonic_progress() {
        let body = vec![7u8; 256 * 1024];
        let (url, ranges) = serve(body.clone()).await;
        let dir = tempdir().unwrap();

        let mut seen = Vec::new();
        let path = ensure_local_copy(&url, dir.path(), "model.gguf", 1024, |p| seen.push(p))
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("model.gguf"));
        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert!(!dir.path().join("model.gguf.part").exists());
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*ranges.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_existing_file_is_a_no_op() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("model.gguf"), vec![1u8; 2048]).unwrap();

        let mut calls = 0;
        // Nothing listens on the discard port; any request would fail.
        let path = ensure_local_copy(
            "http://127.0.0.1:9/model.gguf",
            dir.path(),
            "model.gguf",
            1024,
            |_| calls += 1,
        )
        .await
        .unwrap();

        assert_eq!(path, dir.path().join("model.gguf"));
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_resumes_from_partial_file() {
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (url, ranges) = serve(body.clone()).await;
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("model.gguf.part"), &body[..4_000]).unwrap();

        let path = ensure_local_copy(&url, dir.path(), "model.gguf", 10_000, |_| {})
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert_eq!(*ranges.lock().unwrap(), vec![Some(4_000)]);
    }

    #[tokio::test]
    async fn test_too_small_download_is_discarded() {
        let (url, _) = serve(vec![0u8; 100]).await;
        let dir = tempdir().unwrap();

        let err = ensure_local_copy(&url, dir.path(), "model.gguf", 1_000, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DownloadError::TooSmall {
                actual: 100,
                expected: 1_000
            }
        ));
        assert!(!dir.path().join("model.gguf").exists());
        assert!(!dir.path().join("model.gguf.part").exists());
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(50, 200), 25);
        assert_eq!(percent(300, 200), 100);
    }
}
