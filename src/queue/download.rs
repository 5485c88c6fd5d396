use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::QueueError;

const USER_AGENT: &str = concat!("jukeled/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT_SECS: u64 = 15;
const COPY_BUF: usize = 64 * 1024;

/// Fetches one audio file to `dest`, reporting percent complete.
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &dyn Fn(u8),
        cancelled: &dyn Fn() -> bool,
    ) -> Result<(), QueueError>;
}

/// HTTP(S) via reqwest; `file://` URLs and bare paths are copied.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, QueueError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| QueueError::Download {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }

    fn open(&self, url: &str) -> Result<(Box<dyn Read>, Option<u64>), QueueError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let fail = |e: reqwest::Error| QueueError::Download {
                url: url.to_string(),
                reason: e.to_string(),
            };
            let response = self
                .client
                .get(url)
                .send()
                .and_then(|r| r.error_for_status())
                .map_err(fail)?;
            let total = response.content_length();
            return Ok((Box::new(response), total));
        }
        let path = local_path(url);
        let file = File::open(&path).map_err(|e| QueueError::Download {
            url: url.to_string(),
            reason: format!("{}: {}", path.display(), e),
        })?;
        let total = file.metadata().ok().map(|m| m.len());
        Ok((Box::new(file), total))
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &dyn Fn(u8),
        cancelled: &dyn Fn() -> bool,
    ) -> Result<(), QueueError> {
        let (mut source, total) = self.open(url)?;
        let mut out = File::create(dest)?;
        let mut buf = vec![0u8; COPY_BUF];
        let mut done: u64 = 0;
        let mut last_pct = None;
        loop {
            if cancelled() {
                return Err(QueueError::Cancelled);
            }
            let n = source.read(&mut buf).map_err(|e| QueueError::Download {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            done += n as u64;
            if let Some(total) = total.filter(|&t| t > 0) {
                let pct = (done * 100 / total).min(100) as u8;
                if last_pct != Some(pct) {
                    progress(pct);
                    last_pct = Some(pct);
                }
            }
        }
        out.flush()?;
        if last_pct != Some(100) {
            progress(100);
        }
        log::debug!("Fetched {} bytes from {}", done, url);
        Ok(())
    }
}

fn local_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

/// File extension to store a download under.
pub fn extension_for(url: &str) -> String {
    let name = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .unwrap_or("");
    match name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            ext.to_ascii_lowercase()
        }
        _ => "mp3".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn extensions() {
        assert_eq!(extension_for("https://x.org/a/song.FLAC?sig=1"), "flac");
        assert_eq!(extension_for("file:///music/track.wav"), "wav");
        assert_eq!(extension_for("https://x.org/watch"), "mp3");
        assert_eq!(extension_for("https://x.org/a.b/c"), "mp3");
    }

    #[test]
    fn copies_local_files_with_progress() {
        let dir = std::env::temp_dir().join(format!("jukeled-fetch-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let src = dir.join("src.bin");
        std::fs::write(&src, vec![7u8; 200_000]).unwrap();
        let dest = dir.join("dest.bin");

        let seen = RefCell::new(Vec::new());
        let fetcher = HttpFetcher::new().unwrap();
        let url = format!("file://{}", src.display());
        fetcher
            .fetch(&url, &dest, &|p| seen.borrow_mut().push(p), &|| false)
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap().len(), 200_000);
        let seen = seen.into_inner();
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_source_is_a_download_error() {
        let fetcher = HttpFetcher::new().unwrap();
        let dest = std::env::temp_dir().join("jukeled-never-written.bin");
        let err = fetcher
            .fetch("/definitely/not/here.mp3", &dest, &|_| {}, &|| false)
            .unwrap_err();
        assert!(matches!(err, QueueError::Download { .. }));
    }

    #[test]
    fn cancellation_stops_the_copy() {
        let dir = std::env::temp_dir().join(format!("jukeled-cancel-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let src = dir.join("src.bin");
        std::fs::write(&src, vec![1u8; 10]).unwrap();
        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher
            .fetch(src.to_str().unwrap(), &dir.join("out.bin"), &|_| {}, &|| true)
            .unwrap_err();
        assert!(matches!(err, QueueError::Cancelled));
        std::fs::remove_dir_all(&dir).ok();
    }
}
