//! Blocking "fetch bytes for a URL" primitive used by package installs

use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::debug;

/// Upper bound on a single download
pub const MAX_DOWNLOAD_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("timed out")]
    Timeout,

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("download exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("cannot read {path}: {reason}")]
    Local { path: PathBuf, reason: String },

    #[error("unsupported URL: {0}")]
    UnsupportedUrl(String),
}

/// Source of remote content
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, deadline: Instant) -> Result<Vec<u8>, FetchError>;
}

/// Fetches `http(s)://` URLs with ureq and `file://` URLs from disk
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher;

impl HttpFetcher {
    pub fn new() -> Self {
        Self
    }

    fn fetch_http(&self, url: &str, remaining: Duration) -> Result<Vec<u8>, FetchError> {
        let response = ureq::get(url)
            .timeout(remaining)
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(code, _) => FetchError::Status(code),
                ureq::Error::Transport(t) => {
                    if t.to_string().to_lowercase().contains("timed out") {
                        FetchError::Timeout
                    } else {
                        FetchError::Transport(t.to_string())
                    }
                }
            })?;

        read_body(response.into_reader(), MAX_DOWNLOAD_BYTES)
    }
}

/// Read a response body of at most `limit` bytes.
///
/// The ureq timeout also covers the body, and surfaces as an io `TimedOut`.
fn read_body(reader: impl Read, limit: u64) -> Result<Vec<u8>, FetchError> {
    let mut body = Vec::new();
    reader
        .take(limit + 1)
        .read_to_end(&mut body)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => FetchError::Timeout,
            _ => FetchError::Transport(e.to_string()),
        })?;

    if body.len() as u64 > limit {
        return Err(FetchError::TooLarge { limit });
    }
    Ok(body)
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, deadline: Instant) -> Result<Vec<u8>, FetchError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(FetchError::Timeout);
        }

        debug!("Fetching {}", url);
        if let Some(path) = url.strip_prefix("file://") {
            let path = PathBuf::from(path);
            return std::fs::read(&path).map_err(|e| FetchError::Local {
                path,
                reason: e.to_string(),
            });
        }

        if url.starts_with("http://") || url.starts_with("https://") {
            self.fetch_http(url, remaining)
        } else {
            Err(FetchError::UnsupportedUrl(url.to_string()))
        }
    }
}

/// Last path segment of a URL without query, fragment or extension
pub fn url_file_stem(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let segment = without_query.trim_end_matches('/').rsplit('/').next()?;
    let stem = segment.split('.').next()?;
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stem_ignores_query_and_extension() {
        assert_eq!(
            url_file_stem("https://example.com/releases/dnd5e.zip?token=1").as_deref(),
            Some("dnd5e")
        );
        assert_eq!(
            url_file_stem("file:///tmp/pf2e.tar.gz").as_deref(),
            Some("pf2e")
        );
        assert_eq!(url_file_stem("https://example.com/").as_deref(), Some("example"));
    }

    #[test]
    fn reads_file_urls() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pkg.zip");
        std::fs::write(&path, b"bytes").unwrap();

        let url = format!("file://{}", path.display());
        let bytes = HttpFetcher::new()
            .fetch(&url, Instant::now() + Duration::from_secs(5))
            .unwrap();
        assert_eq!(bytes, b"bytes");
    }

    #[test]
    fn expired_deadline_is_a_timeout() {
        let err = HttpFetcher::new()
            .fetch("https://example.com/pkg.zip", Instant::now())
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout));
    }

    /// Yields some bytes, then fails with the given error kind
    struct FailingReader {
        sent: bool,
        kind: std::io::ErrorKind,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.sent {
                return Err(std::io::Error::new(self.kind, "connection stalled"));
            }
            self.sent = true;
            buf[..4].copy_from_slice(b"PK\x03\x04");
            Ok(4)
        }
    }

    #[test]
    fn body_read_timeout_is_a_timeout() {
        let reader = FailingReader {
            sent: false,
            kind: std::io::ErrorKind::TimedOut,
        };
        let err = read_body(reader, MAX_DOWNLOAD_BYTES).unwrap_err();
        assert!(matches!(err, FetchError::Timeout), "got {:?}", err);

        let reader = FailingReader {
            sent: false,
            kind: std::io::ErrorKind::ConnectionReset,
        };
        let err = read_body(reader, MAX_DOWNLOAD_BYTES).unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)), "got {:?}", err);
    }

    #[test]
    fn oversized_bodies_are_refused() {
        assert_eq!(read_body(&b"12345"[..], 5).unwrap(), b"12345");
        let err = read_body(&b"123456"[..], 5).unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { limit: 5 }));
    }

    #[test]
    fn rejects_unknown_schemes() {
        let err = HttpFetcher::new()
            .fetch("ftp://example.com/pkg.zip", Instant::now() + Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedUrl(_)));
    }
}
