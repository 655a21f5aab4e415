//! Resumable HTTP downloads.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Bytes were transferred; `resumed_from` is the offset the request started at.
    Downloaded { bytes: u64, resumed_from: u64 },
    /// The server answered 416 to a range request: the local file already
    /// holds everything.
    AlreadyComplete,
}

/// Blocking HTTP client with bounded timeouts and range-based resume.
#[derive(Clone)]
pub struct Downloader {
    agent: ureq::Agent,
    max_retries: u32,
    config: EngineConfig,
}

impl Downloader {
    pub fn new(config: &EngineConfig) -> Self {
        let mut builder = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout())
            .timeout_read(config.read_timeout());
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Self {
            agent: builder.build(),
            max_retries: config.max_retries,
            config: config.clone(),
        }
    }

    /// Download `url` into `dest`, resuming from whatever `dest` already holds.
    ///
    /// Transport failures are retried with exponential backoff; every retry
    /// resumes from the bytes already on disk. HTTP error statuses other than
    /// 416 are not retried.
    pub fn fetch(&self, url: &str, dest: &Path) -> Result<FetchOutcome> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url, dest) {
                Err(e @ Error::Http { .. }) if attempt < self.max_retries => {
                    let backoff = self.config.retry_backoff(attempt);
                    warn!(url, attempt = attempt + 1, error = %e, ?backoff, "download failed, retrying");
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn fetch_once(&self, url: &str, dest: &Path) -> Result<FetchOutcome> {
        let offset = match std::fs::metadata(dest) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(Error::io(dest, e)),
        };

        let mut request = self.agent.get(url);
        if offset > 0 {
            request = request.set("Range", &format!("bytes={offset}-"));
        }
        debug!(url, offset, "requesting");

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(416, _)) if offset > 0 => {
                debug!(url, "range not satisfiable, treating as complete");
                return Ok(FetchOutcome::AlreadyComplete);
            }
            Err(ureq::Error::Status(status, _)) => {
                return Err(Error::HttpStatus {
                    url: url.to_string(),
                    status,
                })
            }
            Err(ureq::Error::Transport(t)) => return Err(Error::http(url, t)),
        };

        let status = response.status();
        trace!(url, status, "response");
        // 206 continues the partial file; a plain 200 means the server ignored
        // the range and is sending everything again.
        let resumed_from = if status == 206 { offset } else { 0 };
        let expected = response
            .header("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resumed_from > 0)
            .truncate(resumed_from == 0)
            .open(dest)
            .map_err(|e| Error::io(dest, e))?;

        let mut reader = response.into_reader();
        let written = copy_stream(&mut reader, &mut file).map_err(|e| Error::http(url, e))?;
        file.flush().map_err(|e| Error::io(dest, e))?;

        if let Some(expected) = expected {
            if written != expected {
                return Err(Error::http(
                    url,
                    Error::SizeMismatch {
                        expected,
                        actual: written,
                    },
                ));
            }
        }
        Ok(FetchOutcome::Downloaded {
            bytes: written,
            resumed_from,
        })
    }
}

fn copy_stream(reader: &mut dyn Read, writer: &mut dyn Write) -> std::io::Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::short_body_server;
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn downloader() -> Downloader {
        let config = EngineConfig {
            max_retries: 1,
            retry_backoff_ms: 10,
            connect_timeout_secs: 5,
            read_timeout_secs: 5,
            ..EngineConfig::default()
        };
        Downloader::new(&config)
    }

    async fn fetch_blocking(url: String, dest: std::path::PathBuf) -> Result<FetchOutcome> {
        tokio::task::spawn_blocking(move || downloader().fetch(&url, &dest))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fresh_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Data/a.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"full content".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.bin.part");
        let outcome = fetch_blocking(format!("{}/Data/a.bin", server.uri()), dest.clone())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Downloaded {
                bytes: 12,
                resumed_from: 0
            }
        );
        assert_eq!(std::fs::read(&dest).unwrap(), b"full content");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resumes_with_range_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.bin"))
            .and(header("Range", "bytes=5-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b" world".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.bin.part");
        std::fs::write(&dest, b"hello").unwrap();

        let outcome = fetch_blocking(format!("{}/a.bin", server.uri()), dest.clone())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Downloaded {
                bytes: 6,
                resumed_from: 5
            }
        );
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn range_not_satisfiable_means_complete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.bin"))
            .respond_with(ResponseTemplate::new(416))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.bin.part");
        std::fs::write(&dest, b"everything").unwrap();

        let outcome = fetch_blocking(format!("{}/a.bin", server.uri()), dest.clone())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::AlreadyComplete);
        assert_eq!(std::fs::read(&dest).unwrap(), b"everything");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_ignoring_range_restarts_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"new".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.bin.part");
        std::fs::write(&dest, b"stale partial").unwrap();

        fetch_blocking(format!("{}/a.bin", server.uri()), dest.clone())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn not_found_is_a_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = fetch_blocking(format!("{}/nope", server.uri()), dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 404, .. }));
    }

    #[test]
    fn body_shorter_than_content_length_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.bin.part");
        let err = downloader()
            .fetch(&format!("{}/a.bin", short_body_server()), &dest)
            .unwrap_err();
        assert!(matches!(err, Error::Http { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_host_fails_after_retries() {
        // Bind and drop a listener to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let dir = tempfile::tempdir().unwrap();
        let err = fetch_blocking(format!("http://127.0.0.1:{port}/a.bin"), dir.path().join("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { .. }));
    }
}
