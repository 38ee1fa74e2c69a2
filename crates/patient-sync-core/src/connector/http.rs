//! Full-population HTTP pull for the snapshot source.

use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use super::SnapshotFetcher;

/// Connection settings for [`HttpSnapshotConnector`].
#[derive(Debug, Clone)]
pub struct HttpSnapshotSettings {
    pub url: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Total attempts, including the first
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl HttpSnapshotSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
            attempts: 2,
            retry_delay: Duration::from_secs(60),
        }
    }
}

/// Why a pull attempt failed, for the warning log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    ConnectTimeout,
    ReadTimeout,
    Refused,
    Status(u16),
    Other,
}

impl FetchFailure {
    fn classify(e: &reqwest::Error) -> Self {
        if e.is_connect() && e.is_timeout() {
            FetchFailure::ConnectTimeout
        } else if e.is_timeout() {
            FetchFailure::ReadTimeout
        } else if e.is_connect() {
            FetchFailure::Refused
        } else if let Some(status) = e.status() {
            FetchFailure::Status(status.as_u16())
        } else {
            FetchFailure::Other
        }
    }
}

/// Blocking HTTP client pulling the whole snapshot as text.
pub struct HttpSnapshotConnector {
    settings: HttpSnapshotSettings,
    client: Option<Client>,
}

impl HttpSnapshotConnector {
    pub fn new(settings: HttpSnapshotSettings) -> Self {
        Self {
            settings,
            client: None,
        }
    }

    fn client(&mut self) -> Option<&Client> {
        if self.client.is_none() {
            match Client::builder()
                .connect_timeout(self.settings.connect_timeout)
                .timeout(self.settings.read_timeout)
                .build()
            {
                Ok(client) => self.client = Some(client),
                Err(e) => {
                    warn!(error = %e, "Failed to build HTTP client");
                    return None;
                }
            }
        }
        self.client.as_ref()
    }

    fn fetch_once(&mut self) -> Result<String, (FetchFailure, String)> {
        let url = self.settings.url.clone();
        let client = self
            .client()
            .ok_or((FetchFailure::Other, "no HTTP client".to_string()))?;

        let response = client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| (FetchFailure::classify(&e), e.to_string()))?;

        response
            .text()
            .map_err(|e| (FetchFailure::classify(&e), e.to_string()))
    }
}

impl SnapshotFetcher for HttpSnapshotConnector {
    fn fetch_all(&mut self) -> Vec<String> {
        let attempts = self.settings.attempts.max(1);

        for attempt in 1..=attempts {
            debug!(url = %self.settings.url, attempt, "Pulling snapshot");
            match self.fetch_once() {
                Ok(body) => {
                    let lines: Vec<String> = body.lines().map(str::to_string).collect();
                    info!(lines = lines.len(), "Snapshot pulled");
                    return lines;
                }
                Err((failure, message)) => {
                    warn!(
                        url = %self.settings.url,
                        attempt,
                        max_attempts = attempts,
                        ?failure,
                        error = %message,
                        "Snapshot pull failed"
                    );
                    if attempt < attempts {
                        thread::sleep(self.settings.retry_delay);
                    }
                }
            }
        }

        warn!(url = %self.settings.url, "Snapshot pull exhausted retries, returning no data");
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn fast_settings(url: String) -> HttpSnapshotSettings {
        HttpSnapshotSettings {
            url,
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
            attempts: 2,
            retry_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_fetch_all_returns_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let body = "1/A;Ivanov\n2/B;Petrov\n";

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
        });

        let mut connector = HttpSnapshotConnector::new(fast_settings(format!("http://{}/patients", addr)));
        let lines = connector.fetch_all();
        server.join().unwrap();

        assert_eq!(lines, vec!["1/A;Ivanov", "2/B;Petrov"]);
    }

    #[test]
    fn test_refused_connection_returns_empty() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut connector = HttpSnapshotConnector::new(fast_settings(format!("http://127.0.0.1:{}/", port)));
        assert!(connector.fetch_all().is_empty());
    }
}
