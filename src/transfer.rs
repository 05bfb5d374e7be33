/*
 * resman - Game resource update and sync engine.
 * Copyright (C) 2025  resman contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Transfer engine: non-blocking single-resource fetches.
//!
//! A [`Transport`] streams one resource into a [`BodySink`]. Several fetches are
//! multiplexed by polling their futures together on one thread; the engine
//! itself never spawns threads or tasks.

use crate::config::Config;
use crate::util::lock;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Certificate, Client};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};
use url::Url;

const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// A single resource request against one mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub ca_bundle: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer aborted")]
    Aborted,

    #[error("couldn't resolve host for {url}: {message}")]
    Resolve { url: String, message: String },

    #[error("couldn't connect to host for {url}: {message}")]
    Connect { url: String, message: String },

    #[error("transfer of {url} failed: {message}")]
    Other { url: String, message: String },

    #[error("failed to store data from {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: io::Error,
    },
}

/// Receiver of a response body, chunk by chunk.
///
/// Returning `ControlFlow::Break` aborts the transfer.
#[async_trait]
pub trait BodySink {
    async fn on_chunk(&mut self, chunk: &[u8]) -> io::Result<ControlFlow<()>>;
}

#[async_trait]
impl BodySink for Vec<u8> {
    async fn on_chunk(&mut self, chunk: &[u8]) -> io::Result<ControlFlow<()>> {
        self.extend_from_slice(chunk);
        Ok(ControlFlow::Continue(()))
    }
}

/// Something able to fetch a resource by URL
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stream the resource into `sink`.
    ///
    /// Returns the HTTP status for HTTP(S) URLs and `None` for other schemes.
    async fn fetch(
        &self,
        request: &TransferRequest,
        sink: &mut (dyn BodySink + Send),
    ) -> Result<Option<u16>, TransferError>;
}

async fn deliver(
    url: &str,
    sink: &mut (dyn BodySink + Send),
    chunk: &[u8],
) -> Result<(), TransferError> {
    trace!("received {} bytes from {}", chunk.len(), url);
    match sink.on_chunk(chunk).await {
        Ok(ControlFlow::Continue(())) => Ok(()),
        Ok(ControlFlow::Break(())) => Err(TransferError::Aborted),
        Err(source) => Err(TransferError::Io {
            url: url.to_string(),
            source,
        }),
    }
}

/// Production transport: HTTP(S) through reqwest, `file://` through tokio::fs.
///
/// Construct one per process and share it between trees.
pub struct TransferEngine {
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
    user_agent: String,
    clients: Mutex<HashMap<Option<PathBuf>, Client>>,
}

impl TransferEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            request_timeout: match config.request_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            user_agent: config.user_agent.clone(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// One client per CA bundle, built on first use
    fn client_for(&self, url: &str, ca_bundle: Option<&Path>) -> Result<Client, TransferError> {
        let key = ca_bundle.map(Path::to_path_buf);
        let mut clients = lock(&self.clients);
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let other = |message: String| TransferError::Other {
            url: url.to_string(),
            message,
        };

        let mut builder = Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(self.user_agent.clone());
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(path) = ca_bundle {
            let pem = std::fs::read(path)
                .map_err(|e| other(format!("failed to read CA bundle {}: {}", path.display(), e)))?;
            let certificate = Certificate::from_pem(&pem)
                .map_err(|e| other(format!("invalid CA bundle {}: {}", path.display(), e)))?;
            builder = builder.add_root_certificate(certificate);
        }
        let client = builder
            .build()
            .map_err(|e| other(format!("failed to build HTTP client: {}", e)))?;

        debug!("created HTTP client (custom CA: {})", ca_bundle.is_some());
        clients.insert(key, client.clone());
        Ok(client)
    }

    async fn fetch_http(
        &self,
        request: &TransferRequest,
        sink: &mut (dyn BodySink + Send),
    ) -> Result<Option<u16>, TransferError> {
        let client = self.client_for(&request.url, request.ca_bundle.as_deref())?;
        let mut builder = client.get(&request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify(&request.url, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Ok(Some(status.as_u16()));
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify(&request.url, &e))?;
            deliver(&request.url, sink, &chunk).await?;
        }
        Ok(Some(status.as_u16()))
    }

    async fn fetch_file(
        &self,
        request: &TransferRequest,
        sink: &mut (dyn BodySink + Send),
    ) -> Result<Option<u16>, TransferError> {
        let other = |message: String| TransferError::Other {
            url: request.url.clone(),
            message,
        };
        let url = Url::parse(&request.url).map_err(|e| other(e.to_string()))?;
        let path = url
            .to_file_path()
            .map_err(|()| other("not a local file path".to_string()))?;

        let mut file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => TransferError::Connect {
                url: request.url.clone(),
                message: "remote access denied".to_string(),
            },
            _ => other(format!("couldn't read file: {}", e)),
        })?;

        let mut buffer = vec![0u8; FILE_CHUNK_SIZE];
        loop {
            let read = file
                .read(&mut buffer)
                .await
                .map_err(|e| other(format!("couldn't read file: {}", e)))?;
            if read == 0 {
                break;
            }
            deliver(&request.url, sink, &buffer[..read]).await?;
        }
        Ok(None)
    }
}

#[async_trait]
impl Transport for TransferEngine {
    async fn fetch(
        &self,
        request: &TransferRequest,
        sink: &mut (dyn BodySink + Send),
    ) -> Result<Option<u16>, TransferError> {
        if request.url.starts_with("file:") {
            self.fetch_file(request, sink).await
        } else {
            self.fetch_http(request, sink).await
        }
    }
}

/// Flatten an error and its sources into one lowercase string
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text.to_lowercase()
}

fn classify(url: &str, err: &reqwest::Error) -> TransferError {
    let message = error_chain(err);
    let url = url.to_string();
    if err.is_connect() {
        let resolution = [
            "dns error",
            "failed to lookup address",
            "name or service not known",
            "no such host",
        ]
        .iter()
        .any(|needle| message.contains(needle));
        if resolution || (message.contains("proxy") && message.contains("resolve")) {
            return TransferError::Resolve { url, message };
        }
        return TransferError::Connect { url, message };
    }
    if err.is_timeout() {
        return TransferError::Other {
            url,
            message: format!("timed out: {}", message),
        };
    }
    TransferError::Other { url, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    struct AbortAfter {
        received: usize,
        limit: usize,
    }

    #[async_trait]
    impl BodySink for AbortAfter {
        async fn on_chunk(&mut self, chunk: &[u8]) -> io::Result<ControlFlow<()>> {
            self.received += chunk.len();
            if self.received >= self.limit {
                Ok(ControlFlow::Break(()))
            } else {
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    fn file_url(path: &Path) -> String {
        Url::from_file_path(path).unwrap().to_string()
    }

    #[tokio::test]
    async fn test_file_fetch_streams_whole_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data file.bin");
        let data: Vec<u8> = (0..FILE_CHUNK_SIZE * 2 + 5).map(|i| i as u8).collect();
        fs::write(&path, &data).unwrap();

        let engine = TransferEngine::new(&Config::default());
        let request = TransferRequest {
            url: file_url(&path),
            headers: Vec::new(),
            ca_bundle: None,
        };
        let mut body = Vec::new();
        let status = engine.fetch(&request, &mut body).await.unwrap();
        assert_eq!(status, None);
        assert_eq!(body, data);
    }

    #[tokio::test]
    async fn test_file_fetch_missing_is_transport_failure() {
        let dir = tempdir().unwrap();
        let engine = TransferEngine::new(&Config::default());
        let request = TransferRequest {
            url: file_url(&dir.path().join("missing.bin")),
            headers: Vec::new(),
            ca_bundle: None,
        };
        let mut body = Vec::new();
        let err = engine.fetch(&request, &mut body).await.unwrap_err();
        assert!(matches!(err, TransferError::Other { .. }));
    }

    #[tokio::test]
    async fn test_sink_abort_stops_transfer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        fs::write(&path, vec![1u8; FILE_CHUNK_SIZE * 4]).unwrap();

        let engine = TransferEngine::new(&Config::default());
        let request = TransferRequest {
            url: file_url(&path),
            headers: Vec::new(),
            ca_bundle: None,
        };
        let mut sink = AbortAfter { received: 0, limit: 1 };
        let err = engine.fetch(&request, &mut sink).await.unwrap_err();
        assert!(matches!(err, TransferError::Aborted));
        assert!(sink.received < FILE_CHUNK_SIZE * 4);
    }

    #[tokio::test]
    async fn test_unreadable_ca_bundle() {
        let dir = tempdir().unwrap();
        let engine = TransferEngine::new(&Config::default());
        let request = TransferRequest {
            url: "https://127.0.0.1:9/manifest".to_string(),
            headers: Vec::new(),
            ca_bundle: Some(dir.path().join("missing.pem")),
        };
        let mut body = Vec::new();
        let err = engine.fetch(&request, &mut body).await.unwrap_err();
        assert!(err.to_string().contains("CA bundle"));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let engine = TransferEngine::new(&Config::default());
        let request = TransferRequest {
            url: format!("http://127.0.0.1:{}/manifest", port),
            headers: Vec::new(),
            ca_bundle: None,
        };
        let mut body = Vec::new();
        let err = engine.fetch(&request, &mut body).await.unwrap_err();
        assert!(matches!(err, TransferError::Connect { .. }), "{err}");
    }
}
