//! Data File Fetcher
//!
//! Downloads rule data over HTTP(S) with conditional `If-None-Match`
//! requests. Built directly on hyper's HTTP/1.1 connection API with
//! rustls for TLS.

use crate::config::FetchConfig;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Bytes;
use hyper::header::{ETAG, HOST, IF_NONE_MATCH, LOCATION, USER_AGENT};
use hyper::{Request, StatusCode, Uri};
use rustls::ClientConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

const MAX_REDIRECTS: usize = 5;

/// Download errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Body read error: {0}")]
    Body(String),

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("Empty response body")]
    EmptyBody,

    #[error("Too many redirects")]
    TooManyRedirects,
}

/// Result of one conditional download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// New content, with the server's entity tag if it sent one
    Fresh { body: Bytes, etag: Option<String> },
    /// The cached copy is still current (HTTP 304)
    NotModified,
}

/// Something that can download a data file
pub trait Fetcher: Send + Sync {
    /// GET `url`, sending `etag` as `If-None-Match` when given
    fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
    ) -> impl Future<Output = Result<FetchOutcome, FetchError>> + Send;
}

/// Fetcher speaking HTTP/1.1 over plain TCP or rustls
pub struct HttpFetcher {
    config: FetchConfig,
    tls: TlsConnector,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    async fn fetch_following(&self, url: &str, etag: Option<&str>) -> Result<FetchOutcome, FetchError> {
        let mut current = url.to_string();
        for _ in 0..=MAX_REDIRECTS {
            let uri: Uri = current
                .parse()
                .map_err(|e: hyper::http::uri::InvalidUri| FetchError::InvalidUrl(e.to_string()))?;

            let (status, location, response_etag, body) = self.get_once(&uri, etag).await?;
            match status {
                StatusCode::NOT_MODIFIED => return Ok(FetchOutcome::NotModified),
                StatusCode::OK if body.is_empty() => return Err(FetchError::EmptyBody),
                StatusCode::OK => return Ok(FetchOutcome::Fresh { body, etag: response_etag }),
                s if s.is_redirection() => {
                    let location = location.ok_or(FetchError::Status(s.as_u16()))?;
                    current = resolve_location(&current, &location)?;
                    debug!("Following redirect to {}", current);
                }
                s => return Err(FetchError::Status(s.as_u16())),
            }
        }
        Err(FetchError::TooManyRedirects)
    }

    async fn get_once(
        &self,
        uri: &Uri,
        etag: Option<&str>,
    ) -> Result<(StatusCode, Option<String>, Option<String>, Bytes), FetchError> {
        let host = uri
            .host()
            .ok_or_else(|| FetchError::InvalidUrl("No host in URL".to_string()))?;
        let is_https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => return Err(FetchError::InvalidUrl(format!("unsupported scheme {:?}", other))),
        };
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

        let mut builder = Request::get(uri.clone())
            .header(USER_AGENT, &self.config.user_agent)
            .header(HOST, host);
        if let Some(etag) = etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        let request = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| FetchError::Http(e.to_string()))?;

        let stream = tokio::net::TcpStream::connect((host, port))
            .await
            .map_err(|e| FetchError::ConnectionFailed(e.to_string()))?;

        let sent = if is_https {
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| FetchError::Tls("Invalid server name".to_string()))?;
            let tls_stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| FetchError::Tls(e.to_string()))?;

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| FetchError::Http(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    warn!("Connection error: {}", e);
                }
            });
            sender.send_request(request).await
        } else {
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| FetchError::Http(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    warn!("Connection error: {}", e);
                }
            });
            sender.send_request(request).await
        };
        let response = sent.map_err(|e| FetchError::Http(e.to_string()))?;

        let status = response.status();
        let header = |name: hyper::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v: &hyper::header::HeaderValue| v.to_str().ok())
                .map(str::to_string)
        };
        let location = header(LOCATION);
        let response_etag = header(ETAG);

        let body = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?
            .to_bytes();

        Ok((status, location, response_etag, body))
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, etag: Option<&str>) -> Result<FetchOutcome, FetchError> {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.config.timeout(), self.fetch_following(url, etag))
            .await
            .map_err(|_| FetchError::Timeout)??;

        match &outcome {
            FetchOutcome::Fresh { body, .. } => {
                debug!("GET {} -> {} bytes in {:?}", url, body.len(), start.elapsed())
            }
            FetchOutcome::NotModified => debug!("GET {} -> not modified", url),
        }
        Ok(outcome)
    }
}

fn resolve_location(base: &str, location: &str) -> Result<String, FetchError> {
    let base = url::Url::parse(base).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
    base.join(location)
        .map(String::from)
        .map_err(|e| FetchError::InvalidUrl(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response per connection and return the request
    /// heads seen
    async fn serve(responses: Vec<&'static str>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap();
                seen.push(String::from_utf8_lossy(&buf[..n]).to_string());
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            seen
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_fresh_download_with_etag() {
        let (base, server) = serve(vec![
            "HTTP/1.1 200 OK\r\nETag: \"v1\"\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        ])
        .await;

        let fetcher = HttpFetcher::new(FetchConfig::default());
        let outcome = fetcher.fetch(&format!("{}/list.txt", base), None).await.unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Fresh {
                body: Bytes::from_static(b"hello"),
                etag: Some("\"v1\"".to_string())
            }
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_conditional_request_not_modified() {
        let (base, server) = serve(vec![
            "HTTP/1.1 304 Not Modified\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ])
        .await;

        let fetcher = HttpFetcher::new(FetchConfig::default());
        let outcome = fetcher.fetch(&format!("{}/list.txt", base), Some("\"v1\"")).await.unwrap();
        assert_eq!(outcome, FetchOutcome::NotModified);

        let seen = server.await.unwrap();
        assert!(seen[0].to_ascii_lowercase().contains("if-none-match: \"v1\""));
    }

    #[tokio::test]
    async fn test_error_status() {
        let (base, server) = serve(vec![
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ])
        .await;

        let fetcher = HttpFetcher::new(FetchConfig::default());
        let result = fetcher.fetch(&format!("{}/list.txt", base), None).await;
        assert!(matches!(result, Err(FetchError::Status(500))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_only_200_with_a_body_is_fresh() {
        let (base, server) = serve(vec![
            "HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n",
            "HTTP/1.1 200 OK\r\nETag: \"v2\"\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ])
        .await;

        let fetcher = HttpFetcher::new(FetchConfig::default());
        let url = format!("{}/list.txt", base);
        assert!(matches!(fetcher.fetch(&url, None).await, Err(FetchError::Status(204))));
        assert!(matches!(fetcher.fetch(&url, None).await, Err(FetchError::EmptyBody)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_scheme() {
        let fetcher = HttpFetcher::new(FetchConfig::default());
        let result = fetcher.fetch("ftp://lists.example/a.txt", None).await;
        assert!(matches!(result, Err(FetchError::InvalidUrl(_))));
    }

    #[test]
    fn test_resolve_location() {
        assert_eq!(
            resolve_location("https://a.example/x/list.txt", "/y/list.txt").unwrap(),
            "https://a.example/y/list.txt"
        );
    }
}
