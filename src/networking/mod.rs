use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use log::{debug, warn};
use reqwest::Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::{SyncError, SyncResult};

pub const DISTRIBUTION_HEADER: &str = "X-Distribution";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// GET `url` with the cache-busting `t=<unix millis>` parameter appended.
    pub fn get(url: &str) -> Self {
        Self {
            url: cache_busted(url),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// The body of a 2xx response; anything else maps onto an error kind.
    pub fn into_body(self, url: &str) -> SyncResult<Vec<u8>> {
        if (200..300).contains(&self.status) {
            Ok(self.body)
        } else {
            Err(SyncError::from_status(url, self.status))
        }
    }
}

/// The narrow HTTP surface the sync engine depends on.
pub trait Transport: Send + Sync + 'static {
    /// Fetch a small document into memory. Connection failures are `NetworkTransient`.
    fn get(&self, request: HttpRequest) -> impl Future<Output = SyncResult<HttpResponse>> + Send;

    /// Stream a response body into `dest`, returning the bytes written.
    fn download(
        &self,
        request: HttpRequest,
        dest: &Path,
    ) -> impl Future<Output = SyncResult<u64>> + Send;
}

pub fn cache_busted(url: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}t={}", Utc::now().timestamp_millis())
}

/// Join a content root and a manifest-relative path.
pub fn join_url(base: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }

    fn request(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }
}

impl Transport for HttpTransport {
    fn get(&self, request: HttpRequest) -> impl Future<Output = SyncResult<HttpResponse>> + Send {
        let builder = self.request(&request);
        async move {
            let response = builder.send().await.map_err(|e| {
                SyncError::NetworkTransient(format!("GET {} failed: {e}", request.url))
            })?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|e| SyncError::NetworkTransient(format!("body read error: {e}")))?;
            debug!("http: GET {} -> {} ({} bytes)", request.url, status, body.len());
            Ok(HttpResponse {
                status,
                body: body.to_vec(),
            })
        }
    }

    fn download(
        &self,
        request: HttpRequest,
        dest: &Path,
    ) -> impl Future<Output = SyncResult<u64>> + Send {
        let builder = self.request(&request);
        let dest = dest.to_path_buf();
        async move {
            let response = builder.send().await.map_err(|e| {
                SyncError::NetworkTransient(format!("download request failed: {e}"))
            })?;
            let status = response.status();
            if !status.is_success() {
                return Err(SyncError::from_status(&request.url, status.as_u16()));
            }

            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SyncError::io("create download dir", e))?;
            }
            let mut file = File::create(&dest)
                .await
                .map_err(|e| SyncError::io("create file", e))?;

            let total = response.content_length();
            let mut stream = response.bytes_stream();
            let mut downloaded: u64 = 0;
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|e| SyncError::NetworkTransient(format!("stream error: {e}")))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| SyncError::io("write error", e))?;
                downloaded += chunk.len() as u64;
            }
            file.flush()
                .await
                .map_err(|e| SyncError::io("flush error", e))?;

            if let Some(total) = total
                && downloaded < total
            {
                return Err(SyncError::NetworkTransient(format!(
                    "download incomplete: received {downloaded} of {total} bytes"
                )));
            }
            Ok(downloaded)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_cache_buster() {
        let busted = cache_busted("https://cdn.example/app/manifest.json");
        assert!(busted.starts_with("https://cdn.example/app/manifest.json?t="));
        assert!(busted["https://cdn.example/app/manifest.json?t=".len()..]
            .parse::<i64>()
            .is_ok());
        assert!(cache_busted("https://cdn.example/a?v=2").contains("?v=2&t="));
    }

    #[test]
    fn joins_urls_without_double_slashes() {
        assert_eq!(
            join_url("https://cdn.example/app/", "/img/a.png"),
            "https://cdn.example/app/img/a.png"
        );
        assert_eq!(join_url("https://cdn.example/app", "a.js"), "https://cdn.example/app/a.js");
    }

    #[test]
    fn non_success_status_maps_to_error_kind() {
        let ok = HttpResponse {
            status: 200,
            body: b"{}".to_vec(),
        };
        assert_eq!(ok.into_body("u").unwrap(), b"{}");
        let missing = HttpResponse {
            status: 404,
            body: Vec::new(),
        };
        assert_eq!(missing.into_body("u"), Err(SyncError::NotFound("u".into())));
        let busy = HttpResponse {
            status: 502,
            body: Vec::new(),
        };
        assert!(busy.into_body("u").unwrap_err().is_retryable());
    }

    #[test]
    fn attaches_headers() {
        let request = HttpRequest::get("https://cdn.example/configuration.json")
            .with_header(DISTRIBUTION_HEADER, "store-a");
        assert_eq!(
            request.headers,
            vec![("X-Distribution".to_owned(), "store-a".to_owned())]
        );
    }
}
