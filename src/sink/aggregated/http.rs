//! Shared plumbing for the HTTP exporters.

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::warn;

/// Builds the reqwest client used by one exporter.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("metricsense/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building HTTP client")
}

/// Sends a request and reports whether the server accepted it.
///
/// Transport errors and non-2xx statuses are logged, never returned.
pub async fn send(exporter: &'static str, request: reqwest::RequestBuilder) -> bool {
    let resp = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(exporter, error = %e, "HTTP export request failed");
            return false;
        }
    };

    let status = resp.status();
    if status.is_success() {
        return true;
    }

    let body = resp.text().await.unwrap_or_default();
    warn!(
        exporter,
        %status,
        body = %truncate(&body, 512),
        "HTTP export unexpected status",
    );

    false
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Compresses data using the specified algorithm.
pub fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "" | "none" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zlib" => compress_zlib(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
pub fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zlib" => Some("deflate"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}

#[cfg(test)]
pub(crate) mod testing {
    //! Local HTTP endpoint that records what exporters send.

    use std::sync::Arc;

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, Method, StatusCode, Uri};
    use axum::Router;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    pub struct Captured {
        pub method: Method,
        pub path: String,
        pub headers: HeaderMap,
        pub body: Bytes,
    }

    #[derive(Clone)]
    struct CaptureState {
        requests: Arc<Mutex<Vec<Captured>>>,
        status: StatusCode,
    }

    /// Serves every request with `status` and returns the base URL plus the
    /// request log.
    pub async fn capture_server(status: StatusCode) -> (String, Arc<Mutex<Vec<Captured>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = CaptureState {
            requests: Arc::clone(&requests),
            status,
        };

        let app = Router::new().fallback(capture).with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        (format!("http://{addr}"), requests)
    }

    async fn capture(
        State(state): State<CaptureState>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        state.requests.lock().push(Captured {
            method,
            path: uri.path().to_string(),
            headers,
            body,
        });
        state.status
    }
}
