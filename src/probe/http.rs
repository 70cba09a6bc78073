//! HTTP probe implementation.

use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::{Duration, Instant};

use super::{ProbeError, ProbeOutcome, Prober};

/// Probes URLs with a single GET through a shared client.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: Client,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;
        Ok(Self::with_client(client, timeout))
    }

    /// Wrap an existing client; `timeout` should match the one it was built with.
    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the probe, returning the status code and latency in milliseconds.
    ///
    /// Any status code counts as a response; latency covers the full body.
    pub async fn run_http_probe(&self, address: &str) -> Result<(u16, u64), ProbeError> {
        let url = parse_probe_url(address)?;

        let start = Instant::now();

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify_error(e))?;
        let status = response.status().as_u16();

        // Read the full body to measure complete transfer time
        let _body = response
            .bytes()
            .await
            .map_err(|e| self.classify_error(e))?;

        Ok((status, start.elapsed().as_millis() as u64))
    }

    fn classify_error(&self, e: reqwest::Error) -> ProbeError {
        if e.is_timeout() {
            ProbeError::Timeout(self.timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        match self.run_http_probe(url).await {
            Ok((status_code, elapsed_millis)) => ProbeOutcome::Responded {
                status_code,
                elapsed_millis,
            },
            Err(e) => e.into(),
        }
    }
}

fn parse_probe_url(address: &str) -> Result<Url, ProbeError> {
    let url = Url::parse(address).map_err(|e| ProbeError::InvalidUrl(format!("{}: {}", address, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ProbeError::InvalidUrl(format!("unsupported scheme {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use std::net::SocketAddr;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn local_prober(timeout: Duration) -> HttpProber {
        let client = Client::builder().timeout(timeout).no_proxy().build().unwrap();
        HttpProber::with_client(client, timeout)
    }

    fn fixture() -> Router {
        Router::new()
            .route("/ok", get(|| async { "fine" }))
            .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "nope") }))
            .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            )
    }

    #[tokio::test]
    async fn test_http_probe_success() {
        let addr = serve(fixture()).await;
        let prober = local_prober(Duration::from_secs(2));

        match prober.probe(&format!("http://{}/ok", addr)).await {
            ProbeOutcome::Responded { status_code, .. } => assert_eq!(status_code, 200),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_probe_error_statuses_are_responses() {
        let addr = serve(fixture()).await;
        let prober = local_prober(Duration::from_secs(2));

        for (path, code) in [("missing", 404), ("broken", 500)] {
            match prober.probe(&format!("http://{}/{}", addr, path)).await {
                ProbeOutcome::Responded { status_code, .. } => assert_eq!(status_code, code),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_http_probe_timeout() {
        let addr = serve(fixture()).await;
        let prober = local_prober(Duration::from_millis(200));

        let start = Instant::now();
        let result = prober.run_http_probe(&format!("http://{}/slow", addr)).await;
        assert!(matches!(result, Err(ProbeError::Timeout(_))), "{:?}", result);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let prober = local_prober(Duration::from_secs(2));
        let outcome = prober.probe(&format!("http://{}/", addr)).await;
        assert!(matches!(outcome, ProbeOutcome::Failed { .. }), "{:?}", outcome);
    }

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let prober = HttpProber::new(Duration::from_millis(100)).unwrap();

        for bad in ["not a url", "ftp://example.com/file", "example.com"] {
            let result = prober.run_http_probe(bad).await;
            assert!(matches!(result, Err(ProbeError::InvalidUrl(_))), "{}: {:?}", bad, result);
        }
    }
}
