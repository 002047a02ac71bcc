use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::redirect;
use thiserror::Error;

/// Response bodies are captured up to this bound; the remainder is drained so
/// the connection can be reused.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

pub const MAX_REDIRECTS: usize = 5;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Per-run request decoration produced by the pre-hook.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub cookie: Option<String>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to build HTTP client: {source}")]
    Build {
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Clone, Debug)]
pub struct ProbeResponse {
    pub status: u16,
    pub content_length: i64,
    pub body: Vec<u8>,
}

/// Pooled transport shared by all workers. Proxy configuration comes from the
/// environment (reqwest default) and HTTP/2 is attempted via ALPN. The
/// redirect policy is fixed at construction: 3xx responses surface verbatim,
/// or redirects are followed up to [`MAX_REDIRECTS`] hops and then fail.
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(timeout: Duration, follow_redirects: bool) -> Result<Self, ClientError> {
        let redirect_policy = if follow_redirects {
            redirect::Policy::limited(MAX_REDIRECTS)
        } else {
            redirect::Policy::none()
        };

        let client = reqwest::Client::builder()
            .user_agent(concat!("delver/", env!("CARGO_PKG_VERSION")))
            .redirect(redirect_policy)
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(100)
            .tcp_keepalive(TCP_KEEPALIVE)
            .build()
            .map_err(|e| ClientError::Build { source: e })?;

        Ok(Self { client })
    }

    /// Issues a request with a hard per-request deadline. The body is read up
    /// to [`MAX_BODY_BYTES`]; `content_length` mirrors the Content-Length
    /// header when present, otherwise the bytes actually read.
    pub async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        deadline: Duration,
        options: &RequestOptions,
    ) -> Result<ProbeResponse, reqwest::Error> {
        let mut builder = self.client.request(method, url).timeout(deadline);

        if let Some(cookie) = &options.cookie {
            builder = builder.header(reqwest::header::COOKIE, cookie);
        }
        for (name, value) in &options.headers {
            builder = builder.header(name, value);
        }

        let mut resp = builder.send().await?;
        let status = resp.status().as_u16();
        let header_length: Option<i64> = resp.content_length().and_then(|v| i64::try_from(v).ok());

        let mut body = Vec::new();
        let mut read_total: i64 = 0;
        while let Some(chunk) = resp.chunk().await? {
            read_total += chunk.len() as i64;
            if body.len() < MAX_BODY_BYTES {
                let take = (MAX_BODY_BYTES - body.len()).min(chunk.len());
                body.extend_from_slice(&chunk[..take]);
            }
            // keep draining past the cap so the connection can be reused
        }

        Ok(ProbeResponse {
            status,
            content_length: header_length.unwrap_or(read_total),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use warp::Filter;

    #[tokio::test]
    async fn passes_status_and_body_through() {
        let route = warp::path("hello").map(|| warp::reply::with_status("hi", warp::http::StatusCode::OK));
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let client = HttpClient::new(Duration::from_secs(5), false).unwrap();
        let resp = client
            .request(
                reqwest::Method::GET,
                &format!("http://{addr}/hello"),
                Duration::from_secs(5),
                &RequestOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hi");
        assert_eq!(resp.content_length, 2);
    }

    #[tokio::test]
    async fn redirects_surface_verbatim_when_not_following() {
        let route = warp::path("from").map(|| {
            warp::reply::with_header(
                warp::reply::with_status("", warp::http::StatusCode::FOUND),
                "location",
                "/to",
            )
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let client = HttpClient::new(Duration::from_secs(5), false).unwrap();
        let resp = client
            .request(
                reqwest::Method::GET,
                &format!("http://{addr}/from"),
                Duration::from_secs(5),
                &RequestOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status, 302);
    }

    #[tokio::test]
    async fn redirects_are_followed_when_enabled() {
        let from = warp::path("from").map(|| {
            warp::reply::with_header(
                warp::reply::with_status("", warp::http::StatusCode::FOUND),
                "location",
                "/to",
            )
        });
        let to = warp::path("to").map(|| "landed");
        let (addr, server) = warp::serve(from.or(to)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let client = HttpClient::new(Duration::from_secs(5), true).unwrap();
        let resp = client
            .request(
                reqwest::Method::GET,
                &format!("http://{addr}/from"),
                Duration::from_secs(5),
                &RequestOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"landed");
    }

    #[tokio::test]
    async fn cookie_and_extra_headers_are_injected() {
        let route = warp::path("echo")
            .and(warp::header::optional::<String>("cookie"))
            .and(warp::header::optional::<String>("x-delver-token"))
            .map(|cookie: Option<String>, token: Option<String>| {
                format!(
                    "{}|{}",
                    cookie.unwrap_or_default(),
                    token.unwrap_or_default()
                )
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let mut options = RequestOptions {
            cookie: Some("session=abc".to_string()),
            headers: BTreeMap::new(),
        };
        options
            .headers
            .insert("X-Delver-Token".to_string(), "t0k3n".to_string());

        let client = HttpClient::new(Duration::from_secs(5), false).unwrap();
        let resp = client
            .request(
                reqwest::Method::GET,
                &format!("http://{addr}/echo"),
                Duration::from_secs(5),
                &options,
            )
            .await
            .unwrap();

        assert_eq!(resp.body, b"session=abc|t0k3n");
    }

    #[tokio::test]
    async fn body_is_capped_at_one_mebibyte() {
        let route = warp::path("big").map(|| "x".repeat(MAX_BODY_BYTES + 4096));
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let client = HttpClient::new(Duration::from_secs(10), false).unwrap();
        let resp = client
            .request(
                reqwest::Method::GET,
                &format!("http://{addr}/big"),
                Duration::from_secs(10),
                &RequestOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(resp.body.len(), MAX_BODY_BYTES);
        assert_eq!(resp.content_length, (MAX_BODY_BYTES + 4096) as i64);
    }

    #[tokio::test]
    async fn per_request_deadline_aborts_slow_responses() {
        let route = warp::path("slow").and_then(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, std::convert::Infallible>("late")
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let client = HttpClient::new(Duration::from_secs(5), false).unwrap();
        let err = client
            .request(
                reqwest::Method::GET,
                &format!("http://{addr}/slow"),
                Duration::from_millis(50),
                &RequestOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn bytes_read_are_reported_when_the_header_is_absent() {
        // minimal HTTP/1.0-style server: no Content-Length, body ends at EOF
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.0 200 OK\r\nConnection: close\r\n\r\nraw body")
                    .await;
                let _ = socket.shutdown().await;
            }
        });

        let client = HttpClient::new(Duration::from_secs(5), false).unwrap();
        let resp = client
            .request(
                reqwest::Method::GET,
                &format!("http://{addr}/"),
                Duration::from_secs(5),
                &RequestOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"raw body");
        assert_eq!(resp.content_length, 8);
    }
}
