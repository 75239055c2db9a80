use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_RANGE, RANGE, USER_AGENT};
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

use crate::plugins::registry::{DriverContext, RangeFetcher, RangeResponse};

#[derive(thiserror::Error, Debug)]
pub enum HttpDriverError {
    #[error("server answered range start {got}, asked for {asked}")]
    RangeMismatch { asked: u64, got: u64 },

    #[error("requested offset {0} is beyond the end of the resource")]
    RangeNotSatisfiable(u64),

    #[error("http status error: {0}")]
    Status(StatusCode),

    #[error("no data from server for {0}s")]
    Stalled(u64),
}

impl HttpDriverError {
    /// Worth another attempt: overloaded server or a silent connection.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpDriverError::Status(s) => {
                *s == StatusCode::TOO_MANY_REQUESTS || *s == StatusCode::REQUEST_TIMEOUT || s.is_server_error()
            }
            HttpDriverError::Stalled(_) => true,
            _ => false,
        }
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    ctx: DriverContext,
}

impl HttpFetcher {
    /// `timeout_secs` bounds connecting, waiting for headers and each gap between
    /// body chunks. A healthy transfer may take as long as it needs.
    pub fn new(ctx: DriverContext) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(ctx.timeout_secs))
            .build()?;
        Ok(Self { client, ctx })
    }

    fn idle(&self) -> Duration {
        Duration::from_secs(self.ctx.timeout_secs)
    }

    fn build_headers(ctx: &DriverContext) -> anyhow::Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&ctx.user_agent)?);
        // byte offsets must refer to the stored representation
        h.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        for (k, v) in &ctx.headers {
            let name = HeaderName::from_bytes(k.as_bytes())?;
            let value = HeaderValue::from_str(v)?;
            h.insert(name, value);
        }
        Ok(h)
    }

    /// `bytes 100-199/1000` -> (100, Some(1000)); `bytes */1000` -> (None, Some(1000)).
    fn parse_content_range(v: &str) -> Option<(Option<u64>, Option<u64>)> {
        let rest = v.trim().strip_prefix("bytes")?.trim_start();
        let (span, total) = rest.split_once('/')?;
        let total = total.trim().parse::<u64>().ok();
        let start = match span.trim() {
            "*" => None,
            s => Some(s.split_once('-')?.0.trim().parse::<u64>().ok()?),
        };
        Some((start, total))
    }

    fn content_range(resp: &reqwest::Response) -> Option<(Option<u64>, Option<u64>)> {
        resp.headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse_content_range)
    }
}

#[async_trait]
impl RangeFetcher for HttpFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, url: &Url, start: u64) -> anyhow::Result<RangeResponse> {
        let mut req = self
            .client
            .get(url.clone())
            .headers(Self::build_headers(&self.ctx)?);
        if start > 0 {
            req = req.header(RANGE, format!("bytes={}-", start));
        }

        let resp = tokio::time::timeout(self.idle(), req.send())
            .await
            .map_err(|_| HttpDriverError::Stalled(self.ctx.timeout_secs))??;
        let status = resp.status();
        tracing::debug!(%url, start, %status, "range fetch");

        match status {
            StatusCode::PARTIAL_CONTENT => {
                if let Some((Some(got), _)) = Self::content_range(&resp) {
                    if got != start {
                        return Err(HttpDriverError::RangeMismatch { asked: start, got }.into());
                    }
                }
                Ok(RangeResponse {
                    declared_len: resp.content_length(),
                    resumed: true,
                    body: idle_limited(resp.bytes_stream(), self.idle()),
                })
            }

            // range ignored (or fresh request): the full resource follows
            StatusCode::OK => Ok(RangeResponse {
                declared_len: resp.content_length(),
                resumed: start == 0,
                body: idle_limited(resp.bytes_stream(), self.idle()),
            }),

            StatusCode::RANGE_NOT_SATISFIABLE if start > 0 => {
                // `bytes */N` with N == start: nothing left to send
                match Self::content_range(&resp) {
                    Some((None, Some(total))) if total == start => Ok(RangeResponse {
                        declared_len: Some(0),
                        resumed: true,
                        body: stream::empty::<anyhow::Result<Bytes>>().boxed(),
                    }),
                    _ => Err(HttpDriverError::RangeNotSatisfiable(start).into()),
                }
            }

            s => Err(HttpDriverError::Status(s).into()),
        }
    }
}

/// Fails the stream when no chunk arrives within `idle`; ends it after the first error.
fn idle_limited<S>(body: S, idle: Duration) -> BoxStream<'static, anyhow::Result<Bytes>>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    stream::unfold(Some(body.boxed()), move |state| async move {
        let mut body = state?;
        match tokio::time::timeout(idle, body.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(body))),
            Ok(Some(Err(e))) => Some((Err(anyhow::Error::from(e)), None)),
            Ok(None) => None,
            Err(_) => Some((Err(HttpDriverError::Stalled(idle.as_secs()).into()), None)),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn collect(resp: RangeResponse) -> Vec<u8> {
        let chunks: Vec<Bytes> = resp.body.try_collect().await.unwrap();
        chunks.concat()
    }

    #[test]
    fn parses_content_range_forms() {
        assert_eq!(HttpFetcher::parse_content_range("bytes 100-199/1000"), Some((Some(100), Some(1000))));
        assert_eq!(HttpFetcher::parse_content_range("bytes */1000"), Some((None, Some(1000))));
        assert_eq!(HttpFetcher::parse_content_range("bytes 0-9/*"), Some((Some(0), None)));
        assert_eq!(HttpFetcher::parse_content_range("items 1-2/3"), None);
    }

    #[tokio::test]
    async fn fresh_fetch_returns_full_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/verse/1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
            .mount(&server)
            .await;

        let f = HttpFetcher::new(DriverContext::default()).unwrap();
        let url = Url::parse(&format!("{}/verse/1", server.uri())).unwrap();
        let resp = f.fetch(&url, 0).await.unwrap();

        assert!(resp.resumed);
        assert_eq!(resp.declared_len, Some(10));
        assert_eq!(collect(resp).await, b"0123456789");
    }

    #[tokio::test]
    async fn resumed_fetch_sends_range_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/verse/2"))
            .and(header("range", "bytes=4-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 4-9/10")
                    .set_body_bytes(b"456789".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let f = HttpFetcher::new(DriverContext::default()).unwrap();
        let url = Url::parse(&format!("{}/verse/2", server.uri())).unwrap();
        let resp = f.fetch(&url, 4).await.unwrap();

        assert!(resp.resumed);
        assert_eq!(resp.declared_len, Some(6));
        assert_eq!(collect(resp).await, b"456789");
    }

    #[tokio::test]
    async fn ignored_range_is_flagged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/verse/3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abcdef".to_vec()))
            .mount(&server)
            .await;

        let f = HttpFetcher::new(DriverContext::default()).unwrap();
        let url = Url::parse(&format!("{}/verse/3", server.uri())).unwrap();
        let resp = f.fetch(&url, 3).await.unwrap();
        assert!(!resp.resumed);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let f = HttpFetcher::new(DriverContext::default()).unwrap();
        let url = Url::parse(&format!("{}/verse/404", server.uri())).unwrap();
        let err = f.fetch(&url, 0).await.err().unwrap();
        let http = err.downcast_ref::<HttpDriverError>().unwrap();
        assert!(matches!(http, HttpDriverError::Status(StatusCode::NOT_FOUND)));
        assert!(!http.is_transient());
    }

    #[tokio::test]
    async fn unsatisfiable_range_at_end_means_nothing_left() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(416).insert_header("content-range", "bytes */10"))
            .mount(&server)
            .await;

        let f = HttpFetcher::new(DriverContext::default()).unwrap();
        let url = Url::parse(&format!("{}/verse/5", server.uri())).unwrap();
        let resp = f.fetch(&url, 10).await.unwrap();
        assert_eq!(resp.declared_len, Some(0));
        assert!(collect(resp).await.is_empty());
    }

    /// Answers one request with `len` bytes written in `pieces` steps, `gap` apart.
    async fn trickle_server(len: usize, pieces: usize, gap: Duration) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n");
            sock.write_all(head.as_bytes()).await.unwrap();
            let piece = vec![b'x'; len / pieces];
            for _ in 0..pieces {
                tokio::time::sleep(gap).await;
                if sock.write_all(&piece).await.is_err() {
                    return;
                }
                let _ = sock.flush().await;
            }
        });
        Url::parse(&format!("http://{addr}/verse/1")).unwrap()
    }

    fn short_timeout() -> DriverContext {
        DriverContext { timeout_secs: 1, ..DriverContext::default() }
    }

    #[tokio::test]
    async fn slow_but_steady_body_outlives_the_timeout() {
        let url = trickle_server(30, 3, Duration::from_millis(700)).await;

        let f = HttpFetcher::new(short_timeout()).unwrap();
        let resp = f.fetch(&url, 0).await.unwrap();

        assert_eq!(collect(resp).await.len(), 30);
    }

    #[tokio::test]
    async fn silent_connection_fails_the_body() {
        let url = trickle_server(20, 2, Duration::from_millis(2500)).await;

        let f = HttpFetcher::new(short_timeout()).unwrap();
        let resp = f.fetch(&url, 0).await.unwrap();
        let err = resp.body.try_collect::<Vec<Bytes>>().await.unwrap_err();

        let http = err.downcast_ref::<HttpDriverError>().unwrap();
        assert!(matches!(http, HttpDriverError::Stalled(1)));
        assert!(http.is_transient());
    }

    #[tokio::test]
    async fn partial_content_at_wrong_offset_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=4-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-9/10")
                    .set_body_bytes(b"0123456789".to_vec()),
            )
            .mount(&server)
            .await;

        let f = HttpFetcher::new(DriverContext::default()).unwrap();
        let url = Url::parse(&format!("{}/verse/6", server.uri())).unwrap();
        let err = f.fetch(&url, 4).await.err().unwrap();

        assert!(matches!(
            err.downcast_ref::<HttpDriverError>(),
            Some(HttpDriverError::RangeMismatch { asked: 4, got: 0 })
        ));
    }

    #[tokio::test]
    async fn unsatisfiable_range_short_of_the_offset_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(416).insert_header("content-range", "bytes */10"))
            .mount(&server)
            .await;

        let f = HttpFetcher::new(DriverContext::default()).unwrap();
        let url = Url::parse(&format!("{}/verse/7", server.uri())).unwrap();
        let err = f.fetch(&url, 12).await.err().unwrap();

        assert!(matches!(
            err.downcast_ref::<HttpDriverError>(),
            Some(HttpDriverError::RangeNotSatisfiable(12))
        ));
    }
}
