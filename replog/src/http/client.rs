//! HTTP client side: replicate calls and catch-up range reads.
//!
//! Each request opens a fresh connection, performs the HTTP/1.1 handshake,
//! drives the connection in a background task and collects the body. The
//! whole exchange runs under the client's deadline on its [`TimeProvider`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tracing::debug;

use super::join_url;
use crate::config::{ReplicaEndpoint, SecondaryConfig};
use crate::error::TransportError;
use crate::time::{TimeProvider, TokioTimeProvider};
use crate::transport::{MasterSource, ReplicaTransport};
use crate::types::{LogEntry, RangeQuery, ReplicateAck};

/// Minimal JSON-over-HTTP/1.1 client.
#[derive(Debug, Clone)]
pub struct HttpClient<P = TokioTimeProvider> {
    timeout: Duration,
    time: P,
}

impl HttpClient<TokioTimeProvider> {
    /// Create a client whose requests fail with [`TransportError::Timeout`]
    /// after `timeout` of tokio time.
    pub fn new(timeout: Duration) -> Self {
        Self::with_time(timeout, TokioTimeProvider::new())
    }
}

impl<P: TimeProvider> HttpClient<P> {
    /// Create a client whose deadlines are measured by `time`.
    pub fn with_time(timeout: Duration, time: P) -> Self {
        Self { timeout, time }
    }

    /// Per-request deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `GET url` and decode the JSON response.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, TransportError> {
        let body = self.send(Method::GET, url, Bytes::new()).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// `POST url` with a JSON body and decode the JSON response.
    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, TransportError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let payload = Bytes::from(serde_json::to_vec(body)?);
        let body = self.send(Method::POST, url, payload).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn send(&self, method: Method, url: &str, body: Bytes) -> Result<Bytes, TransportError> {
        self.time
            .timeout(self.timeout, self.exchange(method, url, body))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn exchange(
        &self,
        method: Method,
        url: &str,
        body: Bytes,
    ) -> Result<Bytes, TransportError> {
        let uri: Uri = url
            .parse()
            .map_err(|e| TransportError::Http(format!("invalid url {url:?}: {e}")))?;
        let authority = uri
            .authority()
            .ok_or_else(|| TransportError::Http(format!("url {url:?} has no host")))?
            .clone();
        let addr = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TransportError::Unreachable(format!("{addr}: {e}")))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "http connection closed with error");
            }
        });

        let path = uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .to_string();
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, authority.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let res = sender
            .send_request(req)
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = res.status();
        let body = res
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }
}

/// [`ReplicaTransport`] that POSTs entries to `{replica.url}/replicate`.
#[derive(Debug, Clone)]
pub struct HttpReplicaTransport<P = TokioTimeProvider> {
    client: HttpClient<P>,
}

impl<P: TimeProvider> HttpReplicaTransport<P> {
    /// Create a transport on top of `client`.
    pub fn new(client: HttpClient<P>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<P: TimeProvider> ReplicaTransport for HttpReplicaTransport<P> {
    async fn replicate(
        &self,
        replica: &ReplicaEndpoint,
        entry: &LogEntry,
    ) -> Result<ReplicateAck, TransportError> {
        self.client
            .post_json(&join_url(&replica.url, "/replicate"), entry)
            .await
    }
}

/// [`MasterSource`] that reads `{master_url}/entries`.
#[derive(Debug, Clone)]
pub struct HttpMasterSource<P = TokioTimeProvider> {
    client: HttpClient<P>,
    master_url: String,
}

impl<P: TimeProvider> HttpMasterSource<P> {
    /// Read from the master at `master_url`.
    pub fn new(client: HttpClient<P>, master_url: impl Into<String>) -> Self {
        Self {
            client,
            master_url: master_url.into(),
        }
    }

    /// Read from `config.master_url` with `config.request_timeout` per page.
    pub fn for_secondary(config: &SecondaryConfig, time: P) -> Self {
        Self::new(
            HttpClient::with_time(config.request_timeout, time),
            config.master_url.clone(),
        )
    }
}

#[async_trait]
impl<P: TimeProvider> MasterSource for HttpMasterSource<P> {
    async fn fetch_entries(&self, query: RangeQuery) -> Result<Vec<LogEntry>, TransportError> {
        let url = join_url(
            &self.master_url,
            &format!("/entries?from_seq={}&limit={}", query.from_seq, query.limit),
        );
        self.client.get_json(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeError;
    use std::future::Future;
    use std::sync::{Arc, Mutex};

    /// Clock whose deadlines have always already passed.
    #[derive(Clone, Default)]
    struct ExpiredClock {
        deadlines: Arc<Mutex<Vec<Duration>>>,
    }

    #[async_trait]
    impl TimeProvider for ExpiredClock {
        async fn sleep(&self, _duration: Duration) {}

        fn now(&self) -> Duration {
            Duration::ZERO
        }

        async fn timeout<F, T>(&self, duration: Duration, _future: F) -> Result<T, TimeError>
        where
            F: Future<Output = T> + Send,
            T: Send,
        {
            self.deadlines.lock().expect("lock").push(duration);
            Err(TimeError::Elapsed)
        }
    }

    #[tokio::test]
    async fn test_deadline_goes_through_time_provider() {
        let clock = ExpiredClock::default();
        let client = HttpClient::with_time(Duration::from_millis(750), clock.clone());
        let err = client
            .get_json::<serde_json::Value>("http://127.0.0.1:9/status")
            .await
            .expect_err("deadline passed");
        assert_eq!(err, TransportError::Timeout);
        assert_eq!(
            *clock.deadlines.lock().expect("lock"),
            vec![Duration::from_millis(750)]
        );
    }

    #[test]
    fn test_catch_up_source_uses_configured_timeout() {
        let config = SecondaryConfig::new("s1")
            .with_master_url("http://m:8000")
            .with_request_timeout(Duration::from_millis(1500));
        let source = HttpMasterSource::for_secondary(&config, TokioTimeProvider::new());
        assert_eq!(source.client.timeout(), Duration::from_millis(1500));
        assert_eq!(source.master_url, "http://m:8000");
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = HttpClient::new(Duration::from_secs(1));
        let err = client
            .get_json::<serde_json::Value>(&format!("http://{addr}/status"))
            .await
            .expect_err("nothing listening");
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let client = HttpClient::new(Duration::from_secs(5));
        let err = client
            .get_json::<serde_json::Value>("/no-host")
            .await
            .expect_err("no host");
        assert!(matches!(err, TransportError::Http(_)));
    }
}
