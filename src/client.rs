use std::time::Duration;

use bytes::Bytes;
use hyper::{
    client::HttpConnector,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    Body, Client, Method, Request, Response, StatusCode,
};
use hyper_rustls::HttpsConnector;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::common::TimeoutOptions;

/// Low level failure of an HTTP exchange.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Hyper(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),
}

/// Shared HTTP client for every endpoint the probe talks to.
///
/// Reaches both `https://` storage endpoints and plain `http://` loopback
/// endpoints. Cloning is cheap and shares the connection pool.
#[derive(Clone)]
pub struct HttpClient {
    inner: Client<HttpsConnector<HttpConnector>, Body>,
    timeout_options: TimeoutOptions,
}

impl HttpClient {
    pub fn new(timeout_options: TimeoutOptions) -> Self {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(timeout_options.connect_timeout));
        http.enforce_http(false);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let inner = Client::builder()
            .pool_idle_timeout(timeout_options.idle_timeout)
            .build(https);

        Self {
            inner,
            timeout_options,
        }
    }

    pub fn timeout_options(&self) -> &TimeoutOptions {
        &self.timeout_options
    }

    /// Send a request and wait for the response head.
    pub async fn send(&self, req: Request<Body>) -> Result<Response<Body>, ClientError> {
        let request_timeout = self.timeout_options.request_timeout;
        debug!("Sending {} {}", req.method(), req.uri());
        match timeout(request_timeout, self.inner.request(req)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ClientError::Timeout(request_timeout)),
        }
    }

    /// POST a JSON body and collect the full response.
    pub async fn post_json(
        &self,
        url: &str,
        body: Vec<u8>,
    ) -> Result<(StatusCode, Bytes), ClientError> {
        let req = Request::builder()
            .method(Method::POST)
            .uri(url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, body.len())
            .body(Body::from(body))?;

        let request_timeout = self.timeout_options.request_timeout;
        let exchange = async {
            let resp = self.inner.request(req).await?;
            let status = resp.status();
            let body = hyper::body::to_bytes(resp.into_body()).await?;
            Ok::<_, hyper::Error>((status, body))
        };
        match timeout(request_timeout, exchange).await {
            Ok(result) => {
                let (status, body) = result?;
                debug!("POST {} answered {} with {} bytes", url, status, body.len());
                Ok((status, body))
            }
            Err(_) => Err(ClientError::Timeout(request_timeout)),
        }
    }
}
