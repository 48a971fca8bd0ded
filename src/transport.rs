use std::time::Duration;

use futures_core::future::BoxFuture;
use http_body_util::BodyExt;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::body::{ReqBody, RespBody};
use crate::error::{BoxError, TransportErrorKind};
use crate::trace::TraceRecorder;

const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Failure raised by a [`Transport`], before any retry decision.
#[derive(Debug)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }
}

/// The wire seam: turns one prepared HTTP request into one HTTP
/// response. Implementations perform no retries, no admission and no
/// body decoding; the executor owns all of that. A [`TraceRecorder`]
/// may ride in the request extensions; transports stamp the phases
/// they can observe and ignore the rest.
pub trait Transport: Send + Sync {
    fn execute(
        &self,
        request: http::Request<ReqBody>,
    ) -> BoxFuture<'_, Result<http::Response<RespBody>, TransportError>>;
}

fn classify_hyper_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    if error.is_connect() {
        let text = error.to_string().to_ascii_lowercase();
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    let text = error.to_string().to_ascii_lowercase();
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}

/// The bundled transport: a pooled hyper client over rustls with the
/// webpki root store, speaking HTTP/1.1 and HTTP/2 to both https and
/// plain http origins.
pub struct HyperTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, ReqBody>,
}

impl HyperTransport {
    pub fn new() -> Self {
        Self::with_pool_options(DEFAULT_POOL_IDLE_TIMEOUT, DEFAULT_POOL_MAX_IDLE_PER_HOST)
    }

    pub fn with_pool_options(
        pool_idle_timeout: Duration,
        pool_max_idle_per_host: usize,
    ) -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(pool_idle_timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build(https);
        Self { client }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HyperTransport {
    fn execute(
        &self,
        request: http::Request<ReqBody>,
    ) -> BoxFuture<'_, Result<http::Response<RespBody>, TransportError>> {
        let recorder = request.extensions().get::<TraceRecorder>().cloned();
        Box::pin(async move {
            // The pool hides dial and handshake details; the recorder
            // gets the phases visible from here.
            if let Some(recorder) = &recorder {
                recorder.conn_requested();
                recorder.request_written();
            }
            let response = self.client.request(request).await.map_err(|error| {
                TransportError::new(classify_hyper_error(&error), error)
            })?;
            if let Some(recorder) = &recorder {
                recorder.conn_obtained(false, false, Duration::ZERO);
                recorder.first_response_byte();
            }
            Ok(response.map(|body| body.map_err(|error| Box::new(error) as BoxError).boxed()))
        })
    }
}
