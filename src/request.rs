use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_core::Stream;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method, Uri};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::body::{RequestBody, stream_req_body};
use crate::error::Error;
use crate::multipart::FormData;
use crate::retry::RetryPolicy;
use crate::util::{append_query_pairs, parse_header_name, parse_header_value};

/// Cooperative cancellation handle for a single call. Carries an
/// explicit cancel token plus an optional absolute deadline; every
/// waiting point in the pipeline (admission gates, attempts, backoff
/// sleeps) observes both.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Resolves when the call is cancelled or its deadline passes.
    /// Pends forever on a plain signal with neither.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                let deadline = tokio::time::Instant::from_std(deadline);
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// The error that describes why this signal fired. Explicit
    /// cancellation wins over the deadline when both apply.
    pub(crate) fn cancellation_error(&self) -> Error {
        if self.token.is_cancelled() {
            return Error::Cancelled;
        }
        if self
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            return Error::DeadlineExceeded;
        }
        Error::Cancelled
    }
}

/// One outgoing call: method, target, headers, body, and the per-call
/// knobs (cancellation, retry override, tracing, attempt timeout).
///
/// Built with [`Request::new`] plus chained setters, or shaped by
/// [`RequestHook`]s when going through the [`Client`](crate::Client)
/// verb shortcuts.
pub struct Request {
    method: Method,
    url: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: RequestBody,
    cancel: CancelSignal,
    retry_policy: Option<RetryPolicy>,
    retry_disabled: bool,
    trace_enabled: bool,
    attempt_timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::empty(),
            cancel: CancelSignal::new(),
            retry_policy: None,
            retry_disabled: false,
            trace_enabled: false,
            attempt_timeout: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn content_type(self, value: &str) -> Result<Self, Error> {
        let value = parse_header_value("content-type", value)?;
        Ok(self.header(CONTENT_TYPE, value))
    }

    pub fn user_agent(self, value: &str) -> Result<Self, Error> {
        let value = parse_header_value("user-agent", value)?;
        Ok(self.header(USER_AGENT, value))
    }

    pub fn bearer_auth(self, token: &str) -> Result<Self, Error> {
        let value = parse_header_value("authorization", &format!("Bearer {token}"))?;
        Ok(self.header(AUTHORIZATION, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query<T>(mut self, params: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|source| Error::SerializeQuery { source })?;
        self.query_pairs.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Buffered(body.into());
        self
    }

    pub fn body_stream<S, E>(mut self, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.body = RequestBody::Streaming(stream_req_body(stream));
        self
    }

    pub fn body_reader<R>(self, reader: R) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        self.body_stream(ReaderStream::new(reader))
    }

    pub fn json<T>(self, payload: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let body =
            serde_json::to_vec(payload).map_err(|source| Error::SerializeJson { source })?;
        Ok(self
            .body(Bytes::from(body))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn form<T>(self, payload: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(payload)
            .map_err(|source| Error::SerializeForm { source })?;
        Ok(self.body(Bytes::from(encoded)).header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        ))
    }

    /// Attaches a streaming multipart/form-data body. Part bytes are
    /// produced lazily once the transport starts reading.
    pub fn multipart(self, form: FormData) -> Result<Self, Error> {
        let content_type = parse_header_value("content-type", &form.content_type())?;
        Ok(self
            .body_reader(form)
            .header(CONTENT_TYPE, content_type))
    }

    pub fn cancel_signal_set(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overrides the client's retry policy for this call.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self.retry_disabled = false;
        self
    }

    /// Forces a single attempt regardless of the client's policy.
    pub fn no_retry(mut self) -> Self {
        self.retry_policy = None;
        self.retry_disabled = true;
        self
    }

    /// Enables connection-level tracing; the resulting
    /// [`TraceInfo`](crate::TraceInfo) rides on the response.
    pub fn enable_client_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    /// Per-attempt timeout override.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub(crate) fn trace_enabled(&self) -> bool {
        self.trace_enabled
    }

    pub(crate) fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    pub(crate) fn retry_policy_override(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub(crate) fn retry_disabled(&self) -> bool {
        self.retry_disabled
    }

    pub(crate) fn body_ref(&self) -> &RequestBody {
        &self.body
    }

    pub(crate) fn take_body(&mut self) -> RequestBody {
        std::mem::replace(&mut self.body, RequestBody::empty())
    }

    pub(crate) fn set_body(&mut self, body: RequestBody) {
        self.body = body;
    }

    pub(crate) fn resolve_uri(&self) -> Result<Uri, Error> {
        let full = append_query_pairs(&self.url, &self.query_pairs);
        full.parse::<Uri>()
            .map_err(|_| Error::InvalidUri { uri: full })
    }
}

/// Per-call request mutation applied by the verb shortcuts before the
/// client's before-hooks run.
pub type RequestHook = Arc<dyn Fn(Request) -> Result<Request, Error> + Send + Sync>;

pub fn with_header(name: impl Into<String>, value: impl Into<String>) -> RequestHook {
    let (name, value) = (name.into(), value.into());
    Arc::new(move |request| request.try_header(&name, &value))
}

pub fn with_query_pair(name: impl Into<String>, value: impl Into<String>) -> RequestHook {
    let (name, value) = (name.into(), value.into());
    Arc::new(move |request| Ok(request.query_pair(name.clone(), value.clone())))
}

pub fn with_query<T>(params: &T) -> Result<RequestHook, Error>
where
    T: Serialize + ?Sized,
{
    let encoded =
        serde_urlencoded::to_string(params).map_err(|source| Error::SerializeQuery { source })?;
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(encoded.as_bytes())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    Ok(Arc::new(move |mut request| {
        for (name, value) in &pairs {
            request = request.query_pair(name.clone(), value.clone());
        }
        Ok(request)
    }))
}

pub fn with_body(body: impl Into<Bytes>) -> RequestHook {
    let body = body.into();
    Arc::new(move |request| Ok(request.body(body.clone())))
}

pub fn with_json<T>(payload: &T) -> Result<RequestHook, Error>
where
    T: Serialize + ?Sized,
{
    // Serialized eagerly so the hook itself stays infallible and cheap.
    let body = serde_json::to_vec(payload).map_err(|source| Error::SerializeJson { source })?;
    let body = Bytes::from(body);
    Ok(Arc::new(move |request| {
        Ok(request.body(body.clone()).header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        ))
    }))
}

pub fn with_form<T>(payload: &T) -> Result<RequestHook, Error>
where
    T: Serialize + ?Sized,
{
    let encoded =
        serde_urlencoded::to_string(payload).map_err(|source| Error::SerializeForm { source })?;
    let body = Bytes::from(encoded);
    Ok(Arc::new(move |request| {
        Ok(request.body(body.clone()).header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        ))
    }))
}

pub fn with_timeout(timeout: Duration) -> RequestHook {
    Arc::new(move |request| Ok(request.timeout(timeout)))
}

pub fn with_retry_policy(retry_policy: RetryPolicy) -> RequestHook {
    Arc::new(move |request| Ok(request.retry_policy(retry_policy.clone())))
}

pub fn with_no_retry() -> RequestHook {
    Arc::new(|request| Ok(request.no_retry()))
}

pub fn with_client_trace() -> RequestHook {
    Arc::new(|request| Ok(request.enable_client_trace()))
}

pub fn with_cancel_signal(cancel: CancelSignal) -> RequestHook {
    Arc::new(move |request| Ok(request.cancel_signal_set(cancel.clone())))
}
