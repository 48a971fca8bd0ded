use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http_body_util::BodyExt;
use tracing::{debug, warn};

use crate::body::{
    ReadBodyError, RequestBody, buffered_req_body, build_http_request, read_all_body_limited,
};
use crate::dump::Debugger;
use crate::error::Error;
use crate::hooks::{AfterHook, BeforeHook, BeforeRequestHook};
use crate::limit::{ConcurrencyGate, RateGate, RateLimitPolicy};
use crate::request::{Request, RequestHook};
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::trace::ClientTrace;
use crate::transcode::{
    DecodeContentEncodingError, decode_content_encoded_body_limited,
    should_decode_content_encoded_body,
};
use crate::transport::{HyperTransport, Transport};

const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Configures and builds a [`Client`].
pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    attempt_timeout: Duration,
    max_response_body_bytes: usize,
    retry_policy: Option<RetryPolicy>,
    before_hooks: Vec<BeforeHook>,
    after_hooks: Vec<AfterHook>,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            transport: None,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            retry_policy: None,
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
        }
    }

    /// Swaps the wire implementation. Defaults to the bundled
    /// [`HyperTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Timeout applied to each attempt individually.
    pub fn attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    /// Default retry policy for requests that do not set their own.
    /// Without one, requests are single-attempt unless they opt in.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn before_hook(mut self, hook: BeforeHook) -> Self {
        self.before_hooks.push(hook);
        self
    }

    pub fn after_hook(mut self, hook: AfterHook) -> Self {
        self.after_hooks.push(hook);
        self
    }

    /// Admits requests through a shared token bucket before they hit
    /// the wire.
    pub fn enable_rate_limiting(mut self, policy: RateLimitPolicy) -> Self {
        let gate = Arc::new(RateGate::new(policy));
        self.before_hooks
            .push(BeforeHook::callback(gate as Arc<dyn BeforeRequestHook>));
        self
    }

    /// Caps the number of calls in flight; a permit is held from
    /// admission until the call's after-hooks run.
    ///
    /// Register this after any before-hook that can fail: a failing
    /// before-hook aborts the call without running after-hooks, which
    /// would strand a permit acquired earlier in the hook list.
    pub fn max_concurrency(mut self, max_in_flight: usize) -> Self {
        let gate = Arc::new(ConcurrencyGate::new(max_in_flight));
        self.before_hooks.push(BeforeHook::callback(gate.clone()));
        self.after_hooks.push(AfterHook::callback(gate));
        self
    }

    /// Dumps requests and responses to `out` in a curl-verbose style.
    pub fn enable_debugging<W>(mut self, out: W, with_body: bool) -> Self
    where
        W: Write + Send + 'static,
    {
        let debugger = Arc::new(Debugger::new(out, with_body));
        self.before_hooks
            .push(BeforeHook::callback(debugger.clone()));
        self.after_hooks.push(AfterHook::callback(debugger));
        self
    }

    pub fn build(self) -> Client {
        Client {
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(HyperTransport::new())),
            attempt_timeout: self.attempt_timeout,
            max_response_body_bytes: self.max_response_body_bytes,
            retry_policy: self.retry_policy,
            before_hooks: self.before_hooks,
            after_hooks: self.after_hooks,
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes [`Request`]s through a fixed pipeline: before-hooks (in
/// registration order), then the attempt/retry loop over the
/// transport, then after-hooks. After-hooks run on success and on
/// failure alike; a failing before-hook aborts the call before any
/// attempt and skips the after-hooks.
pub struct Client {
    transport: Arc<dyn Transport>,
    attempt_timeout: Duration,
    max_response_body_bytes: usize,
    retry_policy: Option<RetryPolicy>,
    before_hooks: Vec<BeforeHook>,
    after_hooks: Vec<AfterHook>,
}

impl Client {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub async fn get(&self, url: &str, hooks: &[RequestHook]) -> Result<Response, Error> {
        self.send(Method::GET, url, hooks).await
    }

    pub async fn head(&self, url: &str, hooks: &[RequestHook]) -> Result<Response, Error> {
        self.send(Method::HEAD, url, hooks).await
    }

    pub async fn post(&self, url: &str, hooks: &[RequestHook]) -> Result<Response, Error> {
        self.send(Method::POST, url, hooks).await
    }

    pub async fn put(&self, url: &str, hooks: &[RequestHook]) -> Result<Response, Error> {
        self.send(Method::PUT, url, hooks).await
    }

    pub async fn patch(&self, url: &str, hooks: &[RequestHook]) -> Result<Response, Error> {
        self.send(Method::PATCH, url, hooks).await
    }

    pub async fn delete(&self, url: &str, hooks: &[RequestHook]) -> Result<Response, Error> {
        self.send(Method::DELETE, url, hooks).await
    }

    pub async fn options(&self, url: &str, hooks: &[RequestHook]) -> Result<Response, Error> {
        self.send(Method::OPTIONS, url, hooks).await
    }

    /// Builds a request for `method`/`url`, shapes it with the given
    /// hooks in order, and executes it.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        hooks: &[RequestHook],
    ) -> Result<Response, Error> {
        let mut request = Request::new(method, url);
        for hook in hooks {
            request = hook(request)?;
        }
        self.execute(request).await
    }

    /// Runs one request through the full pipeline.
    pub async fn execute(&self, mut request: Request) -> Result<Response, Error> {
        for hook in &self.before_hooks {
            hook.enter(&mut request).await?;
        }

        let retry_policy = self.effective_retry_policy(&request);
        if let Some(policy) = &retry_policy {
            if policy.max_attempts_configured() > 0 && request.body_ref().is_streaming() {
                self.capture_streaming_body(&mut request).await?;
            }
        }

        let result = self.execute_with_retry(&mut request, retry_policy.as_ref()).await;

        for hook in &self.after_hooks {
            hook.exit(result.as_ref().ok(), result.as_ref().err());
        }
        result
    }

    fn effective_retry_policy(&self, request: &Request) -> Option<RetryPolicy> {
        if request.retry_disabled() {
            return None;
        }
        request
            .retry_policy_override()
            .or(self.retry_policy.as_ref())
            .cloned()
    }

    /// A streaming body cannot be replayed, so a retryable request
    /// buffers it up front.
    async fn capture_streaming_body(&self, request: &mut Request) -> Result<(), Error> {
        let RequestBody::Streaming(body) = request.take_body() else {
            return Ok(());
        };
        let collected = body
            .collect()
            .await
            .map_err(|source| Error::BodyCapture { source })?;
        request.set_body(RequestBody::Buffered(collected.to_bytes()));
        Ok(())
    }

    async fn execute_with_retry(
        &self,
        request: &mut Request,
        retry_policy: Option<&RetryPolicy>,
    ) -> Result<Response, Error> {
        let cancel = request.cancel_signal().clone();
        let mut attempt_num = 0_usize;

        loop {
            let result = self.execute_attempt(request).await;

            let should_retry = retry_policy.is_some_and(|policy| {
                policy.should_retry(
                    &cancel,
                    attempt_num,
                    result.as_ref().ok(),
                    result.as_ref().err(),
                )
            });
            if !should_retry {
                return result;
            }

            let policy = match retry_policy {
                Some(policy) => policy,
                None => return result,
            };
            let sleep = policy.wait(attempt_num, result.as_ref().ok(), result.as_ref().err());
            debug!(
                attempt = attempt_num,
                sleep_ms = sleep.as_millis() as u64,
                method = %request.method(),
                url = request.url(),
                "retrying request"
            );

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = cancel.cancelled() => {
                    warn!(
                        attempt = attempt_num,
                        method = %request.method(),
                        url = request.url(),
                        "request cancelled while waiting to retry"
                    );
                    return Err(cancel.cancellation_error());
                }
            }
            attempt_num += 1;
        }
    }

    async fn execute_attempt(&self, request: &mut Request) -> Result<Response, Error> {
        let cancel = request.cancel_signal().clone();
        if cancel.is_cancelled() {
            return Err(cancel.cancellation_error());
        }

        let uri = request.resolve_uri()?;
        let method = request.method().clone();
        // A buffered body is cloned so further attempts can replay it;
        // a streaming body is single-shot and taken outright (retries
        // are only entered with a buffered body).
        let body = match request.take_body() {
            RequestBody::Buffered(bytes) => {
                request.set_body(RequestBody::Buffered(bytes.clone()));
                buffered_req_body(bytes)
            }
            RequestBody::Streaming(body) => body,
        };

        let mut http_request = build_http_request(method.clone(), uri, request.headers(), body)?;
        let trace = request.trace_enabled().then(ClientTrace::begin);
        if let Some(trace) = &trace {
            http_request.extensions_mut().insert(trace.recorder());
        }

        let timeout = request.attempt_timeout().unwrap_or(self.attempt_timeout);
        let attempt = async {
            let http_response = self
                .transport
                .execute(http_request)
                .await
                .map_err(|error| Error::Transport {
                    kind: error.kind,
                    source: error.source,
                })?;

            let (parts, body) = http_response.into_parts();
            let raw_body = read_all_body_limited(body, self.max_response_body_bytes)
                .await
                .map_err(|error| match error {
                    ReadBodyError::Read(source) => Error::ReadBody { source },
                    ReadBodyError::TooLarge { actual_bytes } => Error::ResponseBodyTooLarge {
                        limit_bytes: self.max_response_body_bytes,
                        actual_bytes,
                    },
                })?;

            let mut headers = parts.headers;
            let body = if should_decode_content_encoded_body(&method, parts.status, raw_body.len())
            {
                let (decoded, changed) = decode_content_encoded_body_limited(
                    raw_body,
                    &headers,
                    self.max_response_body_bytes,
                )
                .map_err(|error| match error {
                    DecodeContentEncodingError::Decode { encoding, message } => {
                        Error::DecodeContentEncoding { encoding, message }
                    }
                    DecodeContentEncodingError::TooLarge { actual_bytes } => {
                        Error::ResponseBodyTooLarge {
                            limit_bytes: self.max_response_body_bytes,
                            actual_bytes,
                        }
                    }
                })?;
                if changed {
                    headers.remove(CONTENT_ENCODING);
                    headers.remove(CONTENT_LENGTH);
                }
                decoded
            } else {
                raw_body
            };

            Ok(Response::from_parts(parts.status, headers, body, None))
        };

        let mut result = tokio::select! {
            outcome = tokio::time::timeout(timeout, attempt) => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    timeout_ms: timeout.as_millis(),
                }),
            },
            _ = cancel.cancelled() => Err(cancel.cancellation_error()),
        };

        if let (Some(trace), Ok(response)) = (&trace, result.as_mut()) {
            response.set_trace(trace.finish());
        }
        result
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
