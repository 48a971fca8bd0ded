use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_core::future::BoxFuture;
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use reqflow::{
    BeforeHook, CancelSignal, Client, ConstantBackoff, Error, FilePart, FormData, RateLimitPolicy,
    Request, RespBody, RetryPolicy, Transport, TransportError, TransportErrorKind,
    buffered_resp_body, with_client_trace, with_header, with_query_pair,
};

enum Outcome {
    Response {
        status: StatusCode,
        headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
    },
    TransportError(TransportErrorKind, &'static str),
    Hang,
}

impl Outcome {
    fn ok(body: &[u8]) -> Self {
        Self::status_with_body(StatusCode::OK, body)
    }

    fn status(status: StatusCode) -> Self {
        Self::status_with_body(status, b"")
    }

    fn status_with_body(status: StatusCode, body: &[u8]) -> Self {
        Self::Response {
            status,
            headers: Vec::new(),
            body: body.to_vec(),
        }
    }
}

#[derive(Default)]
struct ScriptedTransport {
    outcomes: Mutex<VecDeque<Outcome>>,
    attempts: AtomicUsize,
    seen_uris: Mutex<Vec<String>>,
    seen_bodies: Mutex<Vec<Vec<u8>>>,
    seen_headers: Mutex<Vec<http::HeaderMap>>,
    stamp_trace: bool,
}

impl ScriptedTransport {
    fn new(outcomes: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            ..Self::default()
        })
    }

    fn with_trace_stamping(outcomes: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            stamp_trace: true,
            ..Self::default()
        })
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn execute(
        &self,
        request: http::Request<reqflow::ReqBody>,
    ) -> BoxFuture<'_, Result<http::Response<RespBody>, TransportError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let recorder = request
                .extensions()
                .get::<reqflow::TraceRecorder>()
                .cloned();
            if let Some(recorder) = &recorder {
                recorder.dns_start();
                recorder.dns_done();
                recorder.conn_requested();
                recorder.connect_start();
                recorder.connect_done();
                recorder.tls_handshake_start();
                recorder.tls_handshake_done();
                recorder.conn_obtained(false, false, Duration::ZERO);
            }

            let (parts, body) = request.into_parts();
            self.seen_uris.lock().unwrap().push(parts.uri.to_string());
            self.seen_headers.lock().unwrap().push(parts.headers);
            let collected = body.collect().await.expect("request body must collect");
            self.seen_bodies
                .lock()
                .unwrap()
                .push(collected.to_bytes().to_vec());
            if let Some(recorder) = &recorder {
                recorder.request_written();
            }

            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted transport ran out of outcomes");
            match outcome {
                Outcome::Response {
                    status,
                    headers,
                    body,
                } => {
                    if let Some(recorder) = &recorder {
                        recorder.first_response_byte();
                    }
                    let mut builder = http::Response::builder().status(status);
                    for (name, value) in headers {
                        builder = builder.header(name, value);
                    }
                    Ok(builder
                        .body(buffered_resp_body(Bytes::from(body)))
                        .expect("scripted response must build"))
                }
                Outcome::TransportError(kind, message) => {
                    Err(TransportError::new(kind, message))
                }
                Outcome::Hang => futures_util::future::pending().await,
            }
        })
    }
}

fn client_with(transport: Arc<ScriptedTransport>) -> Client {
    Client::builder().transport(transport).build()
}

fn fast_retry(max_attempts: usize) -> RetryPolicy {
    RetryPolicy::standard()
        .max_attempts(max_attempts)
        .backoff(Arc::new(ConstantBackoff::new(Duration::from_millis(1), false)))
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[tokio::test]
async fn success_is_returned_without_retrying() {
    let transport = ScriptedTransport::new(vec![Outcome::ok(b"hello")]);
    let client = Client::builder()
        .transport(transport.clone())
        .retry_policy(fast_retry(3))
        .build();

    let response = client.get("http://example.test/ping", &[]).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"hello");
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test]
async fn too_many_requests_is_retried_until_success() {
    let transport = ScriptedTransport::new(vec![
        Outcome::status(StatusCode::TOO_MANY_REQUESTS),
        Outcome::status(StatusCode::TOO_MANY_REQUESTS),
        Outcome::ok(b"finally"),
    ]);
    let client = Client::builder()
        .transport(transport.clone())
        .retry_policy(fast_retry(3))
        .build();

    let response = client.get("http://example.test/busy", &[]).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(transport.attempts(), 3);
}

#[tokio::test]
async fn transport_errors_are_retried() {
    let transport = ScriptedTransport::new(vec![
        Outcome::TransportError(TransportErrorKind::Connect, "connection refused"),
        Outcome::ok(b"recovered"),
    ]);
    let client = Client::builder()
        .transport(transport.clone())
        .retry_policy(fast_retry(3))
        .build();

    let response = client.get("http://example.test/flaky", &[]).await.unwrap();
    assert_eq!(response.body().as_ref(), b"recovered");
    assert_eq!(transport.attempts(), 2);
}

#[tokio::test]
async fn exhausted_retries_return_the_last_response() {
    let transport = ScriptedTransport::new(vec![
        Outcome::status(StatusCode::TOO_MANY_REQUESTS),
        Outcome::status(StatusCode::TOO_MANY_REQUESTS),
        Outcome::status(StatusCode::TOO_MANY_REQUESTS),
        Outcome::status(StatusCode::TOO_MANY_REQUESTS),
    ]);
    let client = Client::builder()
        .transport(transport.clone())
        .retry_policy(fast_retry(3))
        .build();

    let response = client.get("http://example.test/busy", &[]).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    // max_attempts counts retries: 1 initial + 3 retries.
    assert_eq!(transport.attempts(), 4);
}

#[tokio::test]
async fn server_errors_are_not_retried_by_default() {
    let transport = ScriptedTransport::new(vec![Outcome::status(
        StatusCode::INTERNAL_SERVER_ERROR,
    )]);
    let client = Client::builder()
        .transport(transport.clone())
        .retry_policy(fast_retry(3))
        .build();

    let response = client.get("http://example.test/broken", &[]).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test]
async fn custom_triggers_extend_retries_to_5xx() {
    let transport = ScriptedTransport::new(vec![
        Outcome::status(StatusCode::BAD_GATEWAY),
        Outcome::ok(b"ok"),
    ]);
    let policy = fast_retry(3).trigger(|response, _| {
        response.is_some_and(|response| response.status().is_server_error())
    });
    let client = Client::builder()
        .transport(transport.clone())
        .retry_policy(policy)
        .build();

    let response = client.get("http://example.test/unstable", &[]).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(transport.attempts(), 2);
}

#[tokio::test]
async fn requests_can_opt_out_of_the_client_retry_policy() {
    let transport = ScriptedTransport::new(vec![Outcome::status(StatusCode::TOO_MANY_REQUESTS)]);
    let client = Client::builder()
        .transport(transport.clone())
        .retry_policy(fast_retry(3))
        .build();

    let request = Request::new(Method::GET, "http://example.test/once").no_retry();
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test]
async fn deadline_during_backoff_ends_the_call() {
    let transport = ScriptedTransport::new(vec![Outcome::status(StatusCode::TOO_MANY_REQUESTS)]);
    let policy = RetryPolicy::standard()
        .max_attempts(3)
        .backoff(Arc::new(ConstantBackoff::new(Duration::from_secs(30), false)));
    let client = Client::builder()
        .transport(transport.clone())
        .retry_policy(policy)
        .build();

    let request = Request::new(Method::GET, "http://example.test/busy")
        .cancel_signal_set(CancelSignal::with_timeout(Duration::from_millis(50)));
    let error = client.execute(request).await.unwrap_err();
    assert!(matches!(error, Error::DeadlineExceeded));
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test]
async fn explicit_cancellation_interrupts_a_hung_attempt() {
    let transport = ScriptedTransport::new(vec![Outcome::Hang]);
    let client = client_with(transport.clone());

    let cancel = CancelSignal::new();
    let request = Request::new(Method::GET, "http://example.test/slow")
        .cancel_signal_set(cancel.clone());

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let error = client.execute(request).await.unwrap_err();
    assert!(matches!(error, Error::Cancelled));
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn per_attempt_timeout_fires() {
    let transport = ScriptedTransport::new(vec![Outcome::Hang]);
    let client = client_with(transport);

    let request =
        Request::new(Method::GET, "http://example.test/slow").timeout(Duration::from_millis(50));
    let error = client.execute(request).await.unwrap_err();
    assert!(matches!(error, Error::Timeout { .. }));
}

#[tokio::test]
async fn gzip_response_bodies_are_decoded() {
    let transport = ScriptedTransport::new(vec![Outcome::Response {
        status: StatusCode::OK,
        headers: vec![("content-encoding", "gzip".to_owned())],
        body: gzip(b"compressed payload"),
    }]);
    let client = client_with(transport);

    let response = client.get("http://example.test/data", &[]).await.unwrap();
    assert_eq!(response.body().as_ref(), b"compressed payload");
    assert!(response.headers().get("content-encoding").is_none());
}

#[tokio::test]
async fn corrupt_gzip_bodies_fail_the_call() {
    let transport = ScriptedTransport::new(vec![Outcome::Response {
        status: StatusCode::OK,
        headers: vec![("content-encoding", "gzip".to_owned())],
        body: b"this is not gzip".to_vec(),
    }]);
    let client = client_with(transport);

    let error = client.get("http://example.test/data", &[]).await.unwrap_err();
    assert!(matches!(error, Error::DecodeContentEncoding { .. }));
}

#[tokio::test]
async fn oversized_response_bodies_are_rejected() {
    let transport = ScriptedTransport::new(vec![Outcome::ok(&vec![0_u8; 4096])]);
    let client = Client::builder()
        .transport(transport)
        .max_response_body_bytes(1024)
        .build();

    let error = client.get("http://example.test/huge", &[]).await.unwrap_err();
    assert!(matches!(error, Error::ResponseBodyTooLarge { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_gate_bounds_requests_in_flight() {
    struct CountingTransport {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Transport for CountingTransport {
        fn execute(
            &self,
            _request: http::Request<reqflow::ReqBody>,
        ) -> BoxFuture<'_, Result<http::Response<RespBody>, TransportError>> {
            Box::pin(async move {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(25)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(http::Response::builder()
                    .status(StatusCode::OK)
                    .body(buffered_resp_body(Bytes::new()))
                    .expect("response must build"))
            })
        }
    }

    let transport = Arc::new(CountingTransport {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let client = Arc::new(
        Client::builder()
            .transport(transport.clone())
            .max_concurrency(2)
            .build(),
    );

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            client.get("http://example.test/slot", &[]).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(transport.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn rate_limited_clients_still_complete_their_calls() {
    let transport = ScriptedTransport::new(vec![Outcome::ok(b"a"), Outcome::ok(b"b")]);
    let client = Client::builder()
        .transport(transport.clone())
        .enable_rate_limiting(RateLimitPolicy::standard().requests_per_second(1000.0).burst(2))
        .build();

    client.get("http://example.test/1", &[]).await.unwrap();
    client.get("http://example.test/2", &[]).await.unwrap();
    assert_eq!(transport.attempts(), 2);
}

#[tokio::test]
async fn failing_before_hook_aborts_without_attempts_or_after_hooks() {
    let transport = ScriptedTransport::new(vec![Outcome::ok(b"unreached")]);
    let after_ran = Arc::new(AtomicUsize::new(0));
    let after_ran_probe = Arc::clone(&after_ran);

    let client = Client::builder()
        .transport(transport.clone())
        .before_hook(BeforeHook::func(|_request| {
            Err(Error::Cancelled)
        }))
        .after_hook(reqflow::AfterHook::func(move |_response, _error| {
            after_ran_probe.fetch_add(1, Ordering::SeqCst);
        }))
        .build();

    let error = client.get("http://example.test/gated", &[]).await.unwrap_err();
    assert!(matches!(error, Error::Cancelled));
    assert_eq!(transport.attempts(), 0);
    assert_eq!(after_ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn after_hooks_observe_failures() {
    let transport = ScriptedTransport::new(vec![Outcome::TransportError(
        TransportErrorKind::Dns,
        "no such host",
    )]);
    let observed = Arc::new(Mutex::new(None));
    let observed_probe = Arc::clone(&observed);

    let client = Client::builder()
        .transport(transport)
        .after_hook(reqflow::AfterHook::func(move |response, error| {
            *observed_probe.lock().unwrap() =
                Some((response.is_some(), error.map(|error| error.code())));
        }))
        .build();

    client.get("http://example.test/missing", &[]).await.unwrap_err();
    let observed = observed.lock().unwrap().clone();
    assert_eq!(observed, Some((false, Some(reqflow::ErrorCode::Transport))));
}

#[tokio::test]
async fn hooks_run_in_registration_order() {
    let transport = ScriptedTransport::new(vec![Outcome::ok(b"")]);
    let order = Arc::new(Mutex::new(Vec::new()));

    let note = |tag: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
        let order = Arc::clone(order);
        move || order.lock().unwrap().push(tag)
    };
    let before_a = note("before-a", &order);
    let before_b = note("before-b", &order);
    let after_a = note("after-a", &order);
    let after_b = note("after-b", &order);

    let client = Client::builder()
        .transport(transport)
        .before_hook(BeforeHook::func(move |_| {
            before_a();
            Ok(())
        }))
        .before_hook(BeforeHook::func(move |_| {
            before_b();
            Ok(())
        }))
        .after_hook(reqflow::AfterHook::func(move |_, _| after_a()))
        .after_hook(reqflow::AfterHook::func(move |_, _| after_b()))
        .build();

    client.get("http://example.test/ordered", &[]).await.unwrap();
    assert_eq!(
        *order.lock().unwrap(),
        vec!["before-a", "before-b", "after-a", "after-b"]
    );
}

#[tokio::test]
async fn streaming_bodies_are_captured_and_replayed_across_retries() {
    let transport = ScriptedTransport::new(vec![
        Outcome::status(StatusCode::TOO_MANY_REQUESTS),
        Outcome::ok(b"done"),
    ]);
    let client = Client::builder()
        .transport(transport.clone())
        .retry_policy(fast_retry(3))
        .build();

    let request = Request::new(Method::POST, "http://example.test/upload")
        .body_reader(std::io::Cursor::new(b"streamed payload".to_vec()));
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bodies = transport.seen_bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0], b"streamed payload");
    assert_eq!(bodies[1], b"streamed payload");
}

#[tokio::test]
async fn request_hooks_shape_the_outgoing_request() {
    let transport = ScriptedTransport::new(vec![Outcome::ok(b"")]);
    let client = client_with(transport.clone());

    client
        .get(
            "http://example.test/search",
            &[
                with_query_pair("q", "form data"),
                with_header("x-request-id", "req-1"),
            ],
        )
        .await
        .unwrap();

    let uris = transport.seen_uris.lock().unwrap().clone();
    assert_eq!(uris, vec!["http://example.test/search?q=form+data".to_owned()]);
    let headers = transport.seen_headers.lock().unwrap();
    assert_eq!(headers[0].get("x-request-id").unwrap(), "req-1");
}

#[tokio::test]
async fn client_trace_rides_on_the_response_when_enabled() {
    let transport = ScriptedTransport::with_trace_stamping(vec![
        Outcome::ok(b"traced"),
        Outcome::ok(b"untraced"),
    ]);
    let client = client_with(transport);

    let traced = client
        .get("http://example.test/t", &[with_client_trace()])
        .await
        .unwrap();
    let info = traced.trace_info().expect("trace must be recorded");
    assert!(info.total_time >= info.server_time);
    assert!(info.total_time >= info.conn_time);
    assert!(info.conn_time >= info.tcp_conn_time);

    let untraced = client.get("http://example.test/u", &[]).await.unwrap();
    assert!(untraced.trace_info().is_none());
}

#[derive(Clone, Default)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl Write for SharedWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn debugger_dumps_request_and_response() {
    let transport = ScriptedTransport::new(vec![Outcome::ok(b"pong")]);
    let sink = SharedWriter::default();
    let client = Client::builder()
        .transport(transport)
        .enable_debugging(sink.clone(), true)
        .build();

    client.get("http://example.test/ping", &[]).await.unwrap();

    let dumped = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
    assert!(dumped.contains("> GET /ping HTTP/1.1\r\n"));
    assert!(dumped.contains("> Host: example.test\r\n"));
    assert!(dumped.contains("< HTTP/1.1 200 OK\r\n"));
    assert!(dumped.contains("pong"));
}

#[tokio::test]
async fn multipart_requests_stream_an_encoded_body() {
    let transport = ScriptedTransport::new(vec![Outcome::ok(b"")]);
    let client = client_with(transport.clone());

    let form = FormData::new()
        .field("note", "from the tests")
        .field("tag", "integration")
        .file(
            "report",
            FilePart::from_reader(std::io::Cursor::new(b"report body".to_vec()))
                .with_filename("report.txt")
                .with_mime("text/plain"),
        )
        .file(
            "attachment",
            FilePart::from_reader(std::io::Cursor::new(b"attachment body".to_vec()))
                .with_filename("extra.bin"),
        );
    let content_type = form.content_type();
    let request = Request::new(Method::POST, "http://example.test/upload")
        .multipart(form)
        .unwrap();
    client.execute(request).await.unwrap();

    let headers = transport.seen_headers.lock().unwrap();
    assert_eq!(
        headers[0].get("content-type").unwrap().to_str().unwrap(),
        content_type
    );
    let bodies = transport.seen_bodies.lock().unwrap();
    let body = String::from_utf8(bodies[0].clone()).unwrap();

    // Files in configuration order, then fields, then the terminator;
    // the second file's content type is sniffed from its bytes.
    let boundary = content_type.split_once("boundary=").unwrap().1;
    let expected = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"report\"; filename=\"report.txt\"\r\nContent-Type: text/plain\r\n\r\nreport body\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"attachment\"; filename=\"extra.bin\"\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nattachment body\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nfrom the tests\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"tag\"\r\n\r\nintegration\r\n\
         --{b}--\r\n",
        b = boundary
    );
    assert_eq!(body, expected);
}
