//! `reqflow` is an HTTP client convenience layer: a request execution
//! pipeline with admission gates, retries with pluggable backoff,
//! connection tracing, streaming multipart uploads, and curl-style
//! debugging, over a swappable transport.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqflow::prelude::{Client, RateLimitPolicy, RetryPolicy};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct CreateItemResponse {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .attempt_timeout(Duration::from_secs(5))
//!         .retry_policy(RetryPolicy::standard().max_attempts(3))
//!         .enable_rate_limiting(RateLimitPolicy::standard().requests_per_second(20.0))
//!         .max_concurrency(8)
//!         .build();
//!
//!     let created: CreateItemResponse = client
//!         .execute(
//!             reqflow::Request::new(http::Method::POST, "https://api.example.com/v1/items")
//!                 .json(&serde_json::json!({ "name": "demo" }))?,
//!         )
//!         .await?
//!         .json()?;
//!
//!     println!("created id={}", created.id);
//!     Ok(())
//! }
//! ```
//!
//! # Pipeline
//!
//! Every call runs before-hooks (admission gates, debugger) in
//! registration order, then the attempt/retry loop, then after-hooks
//! regardless of outcome. Retries only fire for transport errors and
//! 429 responses unless custom triggers are installed.

mod backoff;
mod body;
mod client;
mod dump;
mod error;
mod hooks;
mod limit;
mod multipart;
mod request;
mod response;
mod retry;
mod trace;
mod transcode;
mod transport;
mod util;

pub use crate::backoff::{Backoff, ConstantBackoff, ExponentialBackoff, FibonacciBackoff};
pub use crate::body::{ReqBody, RespBody, buffered_resp_body, stream_req_body};
pub use crate::client::{Client, ClientBuilder};
pub use crate::dump::Debugger;
pub use crate::error::{Error, ErrorCode, TransportErrorKind};
pub use crate::hooks::{AfterHook, AfterResponseHook, BeforeHook, BeforeRequestHook};
pub use crate::limit::{ConcurrencyGate, RateGate, RateLimitPolicy};
pub use crate::multipart::{FilePart, FormData};
pub use crate::request::{
    CancelSignal, Request, RequestHook, with_body, with_cancel_signal, with_client_trace,
    with_form, with_header, with_json, with_no_retry, with_query, with_query_pair,
    with_retry_policy, with_timeout,
};
pub use crate::response::Response;
pub use crate::retry::{RetryPolicy, RetryTrigger};
pub use crate::trace::{TraceInfo, TraceRecorder};
pub use crate::transport::{HyperTransport, Transport, TransportError};

pub type ReqflowResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Backoff, CancelSignal, Client, ConstantBackoff, Error, ErrorCode, ExponentialBackoff,
        FibonacciBackoff, FilePart, FormData, HyperTransport, RateLimitPolicy, ReqflowResult,
        Request, Response, RetryPolicy, TraceInfo, Transport, TransportErrorKind,
    };
}
