use std::convert::Infallible;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use http::{HeaderMap, Method, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;

use crate::error::{BoxError, Error};

/// Request body handed to a [`Transport`](crate::transport::Transport).
pub type ReqBody = BoxBody<Bytes, BoxError>;
/// Response body a [`Transport`](crate::transport::Transport) yields.
pub type RespBody = BoxBody<Bytes, BoxError>;

/// Body attached to a [`Request`](crate::request::Request). Buffered
/// bodies can be replayed across retry attempts; streaming bodies are
/// single-shot unless the executor captures them up front.
pub enum RequestBody {
    Buffered(Bytes),
    Streaming(ReqBody),
}

impl RequestBody {
    pub fn empty() -> Self {
        Self::Buffered(Bytes::new())
    }

    pub(crate) fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }
}

fn map_infallible_to_box_error(never: Infallible) -> BoxError {
    match never {}
}

pub(crate) fn buffered_req_body(body: Bytes) -> ReqBody {
    Full::new(body).map_err(map_infallible_to_box_error).boxed()
}

pub fn stream_req_body<S, E>(stream: S) -> ReqBody
where
    S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    BodyExt::boxed(StreamBody::new(stream.map(|item| {
        item.map(Frame::data)
            .map_err(|error| Box::new(error) as BoxError)
    })))
}

/// Wraps already-collected bytes as a [`RespBody`]. Mostly useful for
/// custom [`Transport`](crate::transport::Transport) implementations.
pub fn buffered_resp_body(body: Bytes) -> RespBody {
    Full::new(body).map_err(map_infallible_to_box_error).boxed()
}

pub(crate) fn build_http_request(
    method: Method,
    uri: Uri,
    headers: &HeaderMap,
    body: ReqBody,
) -> Result<http::Request<ReqBody>, Error> {
    let mut request_builder = http::Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        request_builder = request_builder.header(name, value);
    }
    request_builder
        .body(body)
        .map_err(|source| Error::RequestBuild { source })
}

pub(crate) enum ReadBodyError {
    Read(BoxError),
    TooLarge { actual_bytes: usize },
}

/// Drains a response body to completion, failing once the collected
/// size crosses `max_bytes`. The executor drains every attempt's body,
/// including ones that are about to be retried, so the connection can
/// go back to the pool.
pub(crate) async fn read_all_body_limited(
    mut body: RespBody,
    max_bytes: usize,
) -> Result<Bytes, ReadBodyError> {
    let mut collected = Vec::new();
    let mut total_len = 0_usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ReadBodyError::Read)?;
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(ReadBodyError::TooLarge {
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}
