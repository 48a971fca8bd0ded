use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::trace::TraceInfo;
use crate::util::truncate_body;

/// A completed response: status, headers, the fully drained (and, when
/// content-encoded, already decoded) body, plus the connection trace
/// when the request asked for one.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    trace: Option<TraceInfo>,
}

impl Response {
    pub(crate) fn from_parts(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        trace: Option<TraceInfo>,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            trace,
        }
    }

    pub(crate) fn set_trace(&mut self, trace: TraceInfo) {
        self.trace = Some(trace);
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Writes the curl-verbose rendering of this response (`< ` status
    /// and header lines, then the body when `with_body` is set).
    pub fn dump<W: std::io::Write>(&self, out: &mut W, with_body: bool) -> std::io::Result<()> {
        crate::dump::dump_response(self, out, with_body)
    }

    pub fn json<T>(&self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&self.body),
        })
    }

    /// Connection-phase durations for the final attempt. `None` unless
    /// the request enabled client tracing.
    pub fn trace_info(&self) -> Option<&TraceInfo> {
        self.trace.as_ref()
    }
}
