use std::io::Write;
use std::sync::Mutex;

use futures_core::future::BoxFuture;
use http::header::{HOST, TRAILER, TRANSFER_ENCODING};

use crate::body::RequestBody;
use crate::error::Error;
use crate::hooks::{AfterResponseHook, BeforeRequestHook};
use crate::request::Request;
use crate::response::Response;
use crate::util::lock_unpoisoned;

const ERROR_TAG: &str = "* reqflow [ERROR]";

fn dump_request(request: &Request, out: &mut dyn Write, with_body: bool) -> std::io::Result<()> {
    let (request_target, host) = match request.resolve_uri() {
        Ok(uri) => {
            let target = uri
                .path_and_query()
                .map_or_else(|| "/".to_owned(), |pq| pq.to_string());
            let host = uri.authority().map(|authority| authority.to_string());
            (target, host)
        }
        Err(_) => (request.url().to_owned(), None),
    };

    write!(out, "> {} {request_target} HTTP/1.1\r\n", request.method())?;
    if let Some(host) = host {
        write!(out, "> Host: {host}\r\n")?;
    }
    for (name, value) in request.headers() {
        if name == &HOST || name == &TRANSFER_ENCODING || name == &TRAILER {
            continue;
        }
        write!(out, "> {name}: {}\r\n", String::from_utf8_lossy(value.as_bytes()))?;
    }
    out.write_all(b">\r\n")?;

    if with_body {
        // Streaming bodies cannot be rendered without consuming them.
        if let RequestBody::Buffered(body) = request.body_ref() {
            if !body.is_empty() {
                out.write_all(body)?;
                out.write_all(b"\r\n")?;
            }
        }
    }
    Ok(())
}

pub(crate) fn dump_response(
    response: &Response,
    out: &mut dyn Write,
    with_body: bool,
) -> std::io::Result<()> {
    let status = response.status();
    write!(
        out,
        "< HTTP/1.1 {} {}\r\n",
        status.as_str(),
        status.canonical_reason().unwrap_or("")
    )?;
    for (name, value) in response.headers() {
        write!(out, "< {name}: {}\r\n", String::from_utf8_lossy(value.as_bytes()))?;
    }
    out.write_all(b"<\r\n")?;

    if with_body && !response.body().is_empty() {
        out.write_all(response.body())?;
        out.write_all(b"\r\n")?;
    }
    Ok(())
}

/// Hook pair that renders requests and responses in a curl-verbose
/// style: request lines prefixed with `> `, response lines with `< `,
/// failures flagged with an `* reqflow [ERROR]` line.
pub struct Debugger {
    out: Mutex<Box<dyn Write + Send>>,
    with_body: bool,
}

impl Debugger {
    pub fn new<W>(out: W, with_body: bool) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            out: Mutex::new(Box::new(out)),
            with_body,
        }
    }

    fn note_failure(&self, out: &mut dyn Write, message: &str) {
        let _ = write!(out, "{ERROR_TAG} {message}\r\n");
    }
}

impl BeforeRequestHook for Debugger {
    fn enter<'a>(&'a self, request: &'a mut Request) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut out = lock_unpoisoned(&self.out);
            match dump_request(request, out.as_mut(), self.with_body) {
                Ok(()) => Ok(()),
                Err(source) => {
                    self.note_failure(out.as_mut(), &source.to_string());
                    Err(Error::DebugDump { source })
                }
            }
        })
    }
}

impl AfterResponseHook for Debugger {
    fn exit(&self, response: Option<&Response>, error: Option<&Error>) {
        let mut out = lock_unpoisoned(&self.out);
        if let Some(error) = error {
            self.note_failure(out.as_mut(), &error.to_string());
            return;
        }
        if let Some(response) = response {
            if let Err(dump_error) = dump_response(response, out.as_mut(), self.with_body) {
                self.note_failure(out.as_mut(), &dump_error.to_string());
            }
        }
    }
}
