use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
use tracing::warn;

use crate::error::Error;

const PIPE_BUFFER_SIZE: usize = 8 * 1024;
const SNIFF_LEN: usize = 512;
const UNKNOWN_FILENAME: &str = "???";

type PartReader = Box<dyn AsyncRead + Send + Sync + Unpin + 'static>;

/// One file section of a multipart payload. The content type is
/// sniffed from the first bytes of the stream unless set explicitly.
pub struct FilePart {
    body: PartReader,
    filename: Option<String>,
    mime: Option<String>,
}

impl FilePart {
    pub fn from_reader<R>(body: R) -> Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        Self {
            body: Box::new(body),
            filename: None,
            mime: None,
        }
    }

    /// Opens the named file; its base name becomes the part filename.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| Error::BodyCapture {
                source: Box::new(source),
            })?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        Ok(Self {
            body: Box::new(file),
            filename,
            mime: None,
        })
    }

    /// Like [`FilePart::open`], but panics when the file cannot be
    /// opened. For callers that treat a missing upload source as fatal.
    pub async fn must_open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::open(path).await {
            Ok(part) => part,
            Err(error) => panic!("failed to open multipart file {}: {error}", path.display()),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }
}

/// Streaming multipart/form-data container. Part bytes are produced
/// through an in-memory pipe by a task that starts on the first read,
/// so large files are never buffered whole.
///
/// Sections are written in configuration order, files before plain
/// fields. A file whose stream fails mid-copy is logged and skipped;
/// the remaining sections are still written.
pub struct FormData {
    boundary: String,
    files: Vec<(String, FilePart)>,
    fields: Vec<(String, String)>,
    reader: Option<DuplexStream>,
}

impl FormData {
    pub fn new() -> Self {
        let seed: [u8; 30] = rand::rng().random();
        let boundary: String = seed.iter().map(|byte| format!("{byte:02x}")).collect();
        Self {
            boundary,
            files: Vec::new(),
            fields: Vec::new(),
            reader: None,
        }
    }

    pub fn file(mut self, name: impl Into<String>, part: FilePart) -> Self {
        self.files.push((name.into(), part));
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// The Content-Type header value carrying this payload's boundary.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }
}

impl Default for FormData {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncRead for FormData {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.reader.is_none() {
            let (read_half, write_half) = tokio::io::duplex(PIPE_BUFFER_SIZE);
            let files = std::mem::take(&mut this.files);
            let fields = std::mem::take(&mut this.fields);
            tokio::spawn(produce(write_half, this.boundary.clone(), files, fields));
            this.reader = Some(read_half);
        }

        match this.reader.as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

fn escape_quotes(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Reduced form of the standard content sniffing table: well-known
/// magic numbers, then a text/binary split on NUL bytes.
pub(crate) fn detect_content_type(data: &[u8]) -> &'static str {
    const SIGNATURES: [(&[u8], &str); 7] = [
        (b"%PDF-", "application/pdf"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/x-gzip"),
    ];

    for (signature, mime) in SIGNATURES {
        if data.starts_with(signature) {
            return mime;
        }
    }

    let trimmed = data
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .map_or(&[] as &[u8], |start| &data[start..]);
    if starts_with_ignore_case(trimmed, b"<!DOCTYPE HTML")
        || starts_with_ignore_case(trimmed, b"<HTML")
    {
        return "text/html; charset=utf-8";
    }

    if data.contains(&0) {
        return "application/octet-stream";
    }
    "text/plain; charset=utf-8"
}

fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len()
        && data
            .iter()
            .zip(prefix)
            .all(|(byte, expected)| byte.eq_ignore_ascii_case(expected))
}

async fn produce(
    mut writer: DuplexStream,
    boundary: String,
    files: Vec<(String, FilePart)>,
    fields: Vec<(String, String)>,
) {
    for (name, part) in files {
        if write_file_part(&mut writer, &boundary, &name, part)
            .await
            .is_err()
        {
            // The read side is gone; nobody will see the rest.
            return;
        }
    }
    for (name, value) in fields {
        if write_field(&mut writer, &boundary, &name, &value)
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = writer
        .write_all(format!("--{boundary}--\r\n").as_bytes())
        .await;
    let _ = writer.shutdown().await;
}

async fn write_file_part(
    writer: &mut DuplexStream,
    boundary: &str,
    name: &str,
    part: FilePart,
) -> io::Result<()> {
    let filename = part
        .filename
        .as_deref()
        .filter(|filename| !filename.is_empty())
        .unwrap_or(UNKNOWN_FILENAME)
        .to_owned();
    let mut body = part.body;

    let mut head = vec![0_u8; SNIFF_LEN];
    let mut filled = 0_usize;
    let mut source_error = None;
    while filled < head.len() {
        match body.read(&mut head[filled..]).await {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(error) => {
                source_error = Some(error);
                break;
            }
        }
    }
    head.truncate(filled);

    let mime = part
        .mime
        .unwrap_or_else(|| detect_content_type(&head).to_owned());

    writer
        .write_all(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {mime}\r\n\r\n",
                escape_quotes(name),
                escape_quotes(&filename),
            )
            .as_bytes(),
        )
        .await?;
    writer.write_all(&head).await?;

    if source_error.is_none() {
        let mut chunk = [0_u8; PIPE_BUFFER_SIZE];
        loop {
            match body.read(&mut chunk).await {
                Ok(0) => break,
                Ok(read) => writer.write_all(&chunk[..read]).await?,
                Err(error) => {
                    source_error = Some(error);
                    break;
                }
            }
        }
    }

    if let Some(error) = source_error {
        warn!(
            name,
            filename,
            error = %error,
            "skipping unreadable multipart file section"
        );
    }

    writer.write_all(b"\r\n").await
}

async fn write_field(
    writer: &mut DuplexStream,
    boundary: &str,
    name: &str,
    value: &str,
) -> io::Result<()> {
    writer
        .write_all(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{value}\r\n",
                escape_quotes(name),
            )
            .as_bytes(),
        )
        .await
}
