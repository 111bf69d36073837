//! Streaming `multipart/form-data` decoder.
//!
//! Parts with a `filename` are written straight to temporary files while the
//! input is scanned; only a window the size of the delimiter is ever held
//! back in memory. Parts without a `filename` are collected as text fields.

use crate::{
    errors::{Error, Result},
    http::{
        body::{create_temp_file, Body},
        reader::BufferedReader,
    },
    limits::MultipartLimits,
};
use memchr::memmem::Finder;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncWriteExt};

const READ_CHUNK: usize = 64 * 1024;

/// Decoded form: text fields in arrival order plus file parts.
///
/// # Examples
/// ```
/// # tokio_test_block_on(async {
/// use kiln::{Body, Multipart, limits::MultipartLimits};
///
/// let body = Body::InMemory(
///     b"--XyZ\r\n\
///       Content-Disposition: form-data; name=\"title\"\r\n\r\n\
///       hello\r\n\
///       --XyZ\r\n\
///       Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
///       Content-Type: text/plain\r\n\r\n\
///       file contents\r\n\
///       --XyZ--\r\n"
///         .to_vec(),
/// );
///
/// let form = Multipart::decode(&body, "XyZ", &MultipartLimits::default()).await.unwrap();
/// assert_eq!(form.field("title"), Some("hello"));
///
/// let doc = form.file("doc").unwrap();
/// assert_eq!(doc.filename(), Some("a.txt"));
/// assert_eq!(doc.read().await.unwrap(), b"file contents");
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Multipart {
    fields: Vec<(String, String)>,
    files: Vec<FilePart>,
}

/// One part of a multipart body that is kept as raw data.
///
/// Parts with a `filename` are stored on disk. The temporary file is removed
/// when the `FilePart` is dropped; call [`persist`](Self::persist) or
/// [`keep`](Self::keep) to retain it.
#[derive(Debug)]
pub struct FilePart {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: PartData,
}

#[derive(Debug)]
pub enum PartData {
    InMemory(Vec<u8>),
    OnDisk { path: TempPath, size: u64 },
}

impl Multipart {
    /// Decodes a request body already read by the server.
    pub async fn decode(body: &Body, boundary: &str, limits: &MultipartLimits) -> Result<Self> {
        match body {
            Body::None => Err(Error::InvalidMultipart("empty body")),
            Body::InMemory(data) => {
                let mut reader = BufferedReader::with_chunk(&data[..], READ_CHUNK);
                Self::decode_from(&mut reader, boundary, limits).await
            }
            Body::OnDisk { path, .. } => {
                let file = tokio::fs::File::open(path).await?;
                let mut reader = BufferedReader::with_chunk(file, READ_CHUNK);
                Self::decode_from(&mut reader, boundary, limits).await
            }
        }
    }

    /// Decodes a multipart stream incrementally.
    ///
    /// Fails with [`Error::InvalidMultipart`] when the input ends before the
    /// closing delimiter, unless [`MultipartLimits::allow_truncated`] is set;
    /// then the parts seen so far are returned, the last one cut at the end
    /// of input.
    pub async fn decode_from<R: AsyncRead + Unpin>(
        reader: &mut BufferedReader<R>,
        boundary: &str,
        limits: &MultipartLimits,
    ) -> Result<Self> {
        if boundary.is_empty() || boundary.len() > 70 {
            return Err(Error::InvalidMultipart("invalid boundary"));
        }

        let mut decoder = Decoder {
            delimiter: format!("\r\n--{boundary}").into_bytes(),
            limits,
            result: Multipart::default(),
        };

        match decoder.run(reader).await {
            Ok(()) => Ok(decoder.result),
            Err(Truncated) if limits.allow_truncated => Ok(decoder.result),
            Err(Truncated) => Err(Error::InvalidMultipart("unexpected end of body")),
            Err(Failed(err)) => Err(err),
        }
    }
}

// Public API
impl Multipart {
    /// Text fields in arrival order.
    #[inline(always)]
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Value of the last field called `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    #[inline(always)]
    pub fn files(&self) -> &[FilePart] {
        &self.files
    }

    /// First file part called `name`.
    pub fn file(&self, name: &str) -> Option<&FilePart> {
        self.files.iter().find(|part| part.name == name)
    }

    /// Takes ownership of every file part.
    #[inline]
    pub fn into_files(self) -> Vec<FilePart> {
        self.files
    }
}

impl FilePart {
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    #[inline(always)]
    pub fn data(&self) -> &PartData {
        &self.data
    }

    pub fn len(&self) -> u64 {
        match &self.data {
            PartData::InMemory(data) => data.len() as u64,
            PartData::OnDisk { size, .. } => *size,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the temporary file, for on-disk parts.
    pub fn path(&self) -> Option<&Path> {
        match &self.data {
            PartData::OnDisk { path, .. } => Some(path),
            PartData::InMemory(_) => None,
        }
    }

    /// Loads the part into memory.
    pub async fn read(&self) -> Result<Vec<u8>> {
        match &self.data {
            PartData::InMemory(data) => Ok(data.clone()),
            PartData::OnDisk { path, .. } => Ok(tokio::fs::read(path).await?),
        }
    }

    /// Moves the part to `dest`.
    pub async fn persist(self, dest: impl AsRef<Path>) -> Result<()> {
        match self.data {
            PartData::InMemory(data) => tokio::fs::write(dest, data).await?,
            PartData::OnDisk { path, .. } => {
                path.persist(dest).map_err(|err| Error::Io(err.error))?;
            }
        }
        Ok(())
    }

    /// Detaches the temporary file from the part and returns its path. The
    /// caller becomes responsible for removing it.
    ///
    /// In-memory parts are written to a new temporary file first.
    pub async fn keep(self) -> Result<PathBuf> {
        let path = match self.data {
            PartData::OnDisk { path, .. } => path,
            PartData::InMemory(data) => {
                let (mut file, path) = create_temp_file(None)?;
                file.write_all(&data).await?;
                file.flush().await?;
                path
            }
        };

        path.keep().map_err(|err| Error::Io(err.error))
    }
}

/// Extracts the `boundary` parameter of a `multipart/form-data` content type.
///
/// ```
/// use kiln::multipart::boundary;
///
/// assert_eq!(boundary("multipart/form-data; boundary=abc"), Some("abc"));
/// assert_eq!(boundary("Multipart/Form-Data; charset=utf-8; boundary=\"a b\""), Some("a b"));
/// assert_eq!(boundary("application/json"), None);
/// ```
pub fn boundary(content_type: &str) -> Option<&str> {
    let mut params = content_type.split(';');
    let kind = params.next()?.trim();
    if !kind.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }

    params
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| unquote(value.trim()))
        .filter(|value| !value.is_empty())
}

#[inline]
fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

// DECODER

enum Stop {
    Truncated,
    Failed(Error),
}
use Stop::{Failed, Truncated};

impl From<Error> for Stop {
    fn from(err: Error) -> Self {
        match err {
            Error::ConnectionClosed => Truncated,
            err => Failed(err),
        }
    }
}

impl From<std::io::Error> for Stop {
    fn from(err: std::io::Error) -> Self {
        Failed(err.into())
    }
}

#[derive(Default)]
struct PartHeaders {
    name: Option<String>,
    filename: Option<String>,
    content_type: Option<String>,
}

struct Decoder<'a> {
    /// `CRLF "--" boundary`
    delimiter: Vec<u8>,
    limits: &'a MultipartLimits,
    result: Multipart,
}

impl Decoder<'_> {
    async fn run<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut BufferedReader<R>,
    ) -> Result<(), Stop> {
        self.skip_preamble(reader).await?;

        let mut parts = 0;
        loop {
            // Right after a boundary: "--" closes the body, anything else is
            // padding up to the end of the line.
            let mut next = [0u8; 2];
            next.copy_from_slice(reader.read_exact(2).await?);
            match next {
                [b'-', b'-'] => return Ok(()),
                [_, b'\n'] => {}
                _ => {
                    reader.read_line(self.limits.max_header_size).await?;
                }
            }

            parts += 1;
            if parts > self.limits.max_parts {
                return Err(Failed(Error::InvalidMultipart("too many parts")));
            }

            let headers = self.read_headers(reader).await?;
            match headers.filename.is_some() {
                true => self.read_file(reader, headers).await?,
                false => self.read_field(reader, headers).await?,
            }
        }
    }

    async fn skip_preamble<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut BufferedReader<R>,
    ) -> Result<(), Stop> {
        let dash_boundary = &self.delimiter[2..];
        let finder = Finder::new(dash_boundary);

        loop {
            let buffered = reader.buffered();
            if let Some(index) = finder.find(buffered) {
                reader.consume(index + dash_boundary.len());
                return Ok(());
            }

            let keep = dash_boundary.len() - 1;
            let skip = buffered.len().saturating_sub(keep);
            reader.consume(skip);
            if reader.fill().await? == 0 {
                return Err(Failed(Error::InvalidMultipart("missing opening boundary")));
            }
        }
    }

    async fn read_headers<R: AsyncRead + Unpin>(
        &self,
        reader: &mut BufferedReader<R>,
    ) -> Result<PartHeaders, Stop> {
        let mut headers = PartHeaders::default();
        let mut total = 0;

        loop {
            let line = reader.read_line(self.limits.max_header_size).await?;
            if line.is_empty() {
                break;
            }

            total += line.len() + 2;
            if total > self.limits.max_header_size {
                return Err(Failed(Error::InvalidMultipart("part headers too large")));
            }

            let line = simdutf8::basic::from_utf8(line)
                .map_err(|_| Error::InvalidMultipart("part headers are not UTF-8"))?;
            let (name, value) = line
                .split_once(':')
                .ok_or(Error::InvalidMultipart("malformed part header"))?;
            let value = value.trim();

            if name.trim().eq_ignore_ascii_case("content-disposition") {
                parse_disposition(value, &mut headers);
            } else if name.trim().eq_ignore_ascii_case("content-type") {
                headers.content_type = Some(value.to_string());
            }
        }

        if headers.name.is_none() {
            return Err(Failed(Error::InvalidMultipart("part without a name")));
        }
        Ok(headers)
    }

    async fn read_field<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut BufferedReader<R>,
        headers: PartHeaders,
    ) -> Result<(), Stop> {
        let mut sink = PartSink::Memory(Vec::new());
        let outcome = self.stream_part(reader, &mut sink).await;

        let PartSink::Memory(data) = sink else {
            unreachable!("fields are collected in memory")
        };
        self.push_field(headers, data);
        outcome
    }

    async fn read_file<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut BufferedReader<R>,
        headers: PartHeaders,
    ) -> Result<(), Stop> {
        let (file, path) = create_temp_file(self.limits.temp_dir.as_deref())?;
        let mut sink = PartSink::File { file, size: 0 };
        let outcome = self.stream_part(reader, &mut sink).await;

        let PartSink::File { mut file, size } = sink else {
            unreachable!("file parts are streamed to disk")
        };
        file.flush().await?;

        self.result.files.push(FilePart {
            name: headers.name.unwrap_or_default(),
            filename: headers.filename,
            content_type: headers.content_type,
            data: PartData::OnDisk { path, size },
        });
        outcome
    }

    /// Copies part data into `sink` until the delimiter, which is consumed.
    ///
    /// Everything except the last `delimiter.len() - 1` buffered bytes is
    /// flushed after each scan, so a delimiter split between two reads is
    /// still found. On end of input the held-back bytes are flushed too and
    /// [`Truncated`] is returned.
    async fn stream_part<R: AsyncRead + Unpin>(
        &self,
        reader: &mut BufferedReader<R>,
        sink: &mut PartSink,
    ) -> Result<(), Stop> {
        let finder = Finder::new(&self.delimiter);
        let keep = self.delimiter.len() - 1;

        loop {
            let buffered = reader.buffered();
            if let Some(index) = finder.find(buffered) {
                sink.write(&buffered[..index], self.limits).await?;
                reader.consume(index + self.delimiter.len());
                return Ok(());
            }

            let flush = buffered.len().saturating_sub(keep);
            sink.write(&buffered[..flush], self.limits).await?;
            reader.consume(flush);

            if reader.fill().await? == 0 {
                sink.write(reader.buffered(), self.limits).await?;
                let rest = reader.buffered().len();
                reader.consume(rest);
                return Err(Truncated);
            }
        }
    }

    fn push_field(&mut self, headers: PartHeaders, data: Vec<u8>) {
        let name = headers.name.unwrap_or_default();

        match String::from_utf8(data) {
            Ok(value) => self.result.fields.push((name, value)),
            Err(err) => self.result.files.push(FilePart {
                name,
                filename: None,
                content_type: headers.content_type,
                data: PartData::InMemory(err.into_bytes()),
            }),
        }
    }
}

fn parse_disposition(value: &str, headers: &mut PartHeaders) {
    for param in value.split(';').skip(1) {
        let Some((key, val)) = param.split_once('=') else {
            continue;
        };
        let val = unquote(val.trim()).to_string();

        match key.trim() {
            k if k.eq_ignore_ascii_case("name") => headers.name = Some(val),
            k if k.eq_ignore_ascii_case("filename") => headers.filename = Some(val),
            _ => {}
        }
    }
}

enum PartSink {
    Memory(Vec<u8>),
    File { file: tokio::fs::File, size: u64 },
}

impl PartSink {
    async fn write(&mut self, data: &[u8], limits: &MultipartLimits) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        match self {
            PartSink::Memory(buf) => {
                if buf.len() + data.len() > limits.max_field_size {
                    return Err(Error::BodyTooLarge {
                        limit: limits.max_field_size as u64,
                    });
                }
                buf.extend_from_slice(data);
            }
            PartSink::File { file, size } => {
                file.write_all(data).await?;
                *size += data.len() as u64;
            }
        }
        Ok(())
    }
}
