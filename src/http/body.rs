//! Request body decoding: fixed-length and chunked transfer coding.

use crate::{
    errors::{Error, Result},
    http::{head::RequestHead, reader::BufferedReader, types},
    limits::ReqLimits,
};
use memchr::memchr;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncWriteExt};

/// A decoded request body.
///
/// Small bodies stay in memory. Bodies larger than
/// [`ReqLimits::memory_body_size`] are streamed to a temporary file which is
/// deleted when the `Body` is dropped, unless it is moved out with
/// [`persist`](Self::persist) or [`into_temp_path`](Self::into_temp_path).
#[derive(Debug, Default)]
pub enum Body {
    /// The request carried no body (`GET`, `HEAD`, or no framing headers).
    #[default]
    None,
    InMemory(Vec<u8>),
    OnDisk { path: TempPath, size: u64 },
}

impl Body {
    #[inline]
    pub const fn is_none(&self) -> bool {
        matches!(self, Body::None)
    }

    /// Body size in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Body::None => 0,
            Body::InMemory(data) => data.len() as u64,
            Body::OnDisk { size, .. } => *size,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// In-memory contents, `None` for on-disk or absent bodies.
    #[inline]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::InMemory(data) => Some(data),
            _ => None,
        }
    }

    /// Location of the temporary file for on-disk bodies.
    #[inline]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Body::OnDisk { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Loads the whole body into memory.
    pub async fn to_vec(&self) -> Result<Vec<u8>> {
        match self {
            Body::None => Ok(Vec::new()),
            Body::InMemory(data) => Ok(data.clone()),
            Body::OnDisk { path, .. } => Ok(tokio::fs::read(path).await?),
        }
    }

    /// Takes ownership of the temporary file; it is no longer deleted on drop
    /// unless the returned [`TempPath`] is dropped.
    pub fn into_temp_path(self) -> Option<TempPath> {
        match self {
            Body::OnDisk { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Moves the body to `dest`, keeping it after the request is gone.
    pub async fn persist(self, dest: impl AsRef<Path>) -> Result<()> {
        match self {
            Body::None => tokio::fs::write(dest, b"").await?,
            Body::InMemory(data) => tokio::fs::write(dest, data).await?,
            Body::OnDisk { path, .. } => {
                path.persist(dest).map_err(|err| Error::Io(err.error))?;
            }
        }
        Ok(())
    }

    /// Decodes the body that follows `head`.
    ///
    /// Only methods that carry a body are read. `Transfer-Encoding: chunked`
    /// takes precedence over `Content-Length`; any other transfer coding is
    /// [`Error::Unsupported`]. Without either header the body is
    /// [`Body::None`].
    pub async fn read<R: AsyncRead + Unpin>(
        reader: &mut BufferedReader<R>,
        head: &RequestHead,
        limits: &ReqLimits,
    ) -> Result<Body> {
        match Framing::of(head)? {
            Framing::None => Ok(Body::None),
            Framing::Chunked => read_chunked(reader, limits).await,
            Framing::Length(len) => read_fixed(reader, len, limits).await,
        }
    }
}

/// How the body after a request head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    None,
    Chunked,
    Length(u64),
}

impl Framing {
    pub(crate) fn of(head: &RequestHead) -> Result<Self> {
        if !head.method().has_body() {
            return Ok(Framing::None);
        }

        if let Some(coding) = head.header("transfer-encoding") {
            return match coding.trim().eq_ignore_ascii_case("chunked") {
                true => Ok(Framing::Chunked),
                false => Err(Error::Unsupported("transfer-encoding")),
            };
        }

        Ok(match head.content_length() {
            Some(len) => Framing::Length(len),
            None => Framing::None,
        })
    }

    /// `true` when at least one body byte is expected.
    #[inline]
    pub(crate) fn expects_data(self) -> bool {
        match self {
            Framing::None => false,
            Framing::Chunked => true,
            Framing::Length(len) => len > 0,
        }
    }
}

async fn read_fixed<R: AsyncRead + Unpin>(
    reader: &mut BufferedReader<R>,
    len: u64,
    limits: &ReqLimits,
) -> Result<Body> {
    if len > limits.body_size {
        return Err(Error::BodyTooLarge {
            limit: limits.body_size,
        });
    }

    let mut sink = BodySink::new(limits, len);
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(limits.read_chunk as u64) as usize;
        let chunk = reader.read_chunk(want).await?;
        remaining -= chunk.len() as u64;
        sink.write(chunk).await?;
    }

    sink.finish().await
}

async fn read_chunked<R: AsyncRead + Unpin>(
    reader: &mut BufferedReader<R>,
    limits: &ReqLimits,
) -> Result<Body> {
    let mut sink = BodySink::new(limits, 0);
    let mut total: u64 = 0;

    loop {
        let line = reader.read_line(limits.max_line_size).await?;
        let size = match memchr(b';', line) {
            Some(index) => &line[..index],
            None => line,
        };
        let size = types::parse_hex(trim_ows(size)).ok_or(Error::InvalidChunk("invalid chunk size"))?;

        if size == 0 {
            skip_trailers(reader, limits).await?;
            break;
        }

        total = total.saturating_add(size);
        if total > limits.body_size {
            return Err(Error::BodyTooLarge {
                limit: limits.body_size,
            });
        }

        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(limits.read_chunk as u64) as usize;
            let chunk = reader.read_chunk(want).await?;
            remaining -= chunk.len() as u64;
            sink.write(chunk).await?;
        }

        if reader.read_exact(2).await? != b"\r\n" {
            return Err(Error::InvalidChunk("missing CRLF after chunk data"));
        }
    }

    sink.finish().await
}

async fn skip_trailers<R: AsyncRead + Unpin>(
    reader: &mut BufferedReader<R>,
    limits: &ReqLimits,
) -> Result<()> {
    for _ in 0..=limits.header_count {
        if reader.read_line(limits.max_line_size).await?.is_empty() {
            return Ok(());
        }
    }
    Err(Error::TooManyHeaders)
}

#[inline]
fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

/// Collects body bytes in memory and moves them to a temporary file once
/// they pass the spill threshold.
struct BodySink {
    memory: Vec<u8>,
    file: Option<(tokio::fs::File, TempPath)>,
    size: u64,
    spill_at: u64,
    temp_dir: Option<PathBuf>,
}

impl BodySink {
    fn new(limits: &ReqLimits, expected: u64) -> Self {
        let capacity = expected.min(limits.memory_body_size) as usize;

        Self {
            memory: Vec::with_capacity(capacity),
            file: None,
            size: 0,
            spill_at: limits.memory_body_size,
            temp_dir: limits.temp_dir.clone(),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.size += data.len() as u64;

        if self.file.is_none() && self.size > self.spill_at {
            let (mut file, path) = create_temp_file(self.temp_dir.as_deref())?;
            file.write_all(&self.memory).await?;
            self.memory = Vec::new();
            self.file = Some((file, path));
        }

        match &mut self.file {
            Some((file, _)) => file.write_all(data).await?,
            None => self.memory.extend_from_slice(data),
        }
        Ok(())
    }

    async fn finish(self) -> Result<Body> {
        match self.file {
            Some((mut file, path)) => {
                file.flush().await?;
                Ok(Body::OnDisk {
                    path,
                    size: self.size,
                })
            }
            None => Ok(Body::InMemory(self.memory)),
        }
    }
}

/// Creates a temporary file that is removed when its [`TempPath`] drops.
pub(crate) fn create_temp_file(dir: Option<&Path>) -> Result<(tokio::fs::File, TempPath)> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("kiln-");

    let file = match dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };

    let (file, path) = file.into_parts();
    Ok((tokio::fs::File::from_std(file), path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn head(raw: &str) -> RequestHead {
        let mut reader = BufferedReader::new(raw.as_bytes());
        RequestHead::read(&mut reader, &ReqLimits::default()).await.unwrap()
    }

    async fn decode(head_raw: &str, body: &[u8], limits: &ReqLimits) -> Result<Body> {
        let head = head(head_raw).await;
        let mut reader = BufferedReader::with_chunk(body, 7);
        Body::read(&mut reader, &head, limits).await
    }

    fn encode_chunked(data: &[u8], sizes: &[usize]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut rest = data;
        let mut sizes = sizes.iter().cycle();

        while !rest.is_empty() {
            let n = (*sizes.next().unwrap()).min(rest.len());
            out.extend_from_slice(format!("{n:x};ext=1\r\n").as_bytes());
            out.extend_from_slice(&rest[..n]);
            out.extend_from_slice(b"\r\n");
            rest = &rest[n..];
        }
        out.extend_from_slice(b"0\r\nX-Checksum: abc\r\nX-Other: 1\r\n\r\n");
        out
    }

    #[tokio::test]
    async fn fixed_length() {
        let body = decode(
            "POST / HTTP/1.1\r\nContent-Length: 11\r\n\r\n",
            b"hello world",
            &ReqLimits::default(),
        )
        .await
        .unwrap();

        assert_eq!(body.as_bytes(), Some(&b"hello world"[..]));
        assert_eq!(body.len(), 11);
    }

    #[tokio::test]
    async fn chunked_round_trip() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();

        for sizes in [&[1usize][..], &[7, 1, 4096], &[65_536, 3], &[100_000]] {
            let encoded = encode_chunked(&data, sizes);
            let body = decode(
                "PUT / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
                &encoded,
                &ReqLimits::default(),
            )
            .await
            .unwrap();

            assert_eq!(body.as_bytes(), Some(&data[..]), "{sizes:?}");
        }
    }

    #[tokio::test]
    async fn chunked_without_data() {
        let body = decode(
            "POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
            b"0\r\n\r\n",
            &ReqLimits::default(),
        )
        .await
        .unwrap();
        assert_eq!(body.as_bytes(), Some(&b""[..]));
    }

    #[tokio::test]
    async fn chunked_errors() {
        let te = "POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";

        let err = decode(te, b"5\r\nhelloXX0\r\n\r\n", &ReqLimits::default()).await;
        assert!(matches!(err, Err(Error::InvalidChunk(_))));

        let err = decode(te, b"zz\r\nhello\r\n0\r\n\r\n", &ReqLimits::default()).await;
        assert!(matches!(err, Err(Error::InvalidChunk(_))));

        let err = decode(te, b"5\r\nhel", &ReqLimits::default()).await;
        assert!(matches!(err, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn ceiling_fixed_rejected_before_reading() {
        let limits = ReqLimits {
            body_size: 1024,
            ..ReqLimits::default()
        };

        let head = head("POST / HTTP/1.1\r\nContent-Length: 1025\r\n\r\n").await;
        // Nothing is ever written: reading would hang
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = BufferedReader::new(server);

        let result = Body::read(&mut reader, &head, &limits).await;
        assert!(matches!(result, Err(Error::BodyTooLarge { limit: 1024 })));
    }

    #[tokio::test]
    async fn ceiling_chunked() {
        let limits = ReqLimits {
            body_size: 1000,
            ..ReqLimits::default()
        };
        let data = vec![b'x'; 1500];
        let encoded = encode_chunked(&data, &[300]);

        let result = decode(
            "POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
            &encoded,
            &limits,
        )
        .await;
        assert!(matches!(result, Err(Error::BodyTooLarge { limit: 1000 })));
    }

    #[tokio::test]
    async fn ceiling_chunked_single_huge_chunk() {
        let limits = ReqLimits {
            body_size: 1000,
            ..ReqLimits::default()
        };

        let head = head("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n").await;
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"FFFFFFFF\r\n").await.unwrap();
        let mut reader = BufferedReader::new(server);

        let result = Body::read(&mut reader, &head, &limits).await;
        assert!(matches!(result, Err(Error::BodyTooLarge { .. })));
    }

    #[tokio::test]
    async fn spills_to_disk() {
        let limits = ReqLimits {
            memory_body_size: 64,
            ..ReqLimits::default()
        };
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let head_raw = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", data.len());

        let body = decode(&head_raw, &data, &limits).await.unwrap();
        let path = body.path().unwrap().to_path_buf();

        assert!(matches!(body, Body::OnDisk { size: 10_000, .. }));
        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert_eq!(body.to_vec().await.unwrap(), data);

        drop(body);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn persist_keeps_file() {
        let limits = ReqLimits {
            memory_body_size: 4,
            ..ReqLimits::default()
        };
        let body = decode(
            "POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n",
            b"0123456789",
            &limits,
        )
        .await
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("saved.bin");
        body.persist(&dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn truncated_fixed_body() {
        let result = decode(
            "POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n",
            b"short",
            &ReqLimits::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn no_body_cases() {
        let limits = ReqLimits::default();

        let body = decode("GET / HTTP/1.1\r\nContent-Length: 5\r\n\r\n", b"hello", &limits)
            .await
            .unwrap();
        assert!(body.is_none());

        let body = decode("HEAD / HTTP/1.1\r\n\r\n", b"", &limits).await.unwrap();
        assert!(body.is_none());

        let body = decode("POST / HTTP/1.1\r\n\r\n", b"ignored", &limits).await.unwrap();
        assert!(body.is_none());
    }

    #[tokio::test]
    async fn unsupported_transfer_coding() {
        let result = decode(
            "POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",
            b"",
            &ReqLimits::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[tokio::test]
    async fn framing() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\nContent-Length: 5\r\n\r\n",           Some((Framing::None, false))),
            ("POST / HTTP/1.1\r\n\r\n",                               Some((Framing::None, false))),
            ("POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n",          Some((Framing::Length(0), false))),
            ("PUT / HTTP/1.1\r\nContent-Length: 9\r\n\r\n",           Some((Framing::Length(9), true))),
            ("POST / HTTP/1.1\r\nTransfer-Encoding: Chunked\r\n\r\n", Some((Framing::Chunked, true))),
            ("POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n", None),
        ];

        for (raw, expected) in cases {
            let framing = Framing::of(&head(raw).await);
            match expected {
                Some((kind, data)) => {
                    let framing = framing.unwrap();
                    assert_eq!(framing, kind, "{raw:?}");
                    assert_eq!(framing.expects_data(), data, "{raw:?}");
                }
                None => assert!(matches!(framing, Err(Error::Unsupported(_))), "{raw:?}"),
            }
        }
    }

    #[test]
    fn trim() {
        assert_eq!(trim_ows(b"  1a\t"), b"1a");
        assert_eq!(trim_ows(b""), b"");
        assert_eq!(trim_ows(b" \t "), b"");
    }
}
