//! Serializes a finished [`Response`] onto the socket.

use crate::{
    errors::{Error, Result},
    http::{
        response::{write::write_unsigned, Response, ResponseBody},
        types::{Method, StatusCode, Version},
    },
    limits::RespLimits,
};
use chrono::Utc;
use std::{io::SeekFrom, time::Duration};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt},
    time::{error::Elapsed, timeout},
};

enum Payload<'a> {
    Bytes(&'a [u8]),
    File { file: File, len: u64 },
}

impl Payload<'_> {
    fn len(&self) -> u64 {
        match self {
            Payload::Bytes(data) => data.len() as u64,
            Payload::File { len, .. } => *len,
        }
    }
}

/// Writes `resp` and returns the status that was actually sent.
///
/// A file body is opened here: a missing file fails with
/// [`Error::FileUnavailable`] before anything is written, so the caller can
/// still answer with an error response. A range outside the file is answered
/// with `416` and `content-range: bytes */<len>`.
pub(crate) async fn write_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    resp: &Response,
    method: Method,
    version: Version,
    limits: &RespLimits,
    write_timeout: Duration,
) -> Result<StatusCode> {
    let mut status = resp.status_code().clone();
    let mut content_range = None;

    let payload = match resp.body_ref() {
        ResponseBody::Empty => Payload::Bytes(&[]),
        ResponseBody::Bytes(data) => Payload::Bytes(data),
        ResponseBody::File { path, range } => {
            let mut file = File::open(path).await.map_err(Error::FileUnavailable)?;
            let size = file.metadata().await.map_err(Error::FileUnavailable)?.len();

            match range.as_ref().map(|range| range.resolve(size)) {
                None => Payload::File { file, len: size },
                Some(Some((first, last))) => {
                    if status == StatusCode::OK {
                        status = StatusCode::PARTIAL_CONTENT;
                    }
                    content_range = Some(format!("bytes {first}-{last}/{size}"));

                    file.seek(SeekFrom::Start(first)).await?;
                    Payload::File {
                        file,
                        len: last - first + 1,
                    }
                }
                Some(None) => {
                    write_unsatisfiable(stream, version, size, limits, write_timeout).await?;
                    return Ok(StatusCode::RANGE_NOT_SATISFIABLE);
                }
            }
        }
    };

    let mut head = Vec::with_capacity(256 + resp.raw_headers().len());
    status.write_first_line(version, &mut head);
    head.extend_from_slice(resp.raw_headers());
    if let Some(range) = content_range {
        push_header(&mut head, "content-range", range.as_bytes());
    }
    write_generated(&mut head, resp, &status, payload.len(), limits);

    let send_body = method != Method::Head && status.allows_body() && payload.len() > 0;
    match payload {
        Payload::Bytes(data) if send_body && head.len() + data.len() <= limits.write_chunk => {
            head.extend_from_slice(data);
            write_bytes(stream, &head, write_timeout).await?;
        }
        Payload::Bytes(data) => {
            write_bytes(stream, &head, write_timeout).await?;
            if send_body {
                for chunk in data.chunks(limits.write_chunk.max(1)) {
                    write_bytes(stream, chunk, write_timeout).await?;
                }
            }
        }
        Payload::File { mut file, len } => {
            write_bytes(stream, &head, write_timeout).await?;
            if send_body {
                copy_file(stream, &mut file, len, limits.write_chunk, write_timeout).await?;
            }
        }
    }

    timeout(write_timeout, stream.flush()).await.map_err(stalled)??;
    Ok(status)
}

/// Writes raw bytes, bounded by `time`.
pub(crate) async fn write_bytes<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
    time: Duration,
) -> Result<()> {
    timeout(time, stream.write_all(data)).await.map_err(stalled)??;
    Ok(())
}

/// A write that times out may already have put part of the response on the
/// wire, so it is reported like any other broken connection.
fn stalled(_: Elapsed) -> Error {
    Error::Io(std::io::ErrorKind::TimedOut.into())
}

/// Writes the headers the handler left out.
fn write_generated(
    head: &mut Vec<u8>,
    resp: &Response,
    status: &StatusCode,
    body_len: u64,
    limits: &RespLimits,
) {
    use std::io::Write;
    let present = resp.present();

    if !present.server {
        push_header(head, "server", limits.server_name.as_bytes());
    }
    if !present.date {
        let _ = write!(
            head,
            "date: {}\r\n",
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")
        );
    }
    if !present.content_length && status.allows_body() {
        head.extend_from_slice(b"content-length: ");
        write_unsigned(body_len as u128, head);
        head.extend_from_slice(b"\r\n");
    }
    if !present.connection {
        head.extend_from_slice(b"connection: close\r\n");
    }
    head.extend_from_slice(b"\r\n");
}

fn push_header(head: &mut Vec<u8>, name: &str, value: &[u8]) {
    head.extend_from_slice(name.as_bytes());
    head.extend_from_slice(b": ");
    head.extend_from_slice(value);
    head.extend_from_slice(b"\r\n");
}

async fn write_unsatisfiable<W: AsyncWrite + Unpin>(
    stream: &mut W,
    version: Version,
    size: u64,
    limits: &RespLimits,
    write_timeout: Duration,
) -> Result<()> {
    let mut head = Vec::with_capacity(160);
    StatusCode::RANGE_NOT_SATISFIABLE.write_first_line(version, &mut head);
    push_header(&mut head, "content-range", format!("bytes */{size}").as_bytes());
    push_header(&mut head, "server", limits.server_name.as_bytes());
    head.extend_from_slice(b"content-length: 0\r\nconnection: close\r\n\r\n");

    write_bytes(stream, &head, write_timeout).await?;
    timeout(write_timeout, stream.flush()).await.map_err(stalled)??;
    Ok(())
}

async fn copy_file<W: AsyncWrite + Unpin>(
    stream: &mut W,
    file: &mut File,
    mut remaining: u64,
    chunk: usize,
    write_timeout: Duration,
) -> Result<()> {
    let mut buf = vec![0; chunk.max(1).min(remaining as usize)];

    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            // File shrank after the length was sent
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }

        write_bytes(stream, &buf[..n], write_timeout).await?;
        remaining -= n as u64;
    }
    Ok(())
}
