//! HTTP/1.1 transport: a linear write-request / read-response codec.

pub(crate) mod chunked;

use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use log::trace;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::body::BodyTooLong;
use crate::error::{BoxError, Error};
use crate::pool::PooledConn;
use crate::request::PreparedRequest;

/// Serializes the request head and body onto the connection.
///
/// A body of known length gets a `Content-Length` header and is copied
/// verbatim; an unknown length switches to chunked transfer coding.
pub(crate) async fn write_request<W, S>(
    io: &mut W,
    req: &PreparedRequest,
    mut body: S,
) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
    S: futures_core::Stream<Item = Result<Bytes, BoxError>> + Unpin,
{
    let mut head = String::with_capacity(256);
    head.push_str(req.method.as_str());
    head.push(' ');
    head.push_str(&req.request_target());
    head.push_str(" HTTP/1.1\r\nHost: ");
    head.push_str(&req.host);
    head.push_str("\r\n");

    let chunked = req.has_body() && req.content_length < 0;
    if req.has_body() && req.content_length >= 0 {
        head.push_str(&format!("Content-Length: {}\r\n", req.content_length));
    } else if chunked {
        head.push_str("Transfer-Encoding: chunked\r\n");
    }

    for (name, value) in req.headers.iter() {
        head.push_str(name.as_str());
        head.push_str(": ");
        match value.to_str() {
            Ok(text) => head.push_str(text),
            Err(_) => return Err(Error::request("request header value is not valid text")),
        }
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    io.write_all(head.as_bytes()).await.map_err(Error::request)?;
    trace!("h1 request head written: {} {}", req.method, req.request_target());

    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(Error::body)?;
        if chunk.is_empty() {
            continue;
        }
        if req.content_length >= 0 {
            if written + chunk.len() as u64 > req.content_length as u64 {
                return Err(Error::body(BodyTooLong));
            }
        }
        written += chunk.len() as u64;
        if chunked {
            chunked::write_chunk(io, &chunk).await.map_err(Error::request)?;
        } else {
            io.write_all(&chunk).await.map_err(Error::request)?;
        }
    }
    if chunked {
        chunked::write_last_chunk(io).await.map_err(Error::request)?;
    } else if req.content_length > 0 && written < req.content_length as u64 {
        return Err(Error::body(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "request body ended before its declared content-length",
        )));
    }

    io.flush().await.map_err(Error::request)
}

/// A parsed response status line and header section.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
}

pub(crate) async fn read_response_head(conn: &mut PooledConn) -> crate::Result<ResponseHead> {
    let io = conn.io();

    let status_line = chunked::read_line(io).await?;
    let status_line = String::from_utf8(status_line)
        .map_err(|_| Error::decode("malformed status line"))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        _ => return Err(Error::decode("unsupported HTTP version in response")),
    };
    let status = parts
        .next()
        .filter(|s| s.len() == 3)
        .and_then(|s| StatusCode::from_bytes(s.as_bytes()).ok())
        .ok_or_else(|| Error::decode("malformed HTTP status code"))?;

    let mut headers = HeaderMap::new();
    loop {
        let line = chunked::read_line(io).await?;
        if line.is_empty() {
            break;
        }
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| Error::decode("malformed header line"))?;
        let name = HeaderName::from_bytes(&line[..colon])
            .map_err(|_| Error::decode("malformed header name"))?;
        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
            value = &value[1..];
        }
        let value =
            HeaderValue::from_bytes(value).map_err(|_| Error::decode("malformed header value"))?;
        headers.append(name, value);
    }

    Ok(ResponseHead {
        version,
        status,
        headers,
    })
}

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    NoBody,
    ContentLength(u64),
    Chunked,
    ReadToEnd,
}

pub(crate) fn body_framing(
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
) -> crate::Result<BodyFraming> {
    if method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::NoBody);
    }

    let te_chunked = headers
        .get_all(http::header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
    if te_chunked {
        return Ok(BodyFraming::Chunked);
    }

    // Differing duplicate Content-Length values are a smuggling vector.
    let mut declared: Option<u64> = None;
    for value in headers.get_all(http::header::CONTENT_LENGTH) {
        let parsed: u64 = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| Error::decode("malformed Content-Length"))?;
        match declared {
            Some(existing) if existing != parsed => {
                return Err(Error::decode("conflicting Content-Length headers"));
            }
            _ => declared = Some(parsed),
        }
    }
    match declared {
        Some(0) => Ok(BodyFraming::NoBody),
        Some(n) => Ok(BodyFraming::ContentLength(n)),
        None => Ok(BodyFraming::ReadToEnd),
    }
}

/// Whether the connection may go back to the pool after this exchange.
pub(crate) fn may_reuse(version: Version, headers: &HeaderMap) -> bool {
    let connection_has = |token: &str| {
        headers
            .get_all(http::header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|opt| opt.trim().eq_ignore_ascii_case(token))
    };
    match version {
        Version::HTTP_11 => !connection_has("close"),
        Version::HTTP_10 => connection_has("keep-alive"),
        _ => false,
    }
}

#[derive(Clone, Copy)]
enum BodyState {
    Length(u64),
    Chunked { remaining: u64 },
    ReadToEnd,
    Done,
}

/// The caller-side reader for an HTTP/1.1 response body. Owns the pooled
/// connection and returns it for reuse once fully drained.
pub(crate) struct H1Body {
    conn: Option<PooledConn>,
    state: BodyState,
    reusable: bool,
}

impl std::fmt::Debug for H1Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1Body").finish()
    }
}

const READ_CHUNK: usize = 8 * 1024;

impl H1Body {
    pub(crate) fn new(conn: PooledConn, framing: BodyFraming, reusable: bool) -> H1Body {
        let mut body = H1Body {
            conn: Some(conn),
            state: match framing {
                BodyFraming::NoBody => BodyState::Done,
                BodyFraming::ContentLength(n) => BodyState::Length(n),
                BodyFraming::Chunked => BodyState::Chunked { remaining: 0 },
                BodyFraming::ReadToEnd => BodyState::ReadToEnd,
            },
            reusable,
        };
        if matches!(body.state, BodyState::Done) {
            body.finish();
        }
        body
    }

    /// The next chunk of the body, `None` once complete.
    pub(crate) async fn chunk(&mut self) -> crate::Result<Option<Bytes>> {
        loop {
            match self.state {
                BodyState::Done => return Ok(None),
                BodyState::Length(remaining) => {
                    if remaining == 0 {
                        self.finish();
                        return Ok(None);
                    }
                    let want = remaining.min(READ_CHUNK as u64) as usize;
                    let mut buf = vec![0u8; want];
                    let n = self.read_some(&mut buf).await?;
                    if n == 0 {
                        self.reusable = false;
                        self.finish();
                        return Err(Error::decode(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "response body ended before its declared content-length",
                        )));
                    }
                    self.state = BodyState::Length(remaining - n as u64);
                    buf.truncate(n);
                    return Ok(Some(Bytes::from(buf)));
                }
                BodyState::Chunked { remaining } => {
                    if remaining == 0 {
                        let io = self.conn.as_mut().expect("body after completion").io();
                        let size = chunked::read_chunk_size(io).await?;
                        if size == 0 {
                            chunked::discard_trailers(io).await?;
                            self.finish();
                            return Ok(None);
                        }
                        self.state = BodyState::Chunked { remaining: size };
                        continue;
                    }
                    let want = remaining.min(READ_CHUNK as u64) as usize;
                    let mut buf = vec![0u8; want];
                    let n = self.read_some(&mut buf).await?;
                    if n == 0 {
                        self.reusable = false;
                        self.finish();
                        return Err(Error::decode(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed inside a chunk",
                        )));
                    }
                    let left = remaining - n as u64;
                    self.state = BodyState::Chunked { remaining: left };
                    if left == 0 {
                        let io = self.conn.as_mut().expect("body after completion").io();
                        chunked::read_chunk_end(io).await?;
                    }
                    buf.truncate(n);
                    return Ok(Some(Bytes::from(buf)));
                }
                BodyState::ReadToEnd => {
                    let mut buf = vec![0u8; READ_CHUNK];
                    let n = self.read_some(&mut buf).await?;
                    if n == 0 {
                        // delimited by connection close, never reusable
                        self.reusable = false;
                        self.finish();
                        return Ok(None);
                    }
                    buf.truncate(n);
                    return Ok(Some(Bytes::from(buf)));
                }
            }
        }
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        let io = self.conn.as_mut().expect("body after completion").io();
        io.read(buf).await.map_err(Error::decode)
    }

    fn finish(&mut self) {
        self.state = BodyState::Done;
        if let Some(conn) = self.conn.take() {
            if self.reusable {
                conn.release();
            }
            // otherwise dropped, closing the socket
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn framing_prefers_chunked_over_length() {
        let h = headers(&[("transfer-encoding", "chunked"), ("content-length", "10")]);
        assert_eq!(
            body_framing(&Method::GET, StatusCode::OK, &h).unwrap(),
            BodyFraming::Chunked
        );
    }

    #[test]
    fn framing_rejects_conflicting_lengths() {
        let h = headers(&[("content-length", "10"), ("content-length", "11")]);
        assert!(body_framing(&Method::GET, StatusCode::OK, &h).is_err());
    }

    #[test]
    fn framing_allows_duplicate_equal_lengths() {
        let h = headers(&[("content-length", "10"), ("content-length", "10")]);
        assert_eq!(
            body_framing(&Method::GET, StatusCode::OK, &h).unwrap(),
            BodyFraming::ContentLength(10)
        );
    }

    #[test]
    fn head_responses_have_no_body() {
        let h = headers(&[("content-length", "10")]);
        assert_eq!(
            body_framing(&Method::HEAD, StatusCode::OK, &h).unwrap(),
            BodyFraming::NoBody
        );
        assert_eq!(
            body_framing(&Method::GET, StatusCode::NO_CONTENT, &headers(&[])).unwrap(),
            BodyFraming::NoBody
        );
    }

    #[test]
    fn reuse_rules() {
        assert!(may_reuse(Version::HTTP_11, &headers(&[])));
        assert!(!may_reuse(
            Version::HTTP_11,
            &headers(&[("connection", "close")])
        ));
        assert!(!may_reuse(Version::HTTP_10, &headers(&[])));
        assert!(may_reuse(
            Version::HTTP_10,
            &headers(&[("connection", "keep-alive")])
        ));
    }
}
