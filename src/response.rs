//! The response half of the request/response API.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use url::Url;

use crate::error::Error;
use crate::proto::h1::H1Body;
use crate::proto::h2;

/// A server's response to a request.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    url: Url,
    body: ResponseBody,
}

#[derive(Debug)]
pub(crate) enum ResponseBody {
    H1(H1Body),
    H2(h2::RecvStream),
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        url: Url,
        body: ResponseBody,
    ) -> Response {
        Response {
            status,
            version,
            headers,
            url,
            body,
        }
    }

    /// The response's status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The HTTP version this response was received over.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The final URL of this response.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The declared `Content-Length`, when the server sent one.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    /// Streams one chunk of the response body, `None` once complete.
    pub async fn chunk(&mut self) -> crate::Result<Option<Bytes>> {
        match &mut self.body {
            ResponseBody::H1(body) => {
                let chunk = body.chunk().await.map_err(|e| e.with_url(self.url.clone()))?;
                Ok(chunk)
            }
            ResponseBody::H2(stream) => match stream.data().await {
                None => Ok(None),
                Some(Ok(chunk)) => Ok(Some(chunk)),
                Some(Err(err)) => Err(Error::body(err).with_url(self.url.clone())),
            },
        }
    }

    /// Collects the full response body.
    pub async fn bytes(mut self) -> crate::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(
            self.content_length().unwrap_or(0).min(64 * 1024) as usize
        );
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Collects the full response body as text (UTF-8, lossily).
    pub async fn text(self) -> crate::Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Turns responses with 4xx/5xx status codes into errors.
    pub fn error_for_status(self) -> crate::Result<Response> {
        if self.status.is_client_error() || self.status.is_server_error() {
            Err(Error::request(format!("HTTP status {}", self.status)).with_url(self.url))
        } else {
            Ok(self)
        }
    }
}
