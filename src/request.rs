//! Request types and preparation.
//!
//! [`Request::prepare`] turns a user-built request into the canonical shape
//! the transports consume: parsed URL, the final `Host` value (a
//! user-supplied `Host` header wins over the URL authority), the header map
//! with `Host` and `Content-Length` stripped, and the content length
//! re-derived from the body (`-1` when unknown).

use http::{HeaderMap, Method};
use url::Url;

use crate::body::Body;
use crate::error::Error;

/// A request ready to be sent with [`Client::execute`](crate::Client::execute).
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Body>,
}

impl Request {
    /// Constructs a new request.
    pub fn new(method: Method, url: Url) -> Request {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn body_mut(&mut self) -> &mut Option<Body> {
        &mut self.body
    }

    /// Canonicalizes this request for transmission.
    pub(crate) fn prepare(self) -> crate::Result<PreparedRequest> {
        let url = self.url;

        let mut host = match url.host_str() {
            Some(host) => host.to_owned(),
            None => {
                return Err(Error::builder("request URL has no host").with_url(url));
            }
        };
        // a non-default port travels in the Host value
        if let Some(port) = url.port() {
            host = format!("{host}:{port}");
        }

        let mut headers = self.headers;
        if let Some(user_host) = headers.remove(http::header::HOST) {
            match user_host.to_str() {
                Ok(value) if !value.is_empty() => host = value.to_owned(),
                _ => {
                    return Err(Error::builder("invalid Host header").with_url(url));
                }
            }
        }
        // always re-derived from the body below
        headers.remove(http::header::CONTENT_LENGTH);

        let content_length = match &self.body {
            Some(body) => body.len().map(|n| n as i64).unwrap_or(-1),
            None => -1,
        };

        Ok(PreparedRequest {
            method: self.method,
            url,
            headers,
            host,
            content_length,
            has_body: self.body.is_some(),
            body: self.body,
        })
    }
}

/// The canonical request shape consumed by the dialer and transports.
#[derive(Debug)]
pub(crate) struct PreparedRequest {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    /// Final `Host` header value / `:authority`.
    pub(crate) host: String,
    /// Request body length; `-1` when unknown.
    pub(crate) content_length: i64,
    /// Whether the request was prepared with a body. Stays true even after
    /// a one-shot body's chunk source has been taken.
    has_body: bool,
    pub(crate) body: Option<Body>,
}

impl PreparedRequest {
    /// The request-target for the request line / `:path` pseudo-header:
    /// path plus query, no fragment.
    pub(crate) fn request_target(&self) -> String {
        let path = self.url.path();
        let path = if path.is_empty() { "/" } else { path };
        match self.url.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_owned(),
        }
    }

    /// Takes the body's chunk source, replacing it with a replayable copy
    /// when one exists, so a retry can re-send the request.
    pub(crate) fn take_body(&mut self) -> crate::body::DataStream {
        match self.body.take() {
            Some(body) => {
                self.body = body.try_clone();
                body.into_data_stream()
            }
            None => crate::body::DataStream::Empty,
        }
    }

    pub(crate) fn has_body(&self) -> bool {
        self.has_body
    }

    pub(crate) fn is_replayable(&self) -> bool {
        match &self.body {
            Some(body) => body.try_clone().is_some(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::into_url::IntoUrlSealed;

    fn request(url: &str) -> Request {
        Request::new(Method::GET, url.into_url().unwrap())
    }

    #[test]
    fn host_comes_from_url() {
        let prepared = request("https://example.com/a").prepare().unwrap();
        assert_eq!(prepared.host, "example.com");
    }

    #[test]
    fn non_default_port_stays_in_host() {
        let prepared = request("https://example.com:8443/").prepare().unwrap();
        assert_eq!(prepared.host, "example.com:8443");
    }

    #[test]
    fn user_host_header_wins_and_is_stripped() {
        let mut req = request("https://example.com/");
        req.headers_mut().insert(
            http::header::HOST,
            http::HeaderValue::from_static("other.test"),
        );
        let prepared = req.prepare().unwrap();
        assert_eq!(prepared.host, "other.test");
        assert!(!prepared.headers.contains_key(http::header::HOST));
    }

    #[test]
    fn content_length_is_rederived() {
        let mut req = request("https://example.com/");
        req.headers_mut().insert(
            http::header::CONTENT_LENGTH,
            http::HeaderValue::from_static("999"),
        );
        *req.body_mut() = Some("abc".into());
        let prepared = req.prepare().unwrap();
        assert_eq!(prepared.content_length, 3);
        assert!(!prepared.headers.contains_key(http::header::CONTENT_LENGTH));
    }

    #[test]
    fn streaming_body_has_unknown_length() {
        let mut req = request("https://example.com/");
        *req.body_mut() = Some(crate::Body::wrap_stream(futures_util::stream::empty()));
        let prepared = req.prepare().unwrap();
        assert_eq!(prepared.content_length, -1);
        assert!(!prepared.is_replayable());
    }

    #[test]
    fn request_target_includes_query() {
        let prepared = request("https://example.com/search?q=1#frag")
            .prepare()
            .unwrap();
        assert_eq!(prepared.request_target(), "/search?q=1");
    }
}
