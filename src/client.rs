//! The `Client`: configuration, pooling and the request round-trip.

use std::sync::Arc;
use std::time::Duration;

use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Version};
use log::debug;

use crate::body::Body;
use crate::connect::Connector;
use crate::dns::{Resolver, ResolverConfig};
use crate::error::{Error, TimedOut};
use crate::into_url::IntoUrl;
use crate::pool::{Checkout, Pool};
use crate::proto::h1;
use crate::proto::h2;
use crate::proxy::Proxy;
use crate::request::{PreparedRequest, Request};
use crate::response::{Response, ResponseBody};

/// An asynchronous HTTP client.
///
/// Cheap to clone: clones share the connection pool, so create one and
/// reuse it.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientRef>,
}

#[derive(Debug)]
struct ClientRef {
    connector: Connector,
    pool: Pool,
    default_headers: HeaderMap,
    request_timeout: Option<Duration>,
}

/// A builder for a [`Client`].
#[derive(Debug)]
pub struct ClientBuilder {
    resolver: ResolverConfig,
    proxy: Option<Proxy>,
    default_headers: HeaderMap,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    pool_max_per_host: usize,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Duration,
    nodelay: bool,
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder::new()
    }
}

impl ClientBuilder {
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            resolver: ResolverConfig::default(),
            proxy: None,
            default_headers: HeaderMap::new(),
            connect_timeout: None,
            request_timeout: None,
            pool_max_per_host: 100,
            pool_max_idle_per_host: 80,
            pool_idle_timeout: Duration::from_secs(90),
            nodelay: true,
        }
    }

    /// DNS resolution settings: custom server, static overrides, family.
    pub fn resolver(mut self, config: ResolverConfig) -> ClientBuilder {
        self.resolver = config;
        self
    }

    /// Tunnels all requests through the given proxy.
    pub fn proxy(mut self, proxy: Proxy) -> ClientBuilder {
        self.proxy = Some(proxy);
        self
    }

    /// Headers applied to every request that doesn't set them itself.
    pub fn default_headers(mut self, headers: HeaderMap) -> ClientBuilder {
        self.default_headers = headers;
        self
    }

    /// A `User-Agent` applied to every request.
    pub fn user_agent(mut self, value: HeaderValue) -> ClientBuilder {
        self.default_headers.insert(header::USER_AGENT, value);
        self
    }

    /// Timeout for establishing a TCP connection.
    pub fn connect_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Total timeout from the start of a request until the response head.
    pub fn timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn pool_max_per_host(mut self, max: usize) -> ClientBuilder {
        self.pool_max_per_host = max.max(1);
        self
    }

    pub fn pool_max_idle_per_host(mut self, max: usize) -> ClientBuilder {
        self.pool_max_idle_per_host = max;
        self
    }

    pub fn pool_idle_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.pool_idle_timeout = timeout;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> ClientBuilder {
        self.nodelay = enabled;
        self
    }

    pub fn build(self) -> crate::Result<Client> {
        let connector = Connector::new(
            Resolver::new(self.resolver),
            self.proxy,
            self.connect_timeout,
            self.nodelay,
        );
        Ok(Client {
            inner: Arc::new(ClientRef {
                connector,
                pool: Pool::new(
                    self.pool_max_per_host,
                    self.pool_max_idle_per_host,
                    self.pool_idle_timeout,
                ),
                default_headers: self.default_headers,
                request_timeout: self.request_timeout,
            }),
        })
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl Client {
    /// A client with default configuration.
    pub fn new() -> Client {
        ClientBuilder::new().build().expect("default client")
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        use crate::into_url::IntoUrlSealed;

        RequestBuilder {
            client: self.clone(),
            request: url.into_url().map(|url| Request::new(method, url)),
        }
    }

    /// Executes a `Request`.
    ///
    /// A request whose stream the peer refused, or that a GOAWAY declared
    /// unprocessed, is transparently retried once on a fresh connection
    /// when its body can be replayed.
    pub async fn execute(&self, request: Request) -> crate::Result<Response> {
        match self.inner.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.execute_inner(request)).await
            {
                Ok(res) => res,
                Err(_) => Err(Error::request(TimedOut)),
            },
            None => self.execute_inner(request).await,
        }
    }

    async fn execute_inner(&self, mut request: Request) -> crate::Result<Response> {
        for (name, value) in self.inner.default_headers.iter() {
            if !request.headers().contains_key(name) {
                request.headers_mut().insert(name, value.clone());
            }
        }

        let url = request.url().clone();
        let mut prepared = request.prepare()?;

        let mut retried = false;
        loop {
            match self.round_trip(&mut prepared).await {
                Ok(response) => return Ok(response),
                Err(err) if !retried && err.is_retryable() && prepared.is_replayable() => {
                    debug!("retrying request to {url} on a fresh connection: {err}");
                    retried = true;
                }
                Err(err) => return Err(err.with_url(url)),
            }
        }
    }

    async fn round_trip(&self, prepared: &mut PreparedRequest) -> crate::Result<Response> {
        let url = prepared.url.clone();
        let scheme = url.scheme().to_owned();
        let host = url
            .host_str()
            .ok_or_else(|| Error::builder("request URL has no host"))?
            .to_owned();
        let port = url
            .port()
            .unwrap_or_else(|| crate::connect::default_port(&scheme));

        let checkout = self
            .inner
            .pool
            .acquire(&self.inner.connector, &scheme, &host, port)
            .await?;

        match checkout {
            Checkout::H2(stream) => self.round_trip_h2(prepared, stream).await,
            Checkout::H1(conn) => self.round_trip_h1(prepared, conn).await,
        }
    }

    async fn round_trip_h2(
        &self,
        prepared: &mut PreparedRequest,
        mut stream: h2::Stream,
    ) -> crate::Result<Response> {
        let mut headers = prepared.headers.clone();
        if prepared.has_body() && prepared.content_length >= 0 {
            headers.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from_str(&prepared.content_length.to_string())
                    .expect("integer header value"),
            );
        }

        let target = prepared.request_target();
        let head = h2::RequestHead {
            method: &prepared.method,
            scheme: prepared.url.scheme(),
            authority: &prepared.host,
            path: &target,
            headers: &headers,
        };

        let end_stream = !prepared.has_body();
        stream.send_headers(head, end_stream).await?;
        if prepared.has_body() {
            let body = prepared.take_body();
            stream
                .send_body(body, prepared.content_length, true)
                .await?;
        }

        let response = stream.read_headers().await?;
        Ok(Response::new(
            response.status,
            Version::HTTP_2,
            response.headers,
            prepared.url.clone(),
            ResponseBody::H2(stream.into_body()),
        ))
    }

    async fn round_trip_h1(
        &self,
        prepared: &mut PreparedRequest,
        mut conn: crate::pool::PooledConn,
    ) -> crate::Result<Response> {
        let body = prepared.take_body();
        h1::write_request(conn.io(), prepared, body).await?;

        // skip interim 1xx responses
        let head = loop {
            let head = h1::read_response_head(&mut conn).await?;
            if !head.status.is_informational() || head.status == http::StatusCode::SWITCHING_PROTOCOLS
            {
                break head;
            }
        };

        let framing = h1::body_framing(&prepared.method, head.status, &head.headers)?;
        let reusable = h1::may_reuse(head.version, &head.headers);
        let body = h1::H1Body::new(conn, framing, reusable);

        Ok(Response::new(
            head.status,
            head.version,
            head.headers.clone(),
            prepared.url.clone(),
            ResponseBody::H1(body),
        ))
    }
}

/// A builder for a single request.
#[derive(Debug)]
pub struct RequestBuilder {
    client: Client,
    request: crate::Result<Request>,
}

impl RequestBuilder {
    /// Adds a header to this request.
    pub fn header<K, V>(mut self, name: K, value: V) -> RequestBuilder
    where
        K: TryInto<HeaderName>,
        K::Error: Into<http::Error>,
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        let mut invalid = None;
        if let Ok(request) = self.request.as_mut() {
            match (name.try_into(), value.try_into()) {
                (Ok(name), Ok(value)) => {
                    request.headers_mut().append(name, value);
                }
                (Err(err), _) => invalid = Some(Error::builder(err.into())),
                (_, Err(err)) => invalid = Some(Error::builder(err.into())),
            }
        }
        if let Some(err) = invalid {
            self.request = Err(err);
        }
        self
    }

    /// Sets the request body.
    pub fn body<B: Into<Body>>(mut self, body: B) -> RequestBuilder {
        if let Ok(request) = self.request.as_mut() {
            *request.body_mut() = Some(body.into());
        }
        self
    }

    /// Builds the request without sending it.
    pub fn build(self) -> crate::Result<Request> {
        self.request
    }

    /// Sends the request.
    pub async fn send(self) -> crate::Result<Response> {
        let request = self.request?;
        self.client.execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_headers_do_not_override() {
        let mut defaults = HeaderMap::new();
        defaults.insert(header::USER_AGENT, HeaderValue::from_static("httpc/test"));
        let client = Client::builder().default_headers(defaults).build().unwrap();

        let req = client
            .get("http://example.com/")
            .header(header::USER_AGENT, "mine/1.0")
            .build()
            .unwrap();
        // the merge happens at execute time; builder keeps the user value
        assert_eq!(req.headers()[header::USER_AGENT.as_str()], "mine/1.0");
        drop(client);
    }

    #[test]
    fn builder_error_surfaces_on_build() {
        let client = Client::new();
        let err = client.get("not a url").build().unwrap_err();
        assert!(err.is_builder());
    }
}
