#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # httpc
//!
//! An async HTTP client for both HTTP/1.1 and HTTP/2, with its own h2
//! multiplexing core, connection pooling, TLS (ALPN) and HTTP CONNECT
//! proxy support.
//!
//! - Request/response API with streaming bodies
//! - Per-host connection pool; one shared h2 connection carries any number
//!   of concurrent streams
//! - DNS resolver with a custom server and static host overrides
//! - Transparent retry on a fresh connection when the peer refuses a
//!   stream or shuts down gracefully
//!
//! ## Making a GET request
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), httpc::Error> {
//! let body = httpc::Client::new()
//!     .get("https://www.rust-lang.org")
//!     .send()
//!     .await?
//!     .text()
//!     .await?;
//!
//! println!("body = {body:?}");
//! # Ok(())
//! # }
//! ```
//!
//! **NOTE**: If you plan to perform multiple requests, create a [`Client`]
//! once and reuse it, taking advantage of keep-alive pooling and h2
//! multiplexing.
//!
//! ## POST with a body
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), httpc::Error> {
//! let client = httpc::Client::new();
//! let res = client
//!     .post("http://httpbin.org/post")
//!     .body("the exact body that is sent")
//!     .send()
//!     .await?;
//! # drop(res);
//! # Ok(())
//! # }
//! ```

pub use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
pub use url::Url;

pub use self::body::Body;
pub use self::client::{Client, ClientBuilder, RequestBuilder};
pub use self::dns::{AddressFamily, ResolverConfig};
pub use self::error::{BoxError, Error, Result};
pub use self::into_url::IntoUrl;
/// The HTTP/2 multiplexing core, usable directly over any negotiated
/// byte stream.
pub use self::proto::h2;
pub use self::proto::h2::{ConnectionError, Origin, Reason, Stats, StreamError};
pub use self::proxy::Proxy;
pub use self::request::Request;
pub use self::response::Response;

mod body;
mod client;
mod connect;
mod dns;
mod error;
mod into_url;
mod pool;
mod proto;
mod proxy;
mod request;
mod response;
mod sync;
