//! HTTP/2 client multiplexing core.
//!
//! One [`Connection`] owns a TLS-negotiated byte stream and shares it across
//! many concurrent logical [`Stream`]s with flow control, settings
//! negotiation, HPACK header compression and stream lifecycle management.
//! Server-side h2 and PUSH are out of scope; a pushed stream is refused.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) mod codec;
pub(crate) mod conn;
pub(crate) mod flow;
pub(crate) mod frame;
pub(crate) mod hpack;
pub(crate) mod settings;
pub(crate) mod stream;

pub use frame::Reason;

pub use conn::Connection;
pub use stream::{RecvStream, RequestHead, ResponseHead, Stream};

/// A connection-level failure: a GOAWAY we sent or received, or the death
/// of the underlying transport. Every active stream terminates with a
/// wrapper error naming this cause.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    inner: ConnErrorKind,
}

#[derive(Debug, Clone)]
enum ConnErrorKind {
    GoAway {
        code: Reason,
        debug: String,
        remote: bool,
        last_stream_id: u32,
    },
    Io(Arc<io::Error>),
}

impl ConnectionError {
    pub(crate) fn local(code: Reason, debug: &str) -> ConnectionError {
        ConnectionError {
            inner: ConnErrorKind::GoAway {
                code,
                debug: debug.to_owned(),
                remote: false,
                last_stream_id: 0,
            },
        }
    }

    pub(crate) fn remote_goaway(code: Reason, debug: String, last_stream_id: u32) -> ConnectionError {
        ConnectionError {
            inner: ConnErrorKind::GoAway {
                code,
                debug,
                remote: true,
                last_stream_id,
            },
        }
    }

    pub(crate) fn io(err: io::Error) -> ConnectionError {
        ConnectionError {
            inner: ConnErrorKind::Io(Arc::new(err)),
        }
    }

    /// The h2 error code, when the connection died by GOAWAY.
    pub fn code(&self) -> Option<Reason> {
        match self.inner {
            ConnErrorKind::GoAway { code, .. } => Some(code),
            ConnErrorKind::Io(_) => None,
        }
    }

    /// True when the peer terminated the connection.
    pub fn is_remote(&self) -> bool {
        matches!(self.inner, ConnErrorKind::GoAway { remote: true, .. })
    }

    /// A peer shedding load with GOAWAY leaves a fresh connection likely to
    /// succeed; transport death before anything was sent does too.
    pub fn is_retryable(&self) -> bool {
        match self.inner {
            ConnErrorKind::GoAway { remote, .. } => remote,
            ConnErrorKind::Io(_) => false,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ConnErrorKind::GoAway {
                code,
                debug,
                remote,
                ..
            } => {
                let direction = if *remote { "received" } else { "sent" };
                write!(f, "connection error ({direction} GOAWAY): {code}")?;
                if !debug.is_empty() {
                    write!(f, ": {debug}")?;
                }
                Ok(())
            }
            ConnErrorKind::Io(err) => write!(f, "connection error: {err}"),
        }
    }
}

impl StdError for ConnectionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.inner {
            ConnErrorKind::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Where a stream reset originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// A stream-level failure: a reset (sent or received), caller cancellation,
/// or an abort inherited from the connection.
#[derive(Debug, Clone)]
pub struct StreamError {
    id: u32,
    code: Reason,
    origin: Origin,
    retryable: bool,
    conn: Option<Box<ConnectionError>>,
}

impl StreamError {
    pub(crate) fn reset_local(id: u32, code: Reason) -> StreamError {
        StreamError {
            id,
            code,
            origin: Origin::Local,
            retryable: false,
            conn: None,
        }
    }

    pub(crate) fn reset_remote(id: u32, code: Reason) -> StreamError {
        StreamError {
            id,
            code,
            origin: Origin::Remote,
            retryable: code == Reason::REFUSED_STREAM,
            conn: None,
        }
    }

    pub(crate) fn cancelled(id: u32) -> StreamError {
        StreamError {
            id,
            code: Reason::CANCEL,
            origin: Origin::Local,
            retryable: false,
            conn: None,
        }
    }

    pub(crate) fn conn_abort(id: u32, cause: ConnectionError, retryable: bool) -> StreamError {
        StreamError {
            id,
            code: cause.code().unwrap_or(Reason::INTERNAL_ERROR),
            origin: if cause.is_remote() {
                Origin::Remote
            } else {
                Origin::Local
            },
            retryable,
            conn: Some(Box::new(cause)),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.id
    }

    pub fn code(&self) -> Reason {
        self.code
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// True when a fresh connection should be able to carry this request:
    /// the peer refused the stream before processing it, or declared it
    /// unprocessed in a GOAWAY.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == Reason::CANCEL && self.origin == Origin::Local && self.conn.is_none()
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(conn) = &self.conn {
            return write!(f, "stream {} aborted: {conn}", self.id);
        }
        let direction = match self.origin {
            Origin::Local => "reset by us",
            Origin::Remote => "reset by peer",
        };
        write!(f, "stream {} {direction}: {:?}", self.id, self.code)
    }
}

impl StdError for StreamError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.conn.as_deref().map(|c| c as _)
    }
}

/// Per-connection counters.
#[derive(Debug, Default)]
pub(crate) struct ConnStats {
    pub(crate) streams_opened: AtomicU64,
    pub(crate) streams_closed: AtomicU64,
    pub(crate) streams_reset: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
}

impl ConnStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_closed: self.streams_closed.load(Ordering::Relaxed),
            streams_reset: self.streams_reset.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of a connection's counters.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub streams_opened: u64,
    pub streams_closed: u64,
    pub streams_reset: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}
